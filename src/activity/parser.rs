//! Parser for the declarative activity-definition grammar (spec §4.6/§6):
//!
//! ```text
//! >> phone_then_leave
//! x = person
//! y = car
//! ( x use_phone )
//! ( x move ) and ( x near y ) or ( x sit )
//! ( x leave y )
//! ```
//!
//! `>>` starts a new definition named by the rest of the line. `name = class`
//! lines declare the definition's variables and the class each must bind to.
//! Every other non-blank line is one stage: `( subject verb [object] )` is
//! one atomic act pattern, `and` joins atoms into a conjunction, `or`
//! separates alternative conjunctions (disjunction) within the stage.
//!
//! Grounded stylistically on the teacher's `query_engine.rs` tokenizer
//! (regex-driven line classification, `Vec<Token>` intermediate form) rather
//! than reusing any of its SQL-specific logic.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, PartialEq)]
pub struct AtomicActPattern {
    pub act_name: String,
    pub vars: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conjunction {
    pub atoms: Vec<AtomicActPattern>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub alternatives: Vec<Conjunction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityDef {
    pub name: String,
    /// Declared variable name -> required track class (e.g. "person", "car").
    pub vars: HashMap<String, String>,
    pub stages: Vec<Stage>,
}

static HEADER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^>>\s*(\S+)\s*$").unwrap());
static VARDECL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\w+)\s*=\s*(\w+)\s*$").unwrap());
/// `( subject verb [object] )` — spec §6's atomic-act surface syntax.
static ATOM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\(\s*(\w+)\s+(\w+)(?:\s+(\w+))?\s*\)$").unwrap());
static OR_SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\)\s*or\s*\(").unwrap());
static AND_SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\)\s*and\s*\(").unwrap());

#[derive(Debug)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}
impl std::error::Error for ParseError {}

/// Parses a whole definitions file, which may contain multiple `>>`-headed
/// activity definitions back to back.
pub fn parse_definitions(text: &str) -> Result<Vec<ActivityDef>, ParseError> {
    let mut defs = Vec::new();
    let mut current: Option<ActivityDef> = None;

    for (i, raw_line) in text.lines().enumerate() {
        let lineno = i + 1;
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        if let Some(caps) = HEADER_RE.captures(line) {
            if let Some(def) = current.take() {
                defs.push(def);
            }
            current = Some(ActivityDef { name: caps[1].to_string(), vars: HashMap::new(), stages: Vec::new() });
            continue;
        }

        let def = current.as_mut().ok_or_else(|| ParseError {
            line: lineno,
            message: "content before any '>> name' header".to_string(),
        })?;

        if let Some(caps) = VARDECL_RE.captures(line) {
            def.vars.insert(caps[1].to_string(), caps[2].to_string());
            continue;
        }

        def.stages.push(parse_stage(line, lineno)?);
    }
    if let Some(def) = current.take() {
        defs.push(def);
    }
    for def in &defs {
        validate(def)?;
    }
    Ok(defs)
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Splits a stage line on a keyword boundary (`) or (` / `) and (`) without
/// losing the parens, which stay attached to the atom text on either side.
fn split_on_boundary(text: &str, boundary: &Regex) -> Vec<String> {
    boundary
        .replace_all(text, ")\u{0}(")
        .split('\u{0}')
        .map(|s| s.trim().to_string())
        .collect()
}

fn parse_stage(line: &str, lineno: usize) -> Result<Stage, ParseError> {
    let mut alternatives = Vec::new();
    for alt_text in split_on_boundary(line, &OR_SPLIT_RE) {
        let mut atoms = Vec::new();
        for atom_text in split_on_boundary(&alt_text, &AND_SPLIT_RE) {
            atoms.push(parse_atom(&atom_text, lineno)?);
        }
        alternatives.push(Conjunction { atoms });
    }
    Ok(Stage { alternatives })
}

fn parse_atom(src: &str, lineno: usize) -> Result<AtomicActPattern, ParseError> {
    let caps = ATOM_RE
        .captures(src)
        .ok_or_else(|| ParseError { line: lineno, message: format!("malformed atomic act '{src}'") })?;
    let subject = caps[1].to_string();
    let act_name = caps[2].to_string();
    let mut vars = vec![subject];
    if let Some(obj) = caps.get(3) {
        vars.push(obj.as_str().to_string());
    }
    Ok(AtomicActPattern { act_name, vars })
}

fn validate(def: &ActivityDef) -> Result<(), ParseError> {
    if def.stages.is_empty() {
        return Err(ParseError { line: 0, message: format!("activity '{}' declares no stages", def.name) });
    }
    for stage in &def.stages {
        for alt in &stage.alternatives {
            for atom in &alt.atoms {
                for v in &atom.vars {
                    if !def.vars.contains_key(v) {
                        return Err(ParseError {
                            line: 0,
                            message: format!("activity '{}' references undeclared variable '{v}'", def.name),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_definition_with_disjunctive_stage() {
        let text = "\
>> phone_then_leave
x = person
y = car
( x use_phone )
( x move ) and ( x near y ) or ( x stop )
( x leave y )
";
        let defs = parse_definitions(text).unwrap();
        assert_eq!(defs.len(), 1);
        let def = &defs[0];
        assert_eq!(def.name, "phone_then_leave");
        assert_eq!(def.vars.get("x"), Some(&"person".to_string()));
        assert_eq!(def.stages.len(), 3);
        assert_eq!(def.stages[1].alternatives.len(), 2);
        assert_eq!(def.stages[1].alternatives[0].atoms.len(), 2);
        assert_eq!(def.stages[2].alternatives[0].atoms[0].act_name, "leave");
        assert_eq!(def.stages[2].alternatives[0].atoms[0].vars, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn rejects_undeclared_variable() {
        let text = "\
>> bad
x = person
( z use_phone )
";
        assert!(parse_definitions(text).is_err());
    }

    #[test]
    fn multiple_definitions_in_one_file() {
        let text = "\
>> a
x = person
( x sit )

>> b
y = car
( y move )
";
        let defs = parse_definitions(text).unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].name, "a");
        assert_eq!(defs[1].name, "b");
    }
}
