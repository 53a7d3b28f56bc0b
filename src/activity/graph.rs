//! Activity-graph instance matching (spec §4.6): each [`ActivityDef`] spawns
//! [`GraphInstance`]s on demand as incoming acts satisfy its first stage, and
//! advances or evicts them as later acts arrive.
//!
//! Cross-camera tube ids are not globally unique, so every act is matched
//! under a `cam_id|tube_id` fingerprint rather than the raw tube id, and
//! `subject_dict` stores fingerprints. The observed (and frozen) matching
//! quirk: once an instance is past stage 0, only `alternatives[0]` of its
//! current stage is tried — the remaining alternatives only ever matter at
//! activation time, when a brand new instance is cloned per matching
//! alternative.

use std::collections::HashMap;

use crate::activity::parser::{ActivityDef, AtomicActPattern, Conjunction};
use crate::model::Act;

pub type Fingerprint = String;

fn fingerprint(cam_id: &str, tube_id: u64) -> Fingerprint {
    format!("{cam_id}|{tube_id}")
}

/// Reverses a `cam_id|tube_id` fingerprint back into its plain tube id (spec
/// §4.6's "rewritten back to tube_id" step for a completed activity's
/// subjects). Returns `None` if the fingerprint isn't one `fingerprint()`
/// produced.
pub fn tube_id_of(fp: &Fingerprint) -> Option<u64> {
    fp.rsplit_once('|').and_then(|(_, id)| id.parse().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Advancing,
    Completed,
    Evicted,
}

#[derive(Debug, Clone)]
pub struct GraphInstance {
    pub def_name: String,
    pub subject_dict: HashMap<String, Fingerprint>,
    pub stage_pointer: usize,
    /// Which atoms of the active stage's locked-in alternative have matched.
    matched_flags: Vec<bool>,
    pub state: InstanceState,
    pub matched_acts: Vec<Act>,
    pub last_frame_id: u64,
}

impl GraphInstance {
    fn new(def_name: String, subject_dict: HashMap<String, Fingerprint>, stage_size: usize, frame_id: u64) -> Self {
        Self {
            def_name,
            subject_dict,
            stage_pointer: 0,
            matched_flags: vec![false; stage_size],
            state: InstanceState::Pending,
            matched_acts: Vec::new(),
            last_frame_id: frame_id,
        }
    }

    fn stage_complete(&self) -> bool {
        self.matched_flags.iter().all(|&f| f)
    }
}

/// Attempt to bind an atomic act pattern's variables against an incoming act,
/// extending `bindings` in place. Returns `false` (without mutating further)
/// on a binding conflict — a variable already bound to a different
/// fingerprint than this act would require, or on a class mismatch — the
/// atom's variable is declared (in `var_types`) as a class the act's subject
/// doesn't carry (e.g. `x = person` but the act's `class1` is `"car"`).
fn try_bind(
    atom: &AtomicActPattern,
    var_types: &HashMap<String, String>,
    act: &Act,
    bindings: &mut HashMap<String, Fingerprint>,
) -> bool {
    if act.act_name != atom.act_name {
        return false;
    }
    let act_subjects: Vec<(&str, u64)> = match &act.class2 {
        Some(c2) => vec![(act.class1.as_str(), act.tube1), (c2.as_str(), act.tube2.unwrap())],
        None => vec![(act.class1.as_str(), act.tube1)],
    };
    if act_subjects.len() != atom.vars.len() {
        return false;
    }
    for (var, (class, _)) in atom.vars.iter().zip(act_subjects.iter()) {
        if let Some(declared) = var_types.get(var) {
            if declared != class {
                return false;
            }
        }
    }

    let mut staged = bindings.clone();
    for (var, (_, tube_id)) in atom.vars.iter().zip(act_subjects.iter()) {
        let fp = fingerprint(&act.cam_id_hint, *tube_id);
        match staged.get(var) {
            Some(existing) if *existing != fp => return false,
            Some(_) => {}
            None => {
                staged.insert(var.clone(), fp);
            }
        }
    }
    *bindings = staged;
    true
}

/// Try to satisfy one atom of `conjunction` against `act`, given the
/// instance's already-matched flags and current bindings. Returns the index
/// of the atom that matched, if any atom not yet matched is satisfied.
fn match_conjunction_atom(
    conjunction: &Conjunction,
    matched_flags: &[bool],
    var_types: &HashMap<String, String>,
    bindings: &mut HashMap<String, Fingerprint>,
    act: &Act,
) -> Option<usize> {
    for (i, atom) in conjunction.atoms.iter().enumerate() {
        if matched_flags[i] {
            continue;
        }
        let mut candidate = bindings.clone();
        if try_bind(atom, var_types, act, &mut candidate) {
            *bindings = candidate;
            return Some(i);
        }
    }
    None
}

/// Runs all registered [`ActivityDef`]s against a stream of acts, maintaining
/// a bounded cache of in-flight [`GraphInstance`]s.
pub struct ActivityGraphEngine {
    defs: Vec<ActivityDef>,
    instances: HashMap<u64, GraphInstance>,
    insertion_order: std::collections::VecDeque<u64>,
    next_id: u64,
    max_cache_size: usize,
}

impl ActivityGraphEngine {
    pub fn new(defs: Vec<ActivityDef>, max_cache_size: usize) -> Self {
        Self {
            defs,
            instances: HashMap::new(),
            insertion_order: std::collections::VecDeque::new(),
            next_id: 1,
            max_cache_size,
        }
    }

    /// Feed one camera-window's worth of acts (already fingerprint-ready,
    /// i.e. carrying `cam_id_hint`). Returns the completed activities'
    /// defining names as informational output; instances stay cached until
    /// completed or evicted, per spec's observed no-premature-drop guarantee.
    pub fn observe(&mut self, acts: &[Act]) -> Vec<(String, GraphInstance)> {
        let mut completed = Vec::new();

        // Advance existing instances first, alt0-only (frozen quirk above).
        for instance in self.instances.values_mut() {
            if instance.state == InstanceState::Completed || instance.state == InstanceState::Evicted {
                continue;
            }
            let def = self.defs.iter().find(|d| d.name == instance.def_name);
            let Some(def) = def else { continue };
            let Some(stage) = def.stages.get(instance.stage_pointer) else { continue };
            let Some(alt0) = stage.alternatives.first() else { continue };

            for act in acts {
                let mut bindings = instance.subject_dict.clone();
                if let Some(atom_idx) =
                    match_conjunction_atom(alt0, &instance.matched_flags, &def.vars, &mut bindings, act)
                {
                    instance.subject_dict = bindings;
                    instance.matched_flags[atom_idx] = true;
                    instance.matched_acts.push(act.clone());
                    instance.last_frame_id = act.frame_id;
                    instance.state = InstanceState::Advancing;
                }
            }

            if instance.stage_complete() {
                instance.stage_pointer += 1;
                if instance.stage_pointer >= def.stages.len() {
                    instance.state = InstanceState::Completed;
                    completed.push((instance.def_name.clone(), instance.clone()));
                } else {
                    let next_size = def.stages[instance.stage_pointer].alternatives[0].atoms.len();
                    instance.matched_flags = vec![false; next_size];
                }
            }
        }
        self.instances.retain(|_, inst| inst.state != InstanceState::Completed);

        // Activate new instances: every alternative of stage 0 that an
        // incoming act can seed gets its own cloned instance.
        for def in &self.defs {
            let Some(stage0) = def.stages.first() else { continue };
            for alt in &stage0.alternatives {
                for act in acts {
                    let mut bindings = HashMap::new();
                    let matched_flags = vec![false; alt.atoms.len()];
                    if let Some(atom_idx) = match_conjunction_atom(alt, &matched_flags, &def.vars, &mut bindings, act) {
                        if self.already_tracking(&def.name, &bindings) {
                            continue;
                        }
                        let mut instance = GraphInstance::new(def.name.clone(), bindings, alt.atoms.len(), act.frame_id);
                        instance.matched_flags[atom_idx] = true;
                        instance.matched_acts.push(act.clone());
                        instance.state = InstanceState::Advancing;

                        if instance.stage_complete() {
                            if def.stages.len() == 1 {
                                instance.state = InstanceState::Completed;
                                completed.push((instance.def_name.clone(), instance));
                                continue;
                            }
                            instance.stage_pointer = 1;
                            let next_size = def.stages[1].alternatives[0].atoms.len();
                            instance.matched_flags = vec![false; next_size];
                        }
                        self.insert_instance(instance);
                    }
                }
            }
        }

        // Spec §4.6 activation rule: after a packet's acts are fully
        // consumed, any active instance that made no progress at all this
        // run (still sitting at stage_pointer == 0) is evicted rather than
        // kept around hoping a later packet completes its first stage.
        let stale: Vec<u64> = self
            .instances
            .iter()
            .filter(|(_, inst)| inst.state != InstanceState::Completed && inst.stage_pointer == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(inst) = self.instances.get_mut(&id) {
                inst.state = InstanceState::Evicted;
            }
            self.instances.remove(&id);
            self.insertion_order.retain(|&x| x != id);
        }

        completed
    }

    fn already_tracking(&self, def_name: &str, bindings: &HashMap<String, Fingerprint>) -> bool {
        self.instances.values().any(|inst| {
            inst.def_name == def_name
                && inst.state != InstanceState::Completed
                && inst.state != InstanceState::Evicted
                && bindings.iter().all(|(k, v)| inst.subject_dict.get(k) == Some(v))
        })
    }

    fn insert_instance(&mut self, instance: GraphInstance) {
        let id = self.next_id;
        self.next_id += 1;
        self.instances.insert(id, instance);
        self.insertion_order.push_back(id);
        while self.insertion_order.len() > self.max_cache_size {
            if let Some(evict_id) = self.insertion_order.pop_front() {
                if let Some(inst) = self.instances.get_mut(&evict_id) {
                    inst.state = InstanceState::Evicted;
                }
                self.instances.remove(&evict_id);
            }
        }
    }

    pub fn def(&self, name: &str) -> Option<&ActivityDef> {
        self.defs.iter().find(|d| d.name == name)
    }

    pub fn active_count(&self) -> usize {
        self.instances
            .values()
            .filter(|i| i.state != InstanceState::Completed && i.state != InstanceState::Evicted)
            .count()
    }
}
