//! ActivityComposer (spec §4.6): loads a declarative activity-definition
//! file, matches a camera window's acts (plus ReID cross-camera hints)
//! against all registered definitions, and reports completed activities.

pub mod graph;
pub mod parser;

use std::collections::{HashMap, VecDeque};

use crate::config::ActivityComposerConfig;
use crate::model::Act;

pub use graph::{ActivityGraphEngine, GraphInstance, InstanceState};
pub use parser::{parse_definitions, ActivityDef};

/// Picks the first two `person`-typed bound subjects out of a completed
/// instance (spec §4.6, ground truth `to_act`'s "select the first two person
/// as the act performer"), reversing each `cam_id|tube_id` fingerprint back
/// to a plain tube id. Variable order follows each stage's atoms in
/// declaration order, deduplicated on first occurrence.
fn person_subjects(def: &ActivityDef, instance: &GraphInstance) -> Vec<(String, u64)> {
    let mut seen = std::collections::HashSet::new();
    let mut result = Vec::new();
    for stage in &def.stages {
        for alt in &stage.alternatives {
            for atom in &alt.atoms {
                for var in &atom.vars {
                    if !seen.insert(var.clone()) {
                        continue;
                    }
                    if def.vars.get(var).map(|c| c == "person").unwrap_or(false) {
                        if let Some(fp) = instance.subject_dict.get(var) {
                            if let Some(tube_id) = graph::tube_id_of(fp) {
                                result.push((var.clone(), tube_id));
                            }
                        }
                    }
                }
            }
        }
    }
    result
}

/// Informational acts keep at most this many recent act names per tube, so
/// a ReID "From Cam-X" synthesis has something concrete to summarize.
const ACT_HISTORY_LEN: usize = 5;

/// Top-level composer: owns the parsed definitions and the matching engine,
/// and synthesizes informational ReID acts before handing everything to the
/// matcher.
pub struct ActivityComposer {
    engine: ActivityGraphEngine,
    /// Rolling last-`ACT_HISTORY_LEN` act names per `(cam_id, tube_id)`, kept
    /// so a tube that gets ReID'd into another camera's window still has a
    /// trail to summarize in its "From Cam-X" informational act even though
    /// it has since left this camera's frame.
    act_history: HashMap<(String, u64), VecDeque<String>>,
}

impl ActivityComposer {
    pub fn new(cfg: &ActivityComposerConfig) -> anyhow::Result<Self> {
        let defs = match &cfg.definitions_path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| anyhow::anyhow!("reading activity definitions {path}: {e}"))?;
                parse_definitions(&text).map_err(|e| anyhow::anyhow!("parsing activity definitions: {e}"))?
            }
            None => Vec::new(),
        };
        Ok(Self { engine: ActivityGraphEngine::new(defs, cfg.max_graph_cache_size), act_history: HashMap::new() })
    }

    pub fn with_definitions(defs: Vec<ActivityDef>, max_cache_size: usize) -> Self {
        Self { engine: ActivityGraphEngine::new(defs, max_cache_size), act_history: HashMap::new() }
    }

    /// Process one camera window: `acts` are the spatial/neural acts
    /// produced for this window (already tagged with their source camera),
    /// `reid` maps this camera's tube ids to `(prev_cam, prev_tube_id)` for
    /// tubes ReID just confirmed as continuations. Returns the acts to
    /// forward downstream: completed-activity names as `Act`s plus
    /// synthesized "from camera X" informational acts.
    pub fn process_window(
        &mut self,
        cam_id: &str,
        acts: &[Act],
        reid: &HashMap<u64, (String, u64)>,
        frame_id: u64,
    ) -> Vec<Act> {
        let mut tagged: Vec<Act> = acts.iter().map(|a| a.clone().with_cam(cam_id)).collect();
        tagged.extend(self.reid_informational_acts(cam_id, reid, frame_id));

        let completed = self.engine.observe(&tagged);
        let out: Vec<Act> = completed
            .into_iter()
            .map(|(name, instance)| {
                let subjects =
                    self.engine.def(&name).map(|def| person_subjects(def, &instance)).unwrap_or_default();
                let mut act = match subjects.first() {
                    Some((_, tube1)) => {
                        Act::single(format!("activity:{name}"), "person", *tube1, frame_id).with_cam(cam_id)
                    }
                    None => Act::single(format!("activity:{name}"), "activity", 0, frame_id).with_cam(cam_id),
                };
                if let Some((_, tube2)) = subjects.get(1) {
                    act.class2 = Some("person".to_string());
                    act.tube2 = Some(*tube2);
                }
                act
            })
            .collect();
        self.record_history(cam_id, &out);
        out
    }

    pub fn active_instance_count(&self) -> usize {
        self.engine.active_count()
    }

    fn record_history(&mut self, cam_id: &str, acts: &[Act]) {
        for act in acts {
            let history = self.act_history.entry((cam_id.to_string(), act.tube1)).or_default();
            history.push_back(act.act_name.clone());
            if history.len() > ACT_HISTORY_LEN {
                history.pop_front();
            }
            if let Some(tube2) = act.tube2 {
                let history = self.act_history.entry((cam_id.to_string(), tube2)).or_default();
                history.push_back(act.act_name.clone());
                if history.len() > ACT_HISTORY_LEN {
                    history.pop_front();
                }
            }
        }
    }

    /// One informational act per ReID-confirmed tube (spec §4.6): `act_name
    /// = "From Cam-<prev_cam>: <last-5 acts of (prev_cam,prev_id)>"`, tied to
    /// the current tube so downstream renderers can show continuity.
    fn reid_informational_acts(&self, cam_id: &str, reid: &HashMap<u64, (String, u64)>, frame_id: u64) -> Vec<Act> {
        reid.iter()
            .map(|(tube_id, (prev_cam, prev_tube_id))| {
                let trail = self
                    .act_history
                    .get(&(prev_cam.clone(), *prev_tube_id))
                    .map(|h| h.iter().cloned().collect::<Vec<_>>().join(","))
                    .unwrap_or_default();
                let name = format!("From Cam-{prev_cam}: {trail}");
                Act::single(name, "person", *tube_id, frame_id).with_cam(cam_id)
            })
            .collect()
    }
}
