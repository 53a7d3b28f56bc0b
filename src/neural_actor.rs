//! NeuralActor (spec §4.5): buffers each tube's clips into fixed-size ring
//! windows, batches `NN_BATCH` tube-windows at a time (padding short of a
//! full batch with dummy tubes) and runs them through an [`ActionClassifier`],
//! filtering predictions by a per-class confidence table.
//!
//! Grounded on the teacher's `scene_buffer.rs::MinuteBuffer` (ring capacity,
//! `should_flush`/`drain`/`force_drain`) generalized from a single time-based
//! ring to a per-tube, per-label-threshold batch assembler.

use std::collections::HashMap;

use crate::config::NeuralActorConfig;
use crate::errors::Result;
use crate::model::{Act, Frame, Tube, TubeClip};

/// External collaborator interface: runs one batch of tube-windows through
/// an action-recognition model. `windows[i]` corresponds to `out[i]`, one
/// `Vec<(label, score)>` of predictions per tube-window (already
/// independent of what labels exist; thresholding happens in this module).
pub trait ActionClassifier: Send + Sync {
    fn classify_batch(&self, windows: &[Vec<TubeClip>]) -> Result<Vec<Vec<(String, f32)>>>;
}

/// Scripted classifier for tests.
pub struct MockActionClassifier {
    script: std::sync::Mutex<std::collections::VecDeque<Vec<Vec<(String, f32)>>>>,
}

impl MockActionClassifier {
    pub fn new(script: Vec<Vec<Vec<(String, f32)>>>) -> Self {
        Self { script: std::sync::Mutex::new(script.into()) }
    }
}

impl ActionClassifier for MockActionClassifier {
    fn classify_batch(&self, windows: &[Vec<TubeClip>]) -> Result<Vec<Vec<(String, f32)>>> {
        let mut script = self.script.lock().unwrap();
        Ok(script.pop_front().unwrap_or_else(|| vec![Vec::new(); windows.len()]))
    }
}

/// Per-class acceptance threshold (spec §4.5): a prediction below its own
/// class's threshold is discarded even if it would otherwise be top-5.
pub fn class_threshold(label: &str) -> f32 {
    match label {
        "use_phone" => 0.20,
        "carry" => 0.10,
        "use_computer" => 0.20,
        "talk" => 0.20,
        "sit" => 0.20,
        "ride" => 0.18,
        _ => 0.20,
    }
}

const TOP_K: usize = 5;
const DUMMY_ROI: [f32; 4] = [0.25, 0.25, 0.75, 0.75];

struct TubeRing {
    label: String,
    clips: Vec<TubeClip>,
}

/// A ring is keyed by (cam_id, tube_id): raw tube ids are only unique within
/// one camera's tube table, so a single shared `NeuralActor` serving every
/// camera must not let `camA` tube 3 and `camB` tube 3 share a ring.
type RingKey = (String, u64);

/// One real tube-window popped off a ring, waiting in the pending batch.
type PendingEntry = (RingKey, String, Vec<TubeClip>);

/// Accumulates tube clips across windows until `tube_size` clips are ready,
/// then groups ready tube-windows into fixed-size `nn_batch` batches (padding
/// with dummy tubes) before handing them to the classifier.
///
/// Per spec §4.5's under-fill policy: a pending batch with fewer than
/// `nn_batch / 2` real tube-windows is not submitted right away. It waits up
/// to `max_tube_age_in_cache` more rounds (calls to [`tick`](Self::tick)) for
/// more tubes to become ready, trading latency for batch efficiency.
pub struct NeuralActor<C: ActionClassifier> {
    cfg: NeuralActorConfig,
    classifier: C,
    rings: HashMap<RingKey, TubeRing>,
    pending: Vec<PendingEntry>,
    pending_age: u32,
}

impl<C: ActionClassifier> NeuralActor<C> {
    pub fn new(cfg: NeuralActorConfig, classifier: C) -> Self {
        Self { cfg, classifier, rings: HashMap::new(), pending: Vec::new(), pending_age: 0 }
    }

    /// Feed a newly emitted tube's clips into its ring. Returns any acts
    /// produced by classifier batches that became ready as a result. Does
    /// not age the pending under-fill wait — that only advances on [`tick`].
    ///
    /// Only `person` tubes are candidates (spec §4.5) — other labels are
    /// silently ignored rather than buffered, batched, and classified.
    pub fn ingest(&mut self, tube: &Tube) -> Result<Vec<Act>> {
        if tube.label != "person" {
            return Ok(Vec::new());
        }
        let key = (tube.cam_id.clone(), tube.tube_id);
        let ring = self
            .rings
            .entry(key)
            .or_insert_with(|| TubeRing { label: tube.label.clone(), clips: Vec::new() });
        ring.clips.extend(tube.clips.iter().cloned());

        self.collect_ready();
        self.maybe_submit(false)
    }

    /// Advance one batcher-window round: pop any newly-ready tube windows
    /// into the pending batch, then age the under-fill wait by one round and
    /// force-submit if the age limit is reached.
    pub fn tick(&mut self) -> Result<Vec<Act>> {
        self.collect_ready();
        self.maybe_submit(true)
    }

    /// Move every ring that has accumulated a full `tube_size` window into
    /// the pending batch (FIFO, oldest clips first).
    fn collect_ready(&mut self) {
        let tube_size = self.cfg.tube_size;
        for (key, ring) in self.rings.iter_mut() {
            while ring.clips.len() >= tube_size {
                let window: Vec<TubeClip> = ring.clips.drain(0..tube_size).collect();
                self.pending.push((key.clone(), ring.label.clone(), window));
            }
        }
    }

    /// Decide whether the pending batch should be submitted now:
    /// - full `nn_batch` worth of real tubes: submit whole batches immediately.
    /// - at least half a batch: submit the remainder right away.
    /// - otherwise: age the wait by one round (only when `advance_age` is set,
    ///   i.e. called from `tick`) and force-submit once the age limit passes.
    fn maybe_submit(&mut self, advance_age: bool) -> Result<Vec<Act>> {
        let nn_batch = self.cfg.nn_batch.max(1);
        let mut acts = Vec::new();

        while self.pending.len() >= nn_batch {
            let chunk: Vec<PendingEntry> = self.pending.drain(0..nn_batch).collect();
            acts.extend(self.submit_chunk(chunk)?);
            self.pending_age = 0;
        }

        if self.pending.is_empty() {
            self.pending_age = 0;
            return Ok(acts);
        }

        let half_full = self.pending.len() * 2 >= nn_batch;
        if half_full {
            let chunk = std::mem::take(&mut self.pending);
            acts.extend(self.submit_chunk(chunk)?);
            self.pending_age = 0;
            return Ok(acts);
        }

        if advance_age {
            self.pending_age += 1;
        }
        if self.pending_age >= self.cfg.max_tube_age_in_cache {
            let chunk = std::mem::take(&mut self.pending);
            acts.extend(self.submit_chunk(chunk)?);
            self.pending_age = 0;
        }
        Ok(acts)
    }

    fn submit_chunk(&self, chunk: Vec<PendingEntry>) -> Result<Vec<Act>> {
        let nn_batch = self.cfg.nn_batch.max(1);
        let mut windows: Vec<Vec<TubeClip>> = chunk.iter().map(|(_, _, w)| w.clone()).collect();
        let mut meta: Vec<(RingKey, String)> = chunk.iter().map(|(key, label, _)| (key.clone(), label.clone())).collect();
        while windows.len() < nn_batch {
            windows.push(dummy_window());
            meta.push(((String::new(), 0), String::new()));
        }

        let predictions = self.classifier.classify_batch(&windows)?;
        let mut acts = Vec::new();
        for (i, ((cam_id, tube_id), label)) in meta.iter().enumerate() {
            if label.is_empty() {
                continue; // dummy padding slot, never emitted
            }
            let Some(preds) = predictions.get(i) else { continue };
            let frame_id = windows[i].last().map(|c| c.frame_id).unwrap_or(0);
            acts.extend(top_k_above_threshold(preds, cam_id, *tube_id, label, frame_id));
        }
        Ok(acts)
    }
}

fn dummy_window() -> Vec<TubeClip> {
    vec![TubeClip { bbox: [100, 100, 300, 300], frame_id: 0, image: Frame::gray(400, 400), roi: DUMMY_ROI }]
}

fn top_k_above_threshold(preds: &[(String, f32)], cam_id: &str, tube_id: u64, label: &str, frame_id: u64) -> Vec<Act> {
    let mut sorted = preds.to_vec();
    sorted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    sorted
        .into_iter()
        .take(TOP_K)
        .filter(|(name, score)| *score >= class_threshold(name))
        .map(|(name, _)| Act::single(name, label, tube_id, frame_id).with_cam(cam_id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn tube_with_n_clips(id: u64, n: usize) -> Tube {
        Tube {
            cam_id: "camA".into(),
            label: "person".into(),
            tube_id: id,
            clips: (0..n)
                .map(|i| TubeClip {
                    bbox: [0, 0, 20, 40],
                    frame_id: i as u64,
                    image: Frame::black(4, 4),
                    roi: [0.0, 0.0, 1.0, 1.0],
                })
                .collect(),
            overlap_objs: HashSet::new(),
        }
    }

    #[test]
    fn non_person_tube_is_never_buffered() {
        let mut cfg = NeuralActorConfig::default();
        cfg.tube_size = 4;
        cfg.nn_batch = 1;
        let classifier = MockActionClassifier::new(vec![vec![vec![("sit".to_string(), 0.9)]]]);
        let mut actor = NeuralActor::new(cfg, classifier);
        let mut tube = tube_with_n_clips(1, 4);
        tube.label = "car".into();
        let acts = actor.ingest(&tube).unwrap();
        assert!(acts.is_empty());
        assert!(actor.rings.is_empty());
    }

    /// Scenario S5 (spec §8): a tube reaching `tube_size` clips triggers a
    /// batch pop and a classification pass; only predictions at or above
    /// their class's own threshold survive.
    #[test]
    fn scenario_s5_batch_pop_and_threshold_filter() {
        let mut cfg = NeuralActorConfig::default();
        cfg.tube_size = 4;
        cfg.nn_batch = 1;
        let classifier = MockActionClassifier::new(vec![vec![vec![
            ("use_phone".to_string(), 0.5),
            ("carry".to_string(), 0.05),
        ]]]);
        let mut actor = NeuralActor::new(cfg, classifier);
        let tube = tube_with_n_clips(1, 4);
        let acts = actor.ingest(&tube).unwrap();
        assert_eq!(acts.len(), 1);
        assert_eq!(acts[0].act_name, "use_phone");
    }

    #[test]
    fn underfull_tube_does_not_trigger_until_max_age_exceeded() {
        let mut cfg = NeuralActorConfig::default();
        cfg.tube_size = 10;
        cfg.max_tube_age_in_cache = 1;
        let classifier = MockActionClassifier::new(vec![vec![Vec::new()]]);
        let mut actor = NeuralActor::new(cfg, classifier);
        let tube = tube_with_n_clips(1, 3);
        let acts = actor.ingest(&tube).unwrap();
        assert!(acts.is_empty());

        actor.tick().unwrap();
        let acts = actor.tick().unwrap();
        assert!(acts.is_empty() || acts.iter().all(|a| a.tube1 == 1));
    }

    /// Scenario S5 (spec §8): a single ready tube is below `nn_batch / 2`, so
    /// it waits through `max_tube_age_in_cache` empty `tick`s before the
    /// under-fill policy force-submits a batch padded with dummy tubes.
    #[test]
    fn batch_padded_with_dummy_tubes_when_underfilled() {
        let mut cfg = NeuralActorConfig::default();
        cfg.tube_size = 2;
        cfg.nn_batch = 4;
        cfg.max_tube_age_in_cache = 2;
        let classifier = MockActionClassifier::new(vec![vec![
            vec![("sit".to_string(), 0.9)],
            Vec::new(),
            Vec::new(),
            Vec::new(),
        ]]);
        let mut actor = NeuralActor::new(cfg, classifier);
        let tube = tube_with_n_clips(1, 2);

        // Ready tube-window (1) is below nn_batch/2 (2): ingest and the first
        // tick must not submit yet.
        let acts = actor.ingest(&tube).unwrap();
        assert!(acts.is_empty());
        let acts = actor.tick().unwrap();
        assert!(acts.is_empty());

        // Second tick reaches max_tube_age_in_cache=2: force-submit padded
        // with 3 dummy tubes; only the real tube's act is emitted.
        let acts = actor.tick().unwrap();
        assert_eq!(acts.len(), 1);
        assert_eq!(acts[0].act_name, "sit");
    }

    /// A pending batch that already reaches `nn_batch / 2` submits on the
    /// very next round without waiting out the age limit.
    #[test]
    fn half_full_batch_submits_without_waiting() {
        let mut cfg = NeuralActorConfig::default();
        cfg.tube_size = 2;
        cfg.nn_batch = 4;
        cfg.max_tube_age_in_cache = 5;
        let classifier = MockActionClassifier::new(vec![vec![
            vec![("sit".to_string(), 0.9)],
            vec![("talk".to_string(), 0.9)],
            Vec::new(),
            Vec::new(),
        ]]);
        let mut actor = NeuralActor::new(cfg, classifier);
        actor.ingest(&tube_with_n_clips(1, 2)).unwrap();
        let acts = actor.ingest(&tube_with_n_clips(2, 2)).unwrap();
        assert_eq!(acts.len(), 2);
    }
}
