//! Per-label multi-object tracker (spec §4.1): one independent instance per
//! tracked label, appearance+motion cascade — cosine distance on features
//! first, IoU gating second — tentative tracks confirmed after `n_init`
//! consecutive hits, tracks retired after `max_age` misses. Attachment
//! labels (bag, bike, ...) are never tracked; they pass through the packet
//! untouched (spec §4.1) and are picked up by `TubeBatcher`'s overlap logic.
//!
//! Grounded in the teacher's IoU-only `vision_tracker.rs::Tracker`,
//! generalized to the appearance-first cascade and Kalman prediction the
//! spec requires, and split one instance per label instead of one shared
//! tracker for all classes.

use std::collections::HashMap;

use crate::config::TrackerConfig;
use crate::kalman::KalmanBoxTracker;
use crate::model::{BBox, DetectionRecord};

struct Track {
    id: u64,
    bbox: BBox,
    kalman: KalmanBoxTracker,
    feature: Option<Vec<f32>>,
    hits: u32,
    age: u32,
    confirmed: bool,
}

pub struct LabelTracker {
    label: String,
    tracks: Vec<Track>,
    next_id: u64,
    cfg: TrackerConfig,
}

impl LabelTracker {
    pub fn new(label: impl Into<String>, cfg: TrackerConfig) -> Self {
        Self { label: label.into(), tracks: Vec::new(), next_id: 1, cfg }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Advance the tracker by one frame of detections (already filtered to
    /// this tracker's label by the caller). Returns one `DetectionRecord`
    /// per confirmed, currently-visible track — box/id/label always set,
    /// `feature` copied from the matched input detection when its IoU with
    /// the output box is >= 0.3 (spec §4.1 output contract).
    pub fn update(&mut self, detections: &[DetectionRecord]) -> Vec<DetectionRecord> {
        // ── 1. Predict ────────────────────────────────────────────────────
        let predicted: Vec<BBox> = self.tracks.iter_mut().map(|t| t.kalman.predict(1.0)).collect();

        let mut det_used = vec![false; detections.len()];
        let mut track_matched = vec![false; self.tracks.len()];
        let mut matched_det_of: HashMap<usize, usize> = HashMap::new();

        // ── 2. Appearance cascade: cosine distance < threshold ───────────
        let mut appearance_pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            let Some(tf) = &track.feature else { continue };
            for (di, det) in detections.iter().enumerate() {
                let Some(df) = &det.feature else { continue };
                let dist = cosine_distance(tf, df);
                if dist < self.cfg.appearance_match_thres {
                    appearance_pairs.push((ti, di, dist));
                }
            }
        }
        appearance_pairs.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));
        for (ti, di, _) in appearance_pairs {
            if track_matched[ti] || det_used[di] {
                continue;
            }
            track_matched[ti] = true;
            det_used[di] = true;
            matched_det_of.insert(ti, di);
        }

        // ── 3. IoU gating cascade for everything appearance left unmatched ─
        let mut iou_pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, _track) in self.tracks.iter().enumerate() {
            if track_matched[ti] {
                continue;
            }
            for (di, det) in detections.iter().enumerate() {
                if det_used[di] {
                    continue;
                }
                let iou_v = iou(predicted[ti], det.bbox);
                // "max_iou_distance" cascade: reject if (1 - iou) exceeds the
                // configured ceiling, i.e. accept when iou >= 1 - threshold.
                if 1.0 - iou_v <= self.cfg.iou_match_thres {
                    iou_pairs.push((ti, di, iou_v));
                }
            }
        }
        iou_pairs.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        for (ti, di, _) in iou_pairs {
            if track_matched[ti] || det_used[di] {
                continue;
            }
            track_matched[ti] = true;
            det_used[di] = true;
            matched_det_of.insert(ti, di);
        }

        // ── 4. Apply matches, age unmatched tracks ───────────────────────
        for (ti, track) in self.tracks.iter_mut().enumerate() {
            if let Some(&di) = matched_det_of.get(&ti) {
                let det = &detections[di];
                track.kalman.update(det.bbox);
                track.bbox = track.kalman.bbox();
                track.hits += 1;
                track.age = 0;
                if det.feature.is_some() {
                    track.feature = det.feature.clone();
                }
                if track.hits >= self.cfg.n_init {
                    track.confirmed = true;
                }
            } else {
                track.age += 1;
                track.bbox = predicted[ti];
            }
        }

        // ── 5. Retire stale tracks ────────────────────────────────────────
        let max_age = self.cfg.max_age;
        self.tracks.retain(|t| t.age <= max_age);

        // ── 6. New tentative tracks for unmatched detections ─────────────
        for (di, det) in detections.iter().enumerate() {
            if det_used[di] {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            self.tracks.push(Track {
                id,
                bbox: det.bbox,
                kalman: KalmanBoxTracker::new(det.bbox),
                feature: det.feature.clone(),
                hits: 1,
                age: 0,
                confirmed: self.cfg.n_init <= 1,
            });
        }

        // ── 7. Emit confirmed, currently-visible tracks ──────────────────
        let mut out = Vec::new();
        for track in &self.tracks {
            if !track.confirmed || track.age > 0 {
                continue; // not confirmed, or not seen this frame
            }
            let mut rec = DetectionRecord::new(track.bbox, self.label.clone(), 1.0);
            rec.id = Some(track.id);
            // Output contract: copy feature from the matching input det only
            // if its IoU with the (possibly Kalman-smoothed) output box is >= 0.3.
            for det in detections {
                if det.feature.is_some() && iou(track.bbox, det.bbox) >= 0.3 {
                    rec.feature = det.feature.clone();
                    break;
                }
            }
            out.push(rec);
        }
        out
    }
}

pub fn iou(a: BBox, b: BBox) -> f32 {
    let x0 = a[0].max(b[0]) as f32;
    let y0 = a[1].max(b[1]) as f32;
    let x1 = a[2].min(b[2]) as f32;
    let y1 = a[3].min(b[3]) as f32;
    let inter = (x1 - x0).max(0.0) * (y1 - y0).max(0.0);
    let area_a = ((a[2] - a[0]) * (a[3] - a[1])) as f32;
    let area_b = ((b[2] - b[0]) * (b[3] - b[1])) as f32;
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a * norm_b)
}

/// Dispatches per-frame detections to one `LabelTracker` per configured
/// track label; attachment labels pass through untouched.
pub struct MultiLabelTracker {
    trackers: HashMap<String, LabelTracker>,
    attach_labels: std::collections::HashSet<String>,
}

impl MultiLabelTracker {
    pub fn new(cfg: &TrackerConfig) -> Self {
        let trackers = cfg
            .track_labels
            .iter()
            .map(|l| (l.clone(), LabelTracker::new(l.clone(), cfg.clone())))
            .collect();
        Self {
            trackers,
            attach_labels: cfg.attach_labels.iter().cloned().collect(),
        }
    }

    /// Update every label's tracker with this frame's detections, returning
    /// the full output: tracked detections (with ids) for tracked labels,
    /// plus attachment detections passed through unchanged.
    pub fn update(&mut self, detections: &[DetectionRecord]) -> Vec<DetectionRecord> {
        let mut by_label: HashMap<&str, Vec<DetectionRecord>> = HashMap::new();
        let mut passthrough = Vec::new();

        for det in detections {
            if !det.is_well_formed() {
                tracing::warn!(label = %det.label, "dropping malformed detection");
                continue;
            }
            if self.attach_labels.contains(&det.label) {
                passthrough.push(det.clone());
            } else {
                by_label.entry(det.label.as_str()).or_default().push(det.clone());
            }
        }

        let mut out = Vec::new();
        for (label, tracker) in self.trackers.iter_mut() {
            let dets = by_label.remove(label.as_str()).unwrap_or_default();
            out.extend(tracker.update(&dets));
        }
        out.extend(passthrough);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> TrackerConfig {
        TrackerConfig::default()
    }

    #[test]
    fn track_confirms_after_n_init_hits() {
        let mut t = LabelTracker::new("person", cfg());
        for i in 0..3 {
            let det = DetectionRecord::new([100 + i, 100, 140 + i, 180], "person", 0.9);
            let out = t.update(&[det]);
            assert!(out.is_empty(), "should not be confirmed yet at hit {i}");
        }
        let det = DetectionRecord::new([103, 100, 143, 180], "person", 0.9);
        let out = t.update(&[det]);
        assert_eq!(out.len(), 1, "confirmed after n_init=4 hits");
        assert!(out[0].has_id());
    }

    #[test]
    fn track_dies_after_max_age_misses() {
        let mut cfg = cfg();
        cfg.max_age = 2;
        cfg.n_init = 1;
        let mut t = LabelTracker::new("person", cfg);
        let det = DetectionRecord::new([0, 0, 40, 80], "person", 0.9);
        let out = t.update(&[det]);
        assert_eq!(out.len(), 1);

        t.update(&[]);
        t.update(&[]);
        let out = t.update(&[]);
        assert!(out.is_empty());
    }

    #[test]
    fn feature_copied_when_iou_at_least_0_3() {
        let mut cfg = cfg();
        cfg.n_init = 1;
        let mut t = LabelTracker::new("person", cfg);
        let mut det = DetectionRecord::new([0, 0, 100, 100], "person", 0.9);
        det.feature = Some(vec![1.0, 0.0]);
        let out = t.update(&[det]);
        assert!(out[0].has_feature());
    }

    #[test]
    fn attachment_labels_pass_through_untracked() {
        let mut mt = MultiLabelTracker::new(&cfg());
        let bag = DetectionRecord::new([0, 0, 10, 10], "bag", 0.8);
        let out = mt.update(&[bag]);
        assert_eq!(out.len(), 1);
        assert!(!out[0].has_id());
    }
}
