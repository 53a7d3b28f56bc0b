//! TubeBatcher (spec §4.3): accumulates a fixed-size window of frames per
//! camera and, on window close, turns each tracked object's per-frame boxes
//! into a `Tube` — a validated clip sequence with attachment enrichment and
//! 400x400 context crops.
//!
//! Grounded on the teacher's `vision_tracker.rs::extract_crop` (square
//! context crop around a box, clamped to frame bounds) generalized from a
//! single JPEG-encoded snapshot to a per-clip `(image, roi)` pair threaded
//! through a whole tube.

use std::collections::HashMap;

use crate::config::TubeBatcherConfig;
use crate::model::{BBox, Frame, FramePacket, Tube, TubeClip};
use crate::tracker::iou;

const CROP_SIZE: u32 = 400;
/// Context crop side length as a multiple of `(w + h)` of the tracked box,
/// matching the teacher's square-crop heuristic.
const CONTEXT_SCALE: f32 = 1.3;

struct WindowEntry {
    tube_id: u64,
    label: String,
    per_frame: Vec<(u64, BBox)>,
    overlap_objs: std::collections::HashSet<String>,
}

/// Per-camera fixed window accumulator. Call [`TubeBatcher::push`] once per
/// incoming frame packet; it returns the emitted tubes whenever a window of
/// `max_tube_size` frames closes.
pub struct TubeBatcher {
    cfg: TubeBatcherConfig,
    pending: HashMap<String, Vec<FramePacket>>,
}

impl TubeBatcher {
    pub fn new(cfg: TubeBatcherConfig) -> Self {
        Self { cfg, pending: HashMap::new() }
    }

    /// Feed one frame packet (post-tracking, `meta` populated with tracked +
    /// attachment detections). Returns the tubes emitted if this closed a
    /// window for `pkt.cam_id`.
    pub fn push(&mut self, pkt: FramePacket) -> Vec<Tube> {
        let cam_id = pkt.cam_id.clone();
        let window = self.pending.entry(cam_id.clone()).or_default();
        window.push(pkt);

        if window.len() < self.cfg.max_tube_size {
            return Vec::new();
        }

        let window = self.pending.remove(&cam_id).unwrap();
        self.close_window(&cam_id, window)
    }

    /// Flush whatever is buffered for `cam_id`, even if short of a full
    /// window (used on pipeline shutdown, spec §5 graceful drain).
    pub fn flush(&mut self, cam_id: &str) -> Vec<Tube> {
        let Some(window) = self.pending.remove(cam_id) else { return Vec::new() };
        self.close_window(cam_id, window)
    }

    /// Cameras with a partially-filled window still buffered, for draining
    /// every camera's tail on shutdown without needing the caller to already
    /// know which cameras are live.
    pub fn pending_cams(&self) -> Vec<String> {
        self.pending.keys().cloned().collect()
    }

    fn close_window(&self, cam_id: &str, window: Vec<FramePacket>) -> Vec<Tube> {
        // Keyed by (label, tube_id): tube ids are only unique per label
        // (spec §3 — `MultiLabelTracker` runs one independent `next_id`
        // counter per tracked label), so a raw id would collide a person
        // track and a car track sharing the same numeric id.
        let mut by_track: HashMap<(String, u64), WindowEntry> = HashMap::new();
        let mut attachments_per_frame: Vec<Vec<&crate::model::DetectionRecord>> = Vec::with_capacity(window.len());

        for pkt in &window {
            let mut attachments = Vec::new();
            for det in &pkt.meta {
                if let Some(id) = det.id {
                    by_track.entry((det.label.clone(), id)).or_insert_with(|| WindowEntry {
                        tube_id: id,
                        label: det.label.clone(),
                        per_frame: Vec::new(),
                        overlap_objs: std::collections::HashSet::new(),
                    });
                } else {
                    attachments.push(det);
                }
            }
            attachments_per_frame.push(attachments);
        }

        for (fi, pkt) in window.iter().enumerate() {
            for det in &pkt.meta {
                let Some(id) = det.id else { continue };
                let entry = by_track.get_mut(&(det.label.clone(), id)).unwrap();
                entry.per_frame.push((pkt.frame_id, det.bbox));
                for att in &attachments_per_frame[fi] {
                    if iou_gt_zero(det.bbox, att.bbox) {
                        entry.overlap_objs.insert(att.label.clone());
                    }
                }
            }
        }

        let mut tubes = Vec::new();
        for entry in by_track.into_values() {
            if entry.per_frame.len() < self.cfg.min_tube_size {
                continue; // spec §4.3: tube invalid unless present in >= MIN_TUBE_SIZE packets
            }
            let clips = entry
                .per_frame
                .iter()
                .map(|(frame_id, bbox)| build_clip(&window, *frame_id, *bbox))
                .collect();
            tubes.push(Tube {
                cam_id: cam_id.to_string(),
                label: entry.label,
                tube_id: entry.tube_id,
                clips,
                overlap_objs: entry.overlap_objs,
            });
        }
        tubes
    }
}

fn iou_gt_zero(a: BBox, b: BBox) -> bool {
    iou(a, b) > 0.0
}

fn build_clip(window: &[FramePacket], frame_id: u64, bbox: BBox) -> TubeClip {
    let pkt = window.iter().find(|p| p.frame_id == frame_id);
    let (frame_w, frame_h) = pkt.map(|p| (p.image.width, p.image.height)).unwrap_or((CROP_SIZE, CROP_SIZE));
    let (crop, roi) = match pkt {
        Some(p) => context_crop(&p.image, bbox),
        None => (Frame::black(CROP_SIZE, CROP_SIZE), [0.25, 0.25, 0.75, 0.75]),
    };
    let _ = (frame_w, frame_h);
    TubeClip { bbox, frame_id, image: crop, roi }
}

/// Square context crop around `bbox`, side `CONTEXT_SCALE * (w + h)`,
/// clamped to the source frame and padded with black where it would run off
/// the edge (spec §4.3), resized to `CROP_SIZE x CROP_SIZE`. Returns the
/// crop plus the box's position within it as ratios.
fn context_crop(frame: &Frame, bbox: BBox) -> (Frame, [f32; 4]) {
    let [x0, y0, x1, y1] = bbox;
    let (w, h) = ((x1 - x0).max(1) as f32, (y1 - y0).max(1) as f32);
    let cx = x0 as f32 + w / 2.0;
    let cy = y0 as f32 + h / 2.0;
    let side = (CONTEXT_SCALE * (w + h)).max(1.0);

    let crop_x0 = cx - side / 2.0;
    let crop_y0 = cy - side / 2.0;
    let crop_x1 = crop_x0 + side;
    let crop_y1 = crop_y0 + side;

    // Clamp to the source frame bounds; out-of-frame area is filled black.
    let src_x0 = crop_x0.max(0.0);
    let src_y0 = crop_y0.max(0.0);
    let src_x1 = crop_x1.min(frame.width as f32);
    let src_y1 = crop_y1.min(frame.height as f32);

    let mut out = Frame::black(CROP_SIZE, CROP_SIZE);
    if src_x1 > src_x0 && src_y1 > src_y0 && frame.width > 0 && frame.height > 0 {
        copy_region_resized(frame, &mut out, crop_x0, crop_y0, side, src_x0, src_y0, src_x1, src_y1);
    }

    let roi = [
        ((x0 as f32 - crop_x0) / side).clamp(0.0, 1.0),
        ((y0 as f32 - crop_y0) / side).clamp(0.0, 1.0),
        ((x1 as f32 - crop_x0) / side).clamp(0.0, 1.0),
        ((y1 as f32 - crop_y0) / side).clamp(0.0, 1.0),
    ];
    (out, roi)
}

/// Nearest-neighbor resample of the source region `[src_x0,src_y0,src_x1,src_y1]`
/// (in source-frame pixel coordinates, already clamped) into `out`, placed at
/// the position implied by `crop_x0/crop_y0/side` relative to the full
/// `CROP_SIZE x CROP_SIZE` canvas. Kept dependency-free so this module works
/// without the `vision` feature; a real deployment may swap this for
/// `image::imageops::resize`.
#[allow(clippy::too_many_arguments)]
fn copy_region_resized(
    src: &Frame,
    out: &mut Frame,
    crop_x0: f32,
    crop_y0: f32,
    side: f32,
    src_x0: f32,
    src_y0: f32,
    src_x1: f32,
    src_y1: f32,
) {
    let scale = CROP_SIZE as f32 / side;
    let out_x0 = ((src_x0 - crop_x0) * scale).round() as i32;
    let out_y0 = ((src_y0 - crop_y0) * scale).round() as i32;
    let out_x1 = ((src_x1 - crop_x0) * scale).round() as i32;
    let out_y1 = ((src_y1 - crop_y0) * scale).round() as i32;

    for oy in out_y0.max(0)..out_y1.min(CROP_SIZE as i32) {
        for ox in out_x0.max(0)..out_x1.min(CROP_SIZE as i32) {
            let sx = (crop_x0 + ox as f32 / scale).round().clamp(0.0, src.width as f32 - 1.0) as usize;
            let sy = (crop_y0 + oy as f32 / scale).round().clamp(0.0, src.height as f32 - 1.0) as usize;
            let sidx = (sy * src.width as usize + sx) * 3;
            let oidx = (oy as usize * CROP_SIZE as usize + ox as usize) * 3;
            if sidx + 2 < src.pixels.len() && oidx + 2 < out.pixels.len() {
                out.pixels[oidx..oidx + 3].copy_from_slice(&src.pixels[sidx..sidx + 3]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DetectionRecord;

    fn packet_with(cam: &str, frame_id: u64, dets: Vec<DetectionRecord>) -> FramePacket {
        let mut pkt = FramePacket::new(cam, frame_id, Frame::black(100, 100));
        pkt.meta = dets;
        pkt
    }

    #[test]
    fn tube_emitted_once_window_full_and_valid() {
        let mut cfg = TubeBatcherConfig::default();
        cfg.max_tube_size = 4;
        cfg.min_tube_size = 2;
        let mut batcher = TubeBatcher::new(cfg);

        let mut tubes = Vec::new();
        for fid in 0..4u64 {
            let mut det = DetectionRecord::new([10, 10, 30, 30], "person", 0.9);
            det.id = Some(1);
            tubes = batcher.push(packet_with("camA", fid, vec![det]));
        }
        assert_eq!(tubes.len(), 1);
        assert_eq!(tubes[0].tube_id, 1);
        assert_eq!(tubes[0].len(), 4);
        assert_eq!(tubes[0].clips[0].image.width, CROP_SIZE);
    }

    #[test]
    fn sparse_track_below_min_tube_size_is_dropped() {
        let mut cfg = TubeBatcherConfig::default();
        cfg.max_tube_size = 4;
        cfg.min_tube_size = 3;
        let mut batcher = TubeBatcher::new(cfg);

        let mut tubes = Vec::new();
        for fid in 0..4u64 {
            let dets = if fid < 2 {
                let mut det = DetectionRecord::new([10, 10, 30, 30], "person", 0.9);
                det.id = Some(1);
                vec![det]
            } else {
                Vec::new()
            };
            tubes = batcher.push(packet_with("camA", fid, dets));
        }
        assert!(tubes.is_empty());
    }

    #[test]
    fn attachment_overlap_enriches_tube() {
        let mut cfg = TubeBatcherConfig::default();
        cfg.max_tube_size = 2;
        cfg.min_tube_size = 1;
        let mut batcher = TubeBatcher::new(cfg);

        let mut tubes = Vec::new();
        for fid in 0..2u64 {
            let mut person = DetectionRecord::new([10, 10, 50, 50], "person", 0.9);
            person.id = Some(1);
            let bag = DetectionRecord::new([20, 20, 40, 40], "bag", 0.8);
            tubes = batcher.push(packet_with("camA", fid, vec![person, bag]));
        }
        assert_eq!(tubes.len(), 1);
        assert!(tubes[0].overlap_objs.contains("bag"));
    }

    #[test]
    fn same_id_different_labels_do_not_collide() {
        let mut cfg = TubeBatcherConfig::default();
        cfg.max_tube_size = 2;
        cfg.min_tube_size = 1;
        let mut batcher = TubeBatcher::new(cfg);

        let mut tubes = Vec::new();
        for fid in 0..2u64 {
            let mut person = DetectionRecord::new([10, 10, 50, 50], "person", 0.9);
            person.id = Some(1);
            let mut car = DetectionRecord::new([200, 200, 260, 260], "car", 0.9);
            car.id = Some(1);
            tubes = batcher.push(packet_with("camA", fid, vec![person, car]));
        }
        assert_eq!(tubes.len(), 2);
        let person_tube = tubes.iter().find(|t| t.label == "person").unwrap();
        let car_tube = tubes.iter().find(|t| t.label == "car").unwrap();
        assert_eq!(person_tube.tube_id, 1);
        assert_eq!(car_tube.tube_id, 1);
        assert_eq!(person_tube.clips[0].bbox, [10, 10, 50, 50]);
        assert_eq!(car_tube.clips[0].bbox, [200, 200, 260, 260]);
    }

    #[test]
    fn flush_emits_partial_window() {
        let mut cfg = TubeBatcherConfig::default();
        cfg.max_tube_size = 10;
        cfg.min_tube_size = 1;
        let mut batcher = TubeBatcher::new(cfg);
        let mut det = DetectionRecord::new([10, 10, 30, 30], "person", 0.9);
        det.id = Some(1);
        assert!(batcher.push(packet_with("camA", 0, vec![det])).is_empty());
        let tubes = batcher.flush("camA");
        assert_eq!(tubes.len(), 1);
    }

    #[test]
    fn roi_stays_within_unit_range() {
        let (_, roi) = context_crop(&Frame::black(50, 50), [0, 0, 10, 10]);
        for v in roi {
            assert!((0.0..=1.0).contains(&v));
        }
    }
}
