//! Core data model (spec §3). All entities are plain value types — cheap to
//! clone, tree-shaped, referenced by id rather than by pointer, per the
//! Design Note on cyclic references never arising and activity-graph
//! instances being deep-copied rather than aliased.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Axis-aligned pixel box `[x0, y0, x1, y1]`.
pub type BBox = [i32; 4];

/// A single frame captured from one camera, with progressively-enriched
/// per-object detection metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramePacket {
    pub cam_id: String,
    /// Monotonically increasing per camera (invariant a, spec §3).
    pub frame_id: u64,
    pub image: Frame,
    pub meta: Vec<DetectionRecord>,
}

impl FramePacket {
    pub fn new(cam_id: impl Into<String>, frame_id: u64, image: Frame) -> Self {
        Self { cam_id: cam_id.into(), frame_id, image, meta: Vec::new() }
    }
}

/// Raw pixel buffer abstraction. Kept crate-local and independent of any
/// concrete image library so the core pipeline compiles without the
/// `vision` feature; the feature-gated capture/detector/crop code converts
/// to/from `image::RgbImage` or `opencv::core::Mat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Packed RGB8, row-major, `width * height * 3` bytes.
    pub pixels: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        debug_assert_eq!(pixels.len(), width as usize * height as usize * 3);
        Self { width, height, pixels }
    }

    pub fn black(width: u32, height: u32) -> Self {
        Self { width, height, pixels: vec![0u8; width as usize * height as usize * 3] }
    }

    /// Gray filler frame used for `NeuralActor` dummy-tube padding (spec §4.5).
    pub fn gray(width: u32, height: u32) -> Self {
        Self { width, height, pixels: vec![114u8; width as usize * height as usize * 3] }
    }
}

/// A label normalized by the upstream detector (spec §4.1's normalization
/// contract: lower-case, no whitespace, stable across the label set).
pub fn normalize_label(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace(' ', "_")
}

/// Cross-camera re-identification pointer: `(prev_cam, prev_tube_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReidPointer {
    pub prev_cam: String,
    pub prev_tube_id: u64,
}

/// Tagged-variant detection record (REDESIGN FLAG, spec §9): required fields
/// always present, everything else is an explicit `Option` with presence
/// tests rather than a dynamic dictionary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub bbox: BBox,
    pub label: String,
    pub score: f32,
    pub id: Option<u64>,
    pub feature: Option<Vec<f32>>,
    pub reid: Option<ReidPointer>,
}

impl DetectionRecord {
    pub fn new(bbox: BBox, label: impl Into<String>, score: f32) -> Self {
        Self {
            bbox,
            label: normalize_label(&label.into()),
            score,
            id: None,
            feature: None,
            reid: None,
        }
    }

    pub fn has_id(&self) -> bool {
        self.id.is_some()
    }
    pub fn has_feature(&self) -> bool {
        self.feature.is_some()
    }
    pub fn has_reid(&self) -> bool {
        self.reid.is_some()
    }

    /// Validates the minimal shape a detection must have to survive into the
    /// pipeline (spec §4.1 "mis-shaped input record is dropped and logged").
    pub fn is_well_formed(&self) -> bool {
        let [x0, y0, x1, y1] = self.bbox;
        x1 > x0 && y1 > y0 && (0.0..=1.0).contains(&self.score) && !self.label.is_empty()
    }
}

/// A single frame's contribution to a tube: cropped context image, ROI,
/// source box and frame id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TubeClip {
    pub bbox: BBox,
    pub frame_id: u64,
    /// Fixed 400x400 context crop (spec §4.3).
    pub image: Frame,
    /// Box position within the crop, ratios in [0,1]: `[x0, y0, x1, y1]`.
    pub roi: [f32; 4],
}

/// The ordered sequence of detections of one tracked object within a camera
/// window. Immutable after emission by `TubeBatcher`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tube {
    pub cam_id: String,
    pub label: String,
    pub tube_id: u64,
    pub clips: Vec<TubeClip>,
    pub overlap_objs: HashSet<String>,
}

impl Tube {
    pub fn len(&self) -> usize {
        self.clips.len()
    }
    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }
    pub fn first_box(&self) -> Option<BBox> {
        self.clips.first().map(|c| c.bbox)
    }
    pub fn last_box(&self) -> Option<BBox> {
        self.clips.last().map(|c| c.bbox)
    }
}

/// An atomic semantic statement about one or two tubes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Act {
    pub act_name: String,
    pub class1: String,
    pub tube1: u64,
    pub class2: Option<String>,
    pub tube2: Option<u64>,
    pub frame_id: u64,
    pub valid: bool,
    /// Camera this act was observed on. Used by the activity matcher to
    /// fingerprint tube ids (`cam_id|tube_id`) so the same numeric tube id
    /// on two cameras never collides during matching. Empty when an act's
    /// source camera is not tracked (e.g. synthesized informational acts).
    pub cam_id_hint: String,
}

impl Act {
    pub fn single(act_name: impl Into<String>, class1: impl Into<String>, tube1: u64, frame_id: u64) -> Self {
        Self {
            act_name: act_name.into(),
            class1: class1.into(),
            tube1,
            class2: None,
            tube2: None,
            frame_id,
            valid: true,
            cam_id_hint: String::new(),
        }
    }

    pub fn pair(
        act_name: impl Into<String>,
        class1: impl Into<String>,
        tube1: u64,
        class2: impl Into<String>,
        tube2: u64,
        frame_id: u64,
    ) -> Self {
        Self {
            act_name: act_name.into(),
            class1: class1.into(),
            tube1,
            class2: Some(class2.into()),
            tube2: Some(tube2),
            frame_id,
            valid: true,
            cam_id_hint: String::new(),
        }
    }

    pub fn with_cam(mut self, cam_id: impl Into<String>) -> Self {
        self.cam_id_hint = cam_id.into();
        self
    }

    pub fn is_pairwise(&self) -> bool {
        self.tube2.is_some()
    }
}

/// Threaded through actor stages: a camera window of packets, the Tubes
/// emitted from it, the ReID remap observed in the window, and the
/// accumulated acts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerPkt {
    pub cam_id: String,
    pub frames: Vec<FramePacket>,
    pub tubes: Vec<Tube>,
    /// cur_tube_id -> (prev_cam, prev_tube_id)
    pub reid: std::collections::HashMap<u64, (String, u64)>,
    pub actions: Vec<Act>,
}

impl ServerPkt {
    pub fn new(cam_id: impl Into<String>) -> Self {
        Self {
            cam_id: cam_id.into(),
            frames: Vec::new(),
            tubes: Vec::new(),
            reid: std::collections::HashMap::new(),
            actions: Vec::new(),
        }
    }

    pub fn tube(&self, tube_id: u64) -> Option<&Tube> {
        self.tubes.iter().find(|t| t.tube_id == tube_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_record_normalizes_label() {
        let d = DetectionRecord::new([0, 0, 10, 10], " Person ", 0.9);
        assert_eq!(d.label, "person");
    }

    #[test]
    fn malformed_box_is_rejected() {
        let d = DetectionRecord::new([10, 10, 5, 5], "person", 0.9);
        assert!(!d.is_well_formed());
    }

    #[test]
    fn tube_reports_first_last_box() {
        let clip = |fid: u64, x: i32| TubeClip {
            bbox: [x, 0, x + 10, 10],
            frame_id: fid,
            image: Frame::black(4, 4),
            roi: [0.0, 0.0, 1.0, 1.0],
        };
        let tube = Tube {
            cam_id: "camA".into(),
            label: "person".into(),
            tube_id: 1,
            clips: vec![clip(0, 0), clip(1, 5), clip(2, 10)],
            overlap_objs: HashSet::new(),
        };
        assert_eq!(tube.first_box(), Some([0, 0, 10, 10]));
        assert_eq!(tube.last_box(), Some([10, 0, 20, 10]));
        assert_eq!(tube.len(), 3);
    }
}
