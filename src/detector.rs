//! Detector — external collaborator interface (spec §1/§4.1). The pipeline
//! only depends on the [`Detector`] trait; a concrete ONNX-Runtime/OpenCV
//! implementation is gated behind the `vision` feature so the core compiles
//! without native deps. [`MockDetector`] backs the default build and tests.
//!
//! Label set and model architecture are explicitly out of scope (spec §1
//! Non-goals) — the only contract is the normalization in
//! [`crate::model::normalize_label`].

use crate::errors::{PipelineError, Result};
use crate::model::{DetectionRecord, Frame};

pub trait Detector: Send + Sync {
    /// Run inference on one frame, returning zero or more detections.
    /// Implementations must not panic on malformed/empty input; return
    /// `Ok(vec![])` or a `PipelineError::Model` for an unusable frame.
    fn detect(&self, frame: &Frame) -> Result<Vec<DetectionRecord>>;

    /// Convenience batch entry point; the default implementation simply
    /// calls [`Detector::detect`] per frame, but a real model backend may
    /// override this to submit a true batch to the inference session.
    fn detect_batch(&self, frames: &[Frame]) -> Result<Vec<Vec<DetectionRecord>>> {
        frames.iter().map(|f| self.detect(f)).collect()
    }
}

/// Scripted detector for tests: returns a fixed list of detections per call,
/// cycling or exhausting depending on construction. Optionally attaches a
/// synthetic appearance feature to `person` detections, matching the
/// upstream "feature extractor populates `feature` for every person
/// detection" contract (spec §4.1).
pub struct MockDetector {
    script: std::sync::Mutex<std::collections::VecDeque<Vec<DetectionRecord>>>,
    feature_dim: usize,
}

impl MockDetector {
    pub fn new(script: Vec<Vec<DetectionRecord>>) -> Self {
        Self {
            script: std::sync::Mutex::new(script.into()),
            feature_dim: 8,
        }
    }

    pub fn with_feature_dim(mut self, dim: usize) -> Self {
        self.feature_dim = dim;
        self
    }
}

impl Detector for MockDetector {
    fn detect(&self, _frame: &Frame) -> Result<Vec<DetectionRecord>> {
        let mut script = self.script.lock().unwrap();
        let mut dets = script.pop_front().unwrap_or_default();
        for d in dets.iter_mut() {
            if d.label == "person" && d.feature.is_none() {
                d.feature = Some(vec![0.0; self.feature_dim]);
            }
        }
        Ok(dets)
    }
}

/// The 9-class subset the reference system cared about; everything else
/// from a COCO-class model is dropped as noise (spec §4.1's "mis-shaped
/// input is dropped", applied here to out-of-taxonomy classes too).
pub const DEFAULT_TRACK_TAXONOMY: &[&str] =
    &["person", "car", "truck", "bus", "motorcycle", "bicycle", "dog", "cat", "bird"];

#[cfg(feature = "vision")]
pub mod ort_yolo {
    //! Concrete ONNX-Runtime-backed `Detector`, grounded in the teacher's
    //! `detector.rs`: letterbox resize, BGR->RGB, HWC->CHW, YOLOv8-shaped
    //! output `[1, 84, N]` decode. Extended from "best single box" to
    //! "all boxes above threshold + greedy NMS" since the pipeline needs a
    //! full per-frame detection list, not just the top hit.
    use super::*;
    use ndarray::{Array, CowArray};
    use opencv::{core::Mat, imgproc, prelude::*};
    use ort::{Environment, ExecutionProvider, GraphOptimizationLevel, Session, SessionBuilder, Value};
    use std::sync::Arc;

    pub struct OrtYoloDetector {
        session: Session,
        input_size: u32,
        conf_threshold: f32,
        nms_threshold: f32,
    }

    impl OrtYoloDetector {
        pub fn new(
            model_path: &str,
            input_size: u32,
            conf_threshold: f32,
            nms_threshold: f32,
            intra_threads: u16,
            use_openvino: bool,
        ) -> anyhow::Result<Self> {
            let env = Arc::new(Environment::builder().with_name("caesar_detector").build()?);

            let mut builder = SessionBuilder::new(&env)?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(intra_threads as i16)?;

            builder = if use_openvino {
                builder.with_execution_providers([ExecutionProvider::CPU(Default::default())])?
            } else {
                builder.with_execution_providers([ExecutionProvider::CPU(Default::default())])?
            };

            let session = builder.with_model_from_file(model_path)?;
            Ok(Self { session, input_size, conf_threshold, nms_threshold })
        }

        fn mat_from_frame(frame: &Frame) -> anyhow::Result<Mat> {
            let mut mat = unsafe {
                Mat::new_rows_cols_with_default(
                    frame.height as i32,
                    frame.width as i32,
                    opencv::core::CV_8UC3,
                    opencv::core::Scalar::all(0.0),
                )?
            };
            mat.data_bytes_mut()?.copy_from_slice(&frame.pixels);
            Ok(mat)
        }
    }

    impl Detector for OrtYoloDetector {
        fn detect(&self, frame: &Frame) -> Result<Vec<DetectionRecord>> {
            (|| -> anyhow::Result<Vec<DetectionRecord>> {
                let src = Self::mat_from_frame(frame)?;
                let sz = self.input_size as i32;

                let (letterboxed, scale, pad_x, pad_y) = letterbox(&src, sz)?;
                let mut rgb = Mat::default();
                imgproc::cvt_color(&letterboxed, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;
                let data = mat_to_chw_f32(&rgb, sz as usize)?;

                let array = CowArray::from(
                    Array::from_shape_vec((1, 3, sz as usize, sz as usize), data)?.into_dyn(),
                );
                let inputs = vec![Value::from_array(self.session.allocator(), &array)?];
                let outputs = self.session.run(inputs)?;
                let output = outputs[0].try_extract::<f32>()?;
                let view = output.view();
                let shape = view.shape();
                let num_boxes = shape[2];
                let num_classes = shape[1] - 4;

                let mut candidates = Vec::new();
                for i in 0..num_boxes {
                    let cx = view[[0, 0, i]];
                    let cy = view[[0, 1, i]];
                    let bw = view[[0, 2, i]];
                    let bh = view[[0, 3, i]];

                    let mut best_score = 0f32;
                    let mut best_class = 0usize;
                    for c in 0..num_classes {
                        let score = view[[0, 4 + c, i]];
                        if score > best_score {
                            best_score = score;
                            best_class = c;
                        }
                    }
                    if best_score <= self.conf_threshold {
                        continue;
                    }

                    let s = sz as f32;
                    let x0 = ((cx - bw / 2.0 - pad_x as f32) / scale as f32).max(0.0);
                    let y0 = ((cy - bh / 2.0 - pad_y as f32) / scale as f32).max(0.0);
                    let x1 = ((cx + bw / 2.0 - pad_x as f32) / scale as f32).min(s);
                    let y1 = ((cy + bh / 2.0 - pad_y as f32) / scale as f32).min(s);

                    candidates.push((best_class, best_score, [x0 as i32, y0 as i32, x1 as i32, y1 as i32]));
                }

                Ok(nms(candidates, self.nms_threshold)
                    .into_iter()
                    .filter_map(|(class_id, score, bbox)| {
                        let label = coco_label(class_id)?;
                        Some(DetectionRecord::new(bbox, label, score))
                    })
                    .collect())
            })()
            .map_err(|e| PipelineError::model(e.to_string()))
        }
    }

    fn letterbox(src: &Mat, target: i32) -> anyhow::Result<(Mat, f64, i32, i32)> {
        use opencv::core::{Scalar, Size};
        let w = src.cols();
        let h = src.rows();
        let scale = (target as f64 / w.max(h) as f64).min(1.0);
        let new_w = (w as f64 * scale) as i32;
        let new_h = (h as f64 * scale) as i32;

        let mut resized = Mat::default();
        imgproc::resize(src, &mut resized, Size::new(new_w, new_h), 0.0, 0.0, imgproc::INTER_LINEAR)?;

        let pad_x = (target - new_w) / 2;
        let pad_y = (target - new_h) / 2;

        let mut padded = Mat::default();
        opencv::core::copy_make_border(
            &resized,
            &mut padded,
            pad_y,
            target - new_h - pad_y,
            pad_x,
            target - new_w - pad_x,
            opencv::core::BORDER_CONSTANT,
            Scalar::new(114.0, 114.0, 114.0, 0.0),
        )?;
        Ok((padded, scale, pad_x, pad_y))
    }

    fn mat_to_chw_f32(mat: &Mat, size: usize) -> anyhow::Result<Vec<f32>> {
        let total = 3 * size * size;
        let mut out = vec![0f32; total];
        let data = mat.data_bytes()?;
        for h in 0..size {
            for w in 0..size {
                let pixel_idx = (h * size + w) * 3;
                for c in 0..3usize {
                    out[c * size * size + h * size + w] = data[pixel_idx + c] as f32 / 255.0;
                }
            }
        }
        Ok(out)
    }

    fn iou(a: [i32; 4], b: [i32; 4]) -> f32 {
        let x0 = a[0].max(b[0]) as f32;
        let y0 = a[1].max(b[1]) as f32;
        let x1 = a[2].min(b[2]) as f32;
        let y1 = a[3].min(b[3]) as f32;
        let inter = (x1 - x0).max(0.0) * (y1 - y0).max(0.0);
        let area_a = ((a[2] - a[0]) * (a[3] - a[1])) as f32;
        let area_b = ((b[2] - b[0]) * (b[3] - b[1])) as f32;
        let union = area_a + area_b - inter;
        if union <= 0.0 { 0.0 } else { inter / union }
    }

    fn nms(mut candidates: Vec<(usize, f32, [i32; 4])>, thres: f32) -> Vec<(usize, f32, [i32; 4])> {
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let mut kept: Vec<(usize, f32, [i32; 4])> = Vec::new();
        for c in candidates {
            if !kept.iter().any(|k| k.0 == c.0 && iou(k.2, c.2) > thres) {
                kept.push(c);
            }
        }
        kept
    }

    fn coco_label(class_id: usize) -> Option<&'static str> {
        match class_id {
            0 => Some("person"),
            1 => Some("bicycle"),
            2 => Some("car"),
            3 => Some("motorcycle"),
            5 => Some("bus"),
            7 => Some("truck"),
            14 => Some("bird"),
            15 => Some("cat"),
            16 => Some("dog"),
            24 => Some("bag"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_detector_attaches_feature_to_person_only() {
        let script = vec![vec![
            DetectionRecord::new([0, 0, 10, 10], "person", 0.9),
            DetectionRecord::new([20, 20, 30, 30], "car", 0.8),
        ]];
        let det = MockDetector::new(script);
        let frame = Frame::black(100, 100);
        let out = det.detect(&frame).unwrap();
        assert!(out[0].has_feature());
        assert!(!out[1].has_feature());
    }
}
