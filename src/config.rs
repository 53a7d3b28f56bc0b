//! Pipeline configuration — loaded from `caesar.toml` (working directory)
//! with `CAESAR__SECTION__FIELD` environment overrides, the same layering
//! the teacher's `config::load_config()` uses.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub reid: ReidConfig,
    #[serde(default)]
    pub tube_batcher: TubeBatcherConfig,
    #[serde(default)]
    pub spatial_actor: SpatialActorConfig,
    #[serde(default)]
    pub neural_actor: NeuralActorConfig,
    #[serde(default)]
    pub activity_composer: ActivityComposerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub persist: PersistConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub cam_id: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    pub model_path: String,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub input_size: u32,
    pub intra_threads: u16,
    pub use_openvino: bool,
}
impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: "models/yolov8s.onnx".into(),
            confidence_threshold: 0.50,
            nms_threshold: 0.45,
            input_size: 640,
            intra_threads: 2,
            use_openvino: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Cosine-distance threshold for appearance-feature matching (spec §4.1).
    pub appearance_match_thres: f32,
    /// IoU gating threshold cascaded after appearance matching.
    pub iou_match_thres: f32,
    pub n_init: u32,
    pub max_age: u32,
    /// Labels that get a dedicated tracker instance; everything else is an attachment.
    pub track_labels: Vec<String>,
    pub attach_labels: Vec<String>,
}
impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            appearance_match_thres: 0.20,
            iou_match_thres: 0.70,
            n_init: 4,
            max_age: 100,
            track_labels: vec!["person".into(), "car".into()],
            attach_labels: vec!["bag".into(), "bike".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReidConfig {
    pub topology_path: Option<String>,
    pub min_tube_duration: u32,
    pub feature_matching_thres: f32,
    pub end_frame_num_thres: u64,
    pub max_tube_info_size: usize,
}
impl Default for ReidConfig {
    fn default() -> Self {
        Self {
            topology_path: None,
            min_tube_duration: 4,
            feature_matching_thres: 0.4,
            end_frame_num_thres: 5,
            max_tube_info_size: 80,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TubeBatcherConfig {
    pub max_tube_size: usize,
    pub min_tube_size: usize,
}
impl Default for TubeBatcherConfig {
    fn default() -> Self {
        Self { max_tube_size: 16, min_tube_size: 8 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpatialActorConfig {
    pub max_inactive_frame_num: u32,
    pub segment_size: usize,
}
impl Default for SpatialActorConfig {
    fn default() -> Self {
        Self { max_inactive_frame_num: 120, segment_size: 10 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NeuralActorConfig {
    pub model_path: Option<String>,
    pub tube_size: usize,
    pub nn_batch: usize,
    pub max_tube_age_in_cache: u32,
}
impl Default for NeuralActorConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            tube_size: 32,
            nn_batch: 4,
            max_tube_age_in_cache: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivityComposerConfig {
    pub definitions_path: Option<String>,
    pub max_graph_cache_size: usize,
}
impl Default for ActivityComposerConfig {
    fn default() -> Self {
        Self { definitions_path: None, max_graph_cache_size: 1000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub capacity: usize,
    pub poll_interval_ms: u64,
}
impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 64, poll_interval_ms: 10 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistConfig {
    pub enabled: bool,
    pub dir: String,
}
impl Default for PersistConfig {
    fn default() -> Self {
        Self { enabled: false, dir: "data".into() }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cameras: Vec::new(),
            detector: DetectorConfig::default(),
            tracker: TrackerConfig::default(),
            reid: ReidConfig::default(),
            tube_batcher: TubeBatcherConfig::default(),
            spatial_actor: SpatialActorConfig::default(),
            neural_actor: NeuralActorConfig::default(),
            activity_composer: ActivityComposerConfig::default(),
            queue: QueueConfig::default(),
            persist: PersistConfig::default(),
        }
    }
}

/// Load configuration from `<path>` (default `caesar.toml` in the working
/// directory) layered with `CAESAR__SECTION__FIELD` environment overrides.
/// A missing config file is not an error — defaults apply, matching the
/// teacher's `load_config()` fallback-to-defaults behavior.
pub fn load_config(path: Option<&str>) -> anyhow::Result<AppConfig> {
    let file_stem = path.unwrap_or("caesar");
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(file_stem).required(false))
        .add_source(config::Environment::with_prefix("CAESAR").separator("__"))
        .build()?;
    let app: AppConfig = cfg.try_deserialize()?;
    Ok(app)
}
