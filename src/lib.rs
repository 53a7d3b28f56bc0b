//! Multi-camera video-analytics reasoning pipeline: per-camera tracking,
//! cross-camera re-identification, tube batching, rule-based and
//! learned action derivation, and declarative activity-graph matching.

pub mod activity;
pub mod config;
pub mod detector;
pub mod errors;
pub mod frame_source;
pub mod kalman;
pub mod model;
pub mod neural_actor;
pub mod persist;
pub mod pipeline;
pub mod queue;
pub mod reid;
pub mod spatial_actor;
pub mod tracker;
pub mod transport;
pub mod tube_batcher;
