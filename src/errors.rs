//! Error taxonomy (spec §7): Configuration errors are fatal at startup,
//! everything else is downgraded to a logged drop by the stage that hit it.
//! No variant here is ever allowed to unwind across a stage boundary —
//! callers convert it to a `tracing::warn!` and move on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing file, malformed topology/activity grammar, unknown verb. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Connection refused, partial read, framing desync. Retried with backoff, never fatal.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed packet, missing required field. Packet is dropped, pipeline continues.
    #[error("data error: {0}")]
    Data(String),

    /// Classifier/detector returned a wrong-shaped output. Batch is dropped.
    #[error("model error: {0}")]
    Model(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> Self {
        PipelineError::Configuration(msg.into())
    }
    pub fn transport(msg: impl Into<String>) -> Self {
        PipelineError::Transport(msg.into())
    }
    pub fn data(msg: impl Into<String>) -> Self {
        PipelineError::Data(msg.into())
    }
    pub fn model(msg: impl Into<String>) -> Self {
        PipelineError::Model(msg.into())
    }
}
