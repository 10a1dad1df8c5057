//! Error types of the capture and detection pipeline.
//!
use thiserror::Error;

/// Failures of the media capture facility.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera capture is not supported on this system")]
    Unsupported,

    #[error("no camera device available")]
    NoDevice,

    #[error("camera device error: {0}")]
    Device(#[from] std::io::Error),

    #[error("camera configuration rejected: {0}")]
    Config(String),

    #[error("failed to decode camera frame: {0}")]
    Decode(String),

    #[error("capture task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("camera stream ended")]
    StreamEnded,
}

/// Failures of a single detector invocation.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("model execution failed: {0}")]
    Model(String),

    #[error("unexpected model output: {0}")]
    Shape(String),

    #[error("inference task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<tract_onnx::prelude::TractError> for DetectError {
    fn from(err: tract_onnx::prelude::TractError) -> Self {
        DetectError::Model(format!("{err:#}"))
    }
}

/// Errors reported by the detection loop to its error handler.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Detect(#[from] DetectError),
}
