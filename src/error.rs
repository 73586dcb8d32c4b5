// src/error.rs
use thiserror::Error;

use crate::broadcast::BroadcastError;
use crate::calibration::CalibrationState;
use crate::transform::TransformError;

/// Errors raised by the skeleton pipeline.
///
/// `NoDetection` and `MalformedFrame` are per-frame conditions the session
/// loop absorbs; `CalibrationFailed` and `SourceUnavailable` end a session.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("no pose detected in frame")]
    NoDetection,

    #[error("calibration failed: {0}")]
    CalibrationFailed(String),

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("a session is already running")]
    AlreadyRunning,

    #[error("calibration is not ready (state: {0:?})")]
    CalibrationNotReady(CalibrationState),

    #[error("model inference failed: {0}")]
    Inference(String),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Broadcast(#[from] BroadcastError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrackerError>;
