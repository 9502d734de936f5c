use thiserror::Error;

use crate::ResultCode;

/// Errors the orchestration layer distinguishes.
///
/// Item-level variants (`Decode`, `Extraction`, `Persistence`) are absorbed by
/// the ingestion pipeline and only show up in tallies and logs. Session-start
/// failures and an exhausted retry budget are the only ones that end a flow.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("no capture device available")]
    NoDeviceAvailable,
    #[error("failed to bind capture device {device}: {reason}")]
    DeviceBind { device: String, reason: String },
    #[error("capture session is {state:?}, expected {expected:?}")]
    SessionState {
        state: crate::session::SessionState,
        expected: crate::session::SessionState,
    },
    #[error("failed to decode {label}: {reason}")]
    Decode { label: String, reason: String },
    #[error("feature extraction failed: {0}")]
    Extraction(String),
    #[error("detection aborted after retry budget was exhausted ({code:?})")]
    TerminalDetection { code: ResultCode },
    #[error("failed to persist {label}: {reason}")]
    Persistence { label: String, reason: String },
}

impl FlowError {
    /// Result code surfaced to the host when this error ends a flow.
    pub fn result_code(&self) -> ResultCode {
        match self {
            FlowError::NoDeviceAvailable | FlowError::DeviceBind { .. } => {
                ResultCode::CameraUnavailable
            }
            FlowError::TerminalDetection { code } => *code,
            FlowError::Extraction(_) => ResultCode::NoFaceFeature,
            _ => ResultCode::Unknown,
        }
    }
}
