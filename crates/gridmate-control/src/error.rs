use gridmate::protocol::ErrorCode;
use thiserror::Error;

/// Errors surfaced by the control-plane components.
///
/// Network and protocol failures are deliberately *not* represented here:
/// they are recorded as state-machine transitions plus backoff timers and
/// never abort the poll loop (see the crate docs). `ControlError` covers
/// the synchronous, caller-facing failures.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("an operation of this kind is already in progress")]
    InProgress,

    #[error("an HTTP operation is already outstanding on this channel")]
    Busy,

    #[error("invalid master URL: {0}")]
    InvalidUrl(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("no account manager is configured")]
    NotAttached,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ControlError {
    /// Map to the protocol error code the RPC server reports.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            ControlError::InProgress | ControlError::Busy => {
                (ErrorCode::InProgress, self.to_string())
            }
            ControlError::InvalidUrl(_) => (ErrorCode::InvalidUrl, self.to_string()),
            ControlError::ProjectNotFound(_) => (ErrorCode::NotFound, self.to_string()),
            ControlError::NotAttached => (ErrorCode::NotAttached, self.to_string()),
            ControlError::Io(_) => (ErrorCode::Internal, "internal I/O error".to_string()),
            ControlError::Json(_) => (ErrorCode::Internal, "internal encoding error".to_string()),
        }
    }
}
