//! Server error types.

use pvlink_protocol::Status;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] pvlink_protocol::ProtocolError),

    #[error("type error: {0}")]
    Types(#[from] pvlink_types::TypeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// The status payload this error turns into when it can be answered
    /// instead of tearing the connection down.
    pub fn to_status(&self) -> Status {
        Status::error(self.to_string())
    }
}
