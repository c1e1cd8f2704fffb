//! Client error types.

use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] pvlink_transport::TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] pvlink_protocol::ProtocolError),

    #[error("type error: {0}")]
    Types(#[from] pvlink_types::TypeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not connected")]
    NotConnected,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("request timeout")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("server error: {0}")]
    Server(String),

    #[error("response carried no value")]
    MissingValue,
}

impl ClientError {
    /// Returns whether retrying the operation on a fresh connection could
    /// succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::Timeout
                | ClientError::ConnectionLost(_)
                | ClientError::NotConnected
        )
    }
}
