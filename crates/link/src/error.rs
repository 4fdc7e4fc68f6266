//! Link error types

use thiserror::Error;

use rescuenet_core::CoreError;

/// Errors raised by the server loop and the client facade.
#[derive(Debug, Error)]
pub enum LinkError {
    /// WebSocket transport failure
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Frame could not be encoded or decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No reply within the request timeout
    #[error("Request timed out")]
    Timeout,

    /// Coordinator rejected the request
    #[error("Rejected ({code}): {message}")]
    Rejected {
        /// Machine-readable code
        code: String,
        /// Human-readable reason
        message: String,
    },

    /// Connection closed
    #[error("Connection closed")]
    Disconnected,

    /// Reply did not match the request
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    /// Local validation failure
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl LinkError {
    /// Rejection code, when the coordinator refused the request
    pub fn rejection_code(&self) -> Option<&str> {
        match self {
            LinkError::Rejected { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Result alias for link operations
pub type Result<T> = std::result::Result<T, LinkError>;
