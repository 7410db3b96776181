//! Error types for the recall-link client library.

use thiserror::Error;

/// Errors returned by recall-link operations.
#[derive(Debug, Error)]
pub enum RecallLinkError {
    /// Invalid client configuration (bad base URL, bad option values).
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// WebSocket transport failure (handshake, send, unexpected close).
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// An operation did not complete within its deadline.
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// The server rejected the bearer token.
    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    /// Failed to encode or decode a wire message.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Invariant violation inside the client itself.
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<serde_json::Error> for RecallLinkError {
    fn from(e: serde_json::Error) -> Self {
        RecallLinkError::SerializationError(e.to_string())
    }
}

/// Result type for recall-link operations.
pub type Result<T> = std::result::Result<T, RecallLinkError>;
