use eventsync_core::CoreError;
use thiserror::Error;

use super::storage::StorageError;

/// Errors surfaced by the sync client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The server answered with a non-success status.
    #[error("Server returned {status}: {message}")]
    Http { status: u16, message: String },

    /// A response or frame could not be understood.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// `init()` has not been called, or `disconnect()` has.
    #[error("Sync client is not initialized")]
    NotInitialized,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl ClientError {
    /// True for failures that mean "offline" rather than "broken".
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ClientError::Connection(_) | ClientError::WebSocket(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            ClientError::Connection(e.to_string())
        } else if e.is_decode() {
            ClientError::Protocol(e.to_string())
        } else if let Some(status) = e.status() {
            ClientError::Http {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            ClientError::Connection(e.to_string())
        }
    }
}
