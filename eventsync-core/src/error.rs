//! Core error types.

use thiserror::Error;

/// Errors produced by the core model and protocol helpers.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A document or tombstone is missing required fields.
    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    /// A sync token could not be decoded.
    #[error("Invalid sync token: {0}")]
    InvalidSyncToken(String),

    /// JSON encoding/decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
