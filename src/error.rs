//! Error types for the filtered stream client.

use thiserror::Error;

/// Main error type for stream and rule operations.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Failed to create rule (status {status}): {body}")]
    RuleCreationFailed { status: u16, body: String },

    #[error("Failed to delete rule (status {status}): {body}")]
    RuleDeletionFailed { status: u16, body: String },

    #[error("Failed to list rules (status {status}): {body}")]
    RuleListingFailed { status: u16, body: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Failed to spawn {0} thread")]
    Spawn(String),
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        StreamError::Decode(e.to_string())
    }
}

/// Result type for stream and rule operations.
pub type Result<T> = std::result::Result<T, StreamError>;
