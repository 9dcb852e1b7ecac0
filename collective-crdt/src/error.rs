//! Error types for patch handling.

use thiserror::Error;

/// Result type alias for patch operations.
pub type CrdtResult<T> = Result<T, CrdtError>;

/// Errors that can occur while encoding or decoding a patch.
#[derive(Debug, Error)]
pub enum CrdtError {
    #[error("failed to serialize patch: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to deserialize patch: {0}")]
    Deserialize(#[source] serde_json::Error),
}
