//! Error types for the sync layer.

use collective_crdt::CrdtError;
use collective_crypto::CryptoError;
use collective_storage::StorageError;
use collective_types::KeyError;
use thiserror::Error;
use tokio::task::JoinError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Local store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Encryption or decryption failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Patch (de)serialization failure.
    #[error("patch error: {0}")]
    Crdt(#[from] CrdtError),

    /// A key or name used a reserved character or was empty.
    #[error("invalid key: {0}")]
    Key(#[from] KeyError),

    /// Malformed identifier or other type-level error.
    #[error("invalid value: {0}")]
    Types(#[from] collective_types::Error),

    /// The remote store failed.
    #[error("remote error: {0}")]
    Remote(String),

    /// A log file could not be decoded.
    #[error("log file error: {0}")]
    Codec(String),

    /// One or more peers could not be collected this epoch.
    #[error("failed to collect {} device log(s): {}", .0.len(), .0.join("; "))]
    Collection(Vec<String>),

    /// A prefix was empty, contained `/`, or was already in the chain.
    #[error("invalid prefix: {0}")]
    InvalidPrefix(String),

    /// A map element's version does not match the map's version.
    #[error("version mismatch: map version {expected}, element version {found}")]
    VersionMismatch { expected: u64, found: u64 },

    /// A store that has been used for synchronization was opened local-only.
    #[error("store has been synchronized before and cannot be opened local-only")]
    RemoteDowngrade,

    /// The transaction log writer stopped after an unrecoverable error.
    #[error("transaction log writer halted")]
    WriterHalted,

    /// The transaction log writer was stopped; the write was not applied.
    #[error("transaction log writer stopped")]
    WriterStopped,

    /// The collector stopped after an unrecoverable error.
    #[error("collector halted")]
    CollectorHalted,

    /// Background processes were already started for this store.
    #[error("background processes already running")]
    AlreadyRunning,

    /// A blocking or background task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(String),

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,


    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<JoinError> for SyncError {
    fn from(e: JoinError) -> Self {
        Self::Task(e.to_string())
    }
}
