//! Remote store abstraction trait.

use crate::error::SyncResult;
use async_trait::async_trait;
use std::time::SystemTime;

/// Abstract remote storage interface.
///
/// Paths are `/`-separated and relative to the store's root.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Reads the whole file at `path`.
    async fn read(&self, path: &str) -> SyncResult<Vec<u8>>;

    /// Replaces the file at `path` with `data`, creating parent directories.
    async fn write(&self, path: &str, data: &[u8]) -> SyncResult<()>;

    /// Lists the names of the entries directly under `path`. A directory
    /// that does not exist yet is empty.
    async fn read_dir(&self, path: &str) -> SyncResult<Vec<String>>;

    /// Returns when the file at `path` was last modified.
    async fn get_last_modified(&self, path: &str) -> SyncResult<SystemTime>;

    /// Returns when this store last completed a write.
    async fn get_last_write(&self) -> SyncResult<SystemTime>;
}
