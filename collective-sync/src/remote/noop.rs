//! Remote store used in local-only mode.

use super::store::RemoteStore;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use std::time::SystemTime;

/// A [`RemoteStore`] that stores nothing. Writes succeed and are dropped;
/// the store always appears empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRemote;

#[async_trait]
impl RemoteStore for NoopRemote {
    async fn read(&self, path: &str) -> SyncResult<Vec<u8>> {
        Err(SyncError::Remote(format!("local-only store has no {path}")))
    }

    async fn write(&self, _path: &str, _data: &[u8]) -> SyncResult<()> {
        Ok(())
    }

    async fn read_dir(&self, _path: &str) -> SyncResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn get_last_modified(&self, path: &str) -> SyncResult<SystemTime> {
        Err(SyncError::Remote(format!("local-only store has no {path}")))
    }

    async fn get_last_write(&self) -> SyncResult<SystemTime> {
        Ok(SystemTime::UNIX_EPOCH)
    }
}
