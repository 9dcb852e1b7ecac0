//! Filesystem-backed remote store.
//!
//! Works against any directory: a local folder, a mounted cloud drive, or a
//! network share. Writes go to a temporary sibling file that is then renamed
//! over the target, so readers never see a half-written log.

use super::store::RemoteStore;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, info};

/// A [`RemoteStore`] rooted at a directory.
pub struct FileSystemRemote {
    base: PathBuf,
    last_write: Mutex<Option<SystemTime>>,
}

impl FileSystemRemote {
    /// Creates a store rooted at `base`. The directory is created lazily.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            last_write: Mutex::new(None),
        }
    }

    /// Returns the root directory.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Resolves a remote path below the root, rejecting escapes.
    fn resolve(&self, path: &str) -> SyncResult<PathBuf> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(SyncError::Remote(format!("invalid remote path: {path}")));
        }
        Ok(self.base.join(relative))
    }
}

#[async_trait]
impl RemoteStore for FileSystemRemote {
    async fn read(&self, path: &str) -> SyncResult<Vec<u8>> {
        let full = self.resolve(path)?;
        fs::read(&full)
            .await
            .map_err(|e| SyncError::Remote(format!("failed to read {path}: {e}")))
    }

    async fn write(&self, path: &str, data: &[u8]) -> SyncResult<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    SyncError::Remote(format!("failed to create directory for {path}: {e}"))
                })?;
                info!("Created remote directory: {:?}", parent);
            }
        }

        let mut tmp_name = full.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        debug!("Writing remote file: {:?} ({} bytes)", full, data.len());
        fs::write(&tmp, data)
            .await
            .map_err(|e| SyncError::Remote(format!("failed to write {path}: {e}")))?;
        fs::rename(&tmp, &full)
            .await
            .map_err(|e| SyncError::Remote(format!("failed to replace {path}: {e}")))?;

        *self.last_write.lock() = Some(SystemTime::now());
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> SyncResult<Vec<String>> {
        let full = self.resolve(path)?;
        let mut read_dir = match fs::read_dir(&full).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SyncError::Remote(format!("failed to list {path}: {e}")));
            }
        };

        let mut names = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| SyncError::Remote(format!("failed to read entry in {path}: {e}")))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            // Skip hidden files and in-flight writes
            if name.starts_with('.') || name.ends_with(".tmp") {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    async fn get_last_modified(&self, path: &str) -> SyncResult<SystemTime> {
        let full = self.resolve(path)?;
        let metadata = fs::metadata(&full)
            .await
            .map_err(|e| SyncError::Remote(format!("failed to stat {path}: {e}")))?;
        metadata
            .modified()
            .map_err(|e| SyncError::Remote(format!("no modification time for {path}: {e}")))
    }

    async fn get_last_write(&self) -> SyncResult<SystemTime> {
        Ok(self.last_write.lock().unwrap_or(SystemTime::UNIX_EPOCH))
    }
}
