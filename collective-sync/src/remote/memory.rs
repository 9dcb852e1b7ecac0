//! In-process remote store for tests and single-process fleets.
//!
//! Several devices can share one `MemoryRemote` through an `Arc`. Failures
//! can be injected per path prefix to exercise the collector's error
//! handling.

use super::store::RemoteStore;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    modified: SystemTime,
}

#[derive(Debug, Default)]
struct State {
    files: BTreeMap<String, Entry>,
    failing_reads: BTreeSet<String>,
    offline: bool,
    writes: u64,
    last_write: Option<SystemTime>,
}

/// A [`RemoteStore`] held in memory.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    state: RwLock<State>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail until set back to `false`.
    pub fn set_offline(&self, offline: bool) {
        self.state.write().offline = offline;
    }

    /// Makes reads and stats of paths starting with `prefix` fail.
    pub fn fail_reads_under(&self, prefix: impl Into<String>) {
        self.state.write().failing_reads.insert(prefix.into());
    }

    /// Clears all injected read failures.
    pub fn clear_failures(&self) {
        self.state.write().failing_reads.clear();
    }

    /// Returns the raw bytes stored at `path`.
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.state.read().files.get(path).map(|e| e.data.clone())
    }

    /// Overwrites `path` directly, bypassing failure injection.
    pub fn put(&self, path: &str, data: Vec<u8>) {
        let mut state = self.state.write();
        let modified = next_modified(&state, path);
        state.files.insert(path.to_string(), Entry { data, modified });
    }

    /// Returns every stored path.
    pub fn paths(&self) -> Vec<String> {
        self.state.read().files.keys().cloned().collect()
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.state.read().writes
    }

    fn check_read(state: &State, path: &str) -> SyncResult<()> {
        if state.offline {
            return Err(SyncError::Remote("remote offline".to_string()));
        }
        if state.failing_reads.iter().any(|p| path.starts_with(p.as_str())) {
            return Err(SyncError::Remote(format!("injected read failure: {path}")));
        }
        Ok(())
    }
}

/// Modification times are strictly increasing per path so that two writes
/// within one clock tick are still told apart.
fn next_modified(state: &State, path: &str) -> SystemTime {
    let now = SystemTime::now();
    match state.files.get(path) {
        Some(prev) if prev.modified >= now => prev.modified + Duration::from_nanos(1),
        _ => now,
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn read(&self, path: &str) -> SyncResult<Vec<u8>> {
        let state = self.state.read();
        Self::check_read(&state, path)?;
        state
            .files
            .get(path)
            .map(|e| e.data.clone())
            .ok_or_else(|| SyncError::Remote(format!("not found: {path}")))
    }

    async fn write(&self, path: &str, data: &[u8]) -> SyncResult<()> {
        let mut state = self.state.write();
        if state.offline {
            return Err(SyncError::Remote("remote offline".to_string()));
        }
        let modified = next_modified(&state, path);
        state.files.insert(
            path.to_string(),
            Entry {
                data: data.to_vec(),
                modified,
            },
        );
        state.writes += 1;
        state.last_write = Some(modified);
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> SyncResult<Vec<String>> {
        let state = self.state.read();
        if state.offline {
            return Err(SyncError::Remote("remote offline".to_string()));
        }
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let names: BTreeSet<String> = state
            .files
            .keys()
            .filter_map(|k| k.strip_prefix(prefix.as_str()))
            .filter_map(|rest| rest.split('/').next())
            .map(str::to_string)
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn get_last_modified(&self, path: &str) -> SyncResult<SystemTime> {
        let state = self.state.read();
        Self::check_read(&state, path)?;
        state
            .files
            .get(path)
            .map(|e| e.modified)
            .ok_or_else(|| SyncError::Remote(format!("not found: {path}")))
    }

    async fn get_last_write(&self) -> SyncResult<SystemTime> {
        Ok(self.state.read().last_write.unwrap_or(SystemTime::UNIX_EPOCH))
    }
}
