//! Configuration for a synchronized store.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the collector does when some, but not all, peers fail to download.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpochPolicy {
    /// Apply nothing and advance no bookkeeping until every peer succeeds.
    #[default]
    AllOrNothing,
    /// Apply changes from the peers that succeeded; retry the rest next epoch.
    PartialApply,
}

/// Configuration for a synchronized store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root directory on the remote under which device logs are written.
    pub sync_path: String,
    /// Key prefixes whose writes are synchronized. Matching is hierarchical.
    pub synchronized_prefixes: Vec<String>,
    /// Delay between a local write and the upload that carries it (ms).
    pub upload_period_ms: u64,
    /// Interval between collector epochs (ms).
    pub collection_epoch_ms: u64,
    /// How long the writer waits to batch concurrent writes (ms).
    pub batch_window_ms: u64,
    /// Upper bound for the upload retry backoff (ms).
    pub max_backoff_ms: u64,
    /// Poll interval for `wait_for_remote` (ms).
    pub sync_poll_interval_ms: u64,
    /// Behaviour when a collection epoch partially fails.
    pub epoch_policy: EpochPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_path: "collective".to_string(),
            synchronized_prefixes: Vec::new(),
            upload_period_ms: 5_000,
            collection_epoch_ms: 5_000,
            batch_window_ms: 5,
            max_backoff_ms: 5 * 60 * 1_000,
            sync_poll_interval_ms: 100,
            epoch_policy: EpochPolicy::AllOrNothing,
        }
    }
}

impl SyncConfig {
    pub fn upload_period(&self) -> Duration {
        Duration::from_millis(self.upload_period_ms)
    }

    pub fn collection_epoch(&self) -> Duration {
        Duration::from_millis(self.collection_epoch_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn sync_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sync_poll_interval_ms)
    }

    /// Returns the next upload retry delay after `current` failed.
    ///
    /// Grows by half each time and never exceeds [`SyncConfig::max_backoff`].
    pub fn next_backoff(&self, current: Duration) -> Duration {
        (current * 3 / 2).min(self.max_backoff())
    }
}
