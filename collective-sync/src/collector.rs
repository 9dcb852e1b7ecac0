//! Collector: discovers peer devices, downloads their logs and merges them
//! into the local store.
//!
//! One collection epoch:
//!
//! 1. list `<sync_path>/<key_id>/<device>` on the remote
//! 2. fetch, decrypt and decode every peer's log concurrently, skipping
//!    logs that have not changed since the last successful read
//! 3. merge the peers' patches against this device's patch, taken from the
//!    writer under the exclusive merge lock
//! 4. apply the winning mutates to the local store
//! 5. advance the per-peer bookkeeping, only if everything above succeeded
//!
//! With [`EpochPolicy::AllOrNothing`] a single failed peer aborts the whole
//! epoch before anything is applied.

use crate::config::{EpochPolicy, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::file::{decode_file, log_path};
use crate::kv::{InternalKv, internal_key};
use crate::notifier::Connectivity;
use crate::remote::RemoteStore;
use crate::writer::RemoteWriter;
use collective_crdt::{Mutate, Patch};
use collective_crypto::Encryptor;
use collective_storage::KeyValueStore;
use collective_types::{InstanceId, StoreKey};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SYNCHED_KEY: &str = "synched";
const SYNCHED_VALUE: &[u8] = b"1";

/// Per-peer bookkeeping, advanced only after a successful apply.
#[derive(Debug, Default)]
struct CollectorState {
    /// Remote modification time of each peer log when last read.
    last_update_read: HashMap<InstanceId, SystemTime>,
    /// Last decoded patch of each peer.
    device_patches: HashMap<InstanceId, Patch>,
    /// Highest mutate timestamp already applied, per peer.
    last_mutation_read: BTreeMap<InstanceId, i64>,
}

enum Fetched {
    Unchanged,
    Updated { modified: SystemTime, patch: Patch },
}

/// The background merge process of one synchronized store.
pub struct Collector {
    my_id: InstanceId,
    sync_path: String,
    epoch: Duration,
    poll_interval: Duration,
    policy: EpochPolicy,
    remote: Arc<dyn RemoteStore>,
    encryptor: Arc<dyn Encryptor>,
    kv: Arc<InternalKv>,
    writer: Arc<RemoteWriter>,
    connectivity: Arc<Connectivity>,
    last_seen_key: String,
    state: Mutex<CollectorState>,
    synched: AtomicBool,
    halted: AtomicBool,
}

impl Collector {
    /// Creates a collector, loading the last-seen table and the synched
    /// latch from the local store. Performs blocking store I/O.
    pub fn new(
        my_id: InstanceId,
        config: &SyncConfig,
        remote: Arc<dyn RemoteStore>,
        encryptor: Arc<dyn Encryptor>,
        kv: Arc<InternalKv>,
        writer: Arc<RemoteWriter>,
        connectivity: Arc<Connectivity>,
    ) -> Self {
        let last_seen_key = internal_key(&format!("last_mutation_read/{my_id}"));
        let store = kv.store();
        let last_mutation_read = load_last_seen(store.as_ref(), &last_seen_key);
        let synched = match store.get(&internal_key(SYNCHED_KEY)) {
            Ok(value) => value.is_some_and(|v| v == SYNCHED_VALUE),
            Err(e) => {
                warn!("Failed to load synched flag, assuming not synched: {}", e);
                false
            }
        };

        Self {
            my_id,
            sync_path: config.sync_path.clone(),
            epoch: config.collection_epoch(),
            poll_interval: config.sync_poll_interval(),
            policy: config.epoch_policy,
            remote,
            encryptor,
            kv,
            writer,
            connectivity,
            last_seen_key,
            state: Mutex::new(CollectorState {
                last_mutation_read,
                ..CollectorState::default()
            }),
            synched: AtomicBool::new(synched),
            halted: AtomicBool::new(false),
        }
    }

    /// True if the last epoch reached every peer and the writer's last
    /// upload succeeded.
    pub fn is_connected(&self) -> bool {
        self.connectivity.is_connected()
    }

    /// True once any epoch has fully succeeded in this store's lifetime.
    pub fn is_synched(&self) -> bool {
        self.synched.load(Ordering::Acquire)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Waits until [`Collector::is_synched`] or until `timeout` elapses.
    /// Returns whether the store is synched.
    pub async fn wait_until_synched(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_synched() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Runs one epoch right away, then one per collection epoch, until
    /// `cancel` fires or the collector halts. A running epoch is always
    /// finished.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.epoch);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Collector started for {}", self.my_id);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Collector stopping: cancelled");
                    break;
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.collect().await {
                        warn!("Collection epoch failed: {}", e);
                    }
                    if self.is_halted() {
                        error!("Collector halted, no further epochs will run");
                        break;
                    }
                }
            }
        }
    }

    /// Runs one collection epoch.
    pub async fn collect(&self) -> SyncResult<()> {
        if self.is_halted() {
            return Err(SyncError::CollectorHalted);
        }
        let mut state = self.state.lock().await;
        let started = Instant::now();

        let devices = match self.list_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                self.connectivity.set_collector(false);
                return Err(e);
            }
        };
        for device in &devices {
            state.last_mutation_read.entry(*device).or_insert(0);
        }

        // Fetch
        let fetches = devices
            .iter()
            .filter(|device| **device != self.my_id)
            .map(|device| {
                let last_read = state.last_update_read.get(device).copied();
                async move { (*device, self.fetch(*device, last_read).await) }
            });
        let results = join_all(fetches).await;

        let mut updated = HashMap::new();
        let mut errors = Vec::new();
        for (device, result) in results {
            match result {
                Ok(Fetched::Unchanged) => {}
                Ok(Fetched::Updated { modified, patch }) => {
                    updated.insert(device, (modified, patch));
                }
                Err(e) => {
                    warn!("Failed to collect log of {}: {}", device, e);
                    errors.push(format!("{device}: {e}"));
                }
            }
        }

        self.connectivity.set_collector(errors.is_empty());
        if !errors.is_empty() && self.policy == EpochPolicy::AllOrNothing {
            return Err(SyncError::Collection(errors));
        }

        // Merge
        let (merge_guard, local) = self.writer.read_for_merge().await;
        let diff = {
            let peers: Vec<(&Patch, i64)> = devices
                .iter()
                .filter(|device| **device != self.my_id)
                .filter_map(|device| {
                    let patch = updated
                        .get(device)
                        .map(|(_, patch)| patch)
                        .or_else(|| state.device_patches.get(device))?;
                    let last_seen = state.last_mutation_read.get(device).copied().unwrap_or(0);
                    Some((patch, last_seen))
                })
                .collect();
            local.diff(&peers)
        };

        // Apply
        let update_count = diff.updates.len();
        let applied = self.apply(diff.updates).await;
        drop(merge_guard);
        if let Err(e) = applied {
            error!("Failed to apply peer updates, halting collector: {}", e);
            self.halted.store(true, Ordering::Release);
            return Err(e);
        }

        // Advance
        state.last_mutation_read.extend(diff.last_seen);
        self.save_last_seen(&state.last_mutation_read).await;
        let updated_devices = updated.len();
        for (device, (modified, patch)) in updated {
            state.last_update_read.insert(device, modified);
            state.device_patches.insert(device, patch);
        }

        info!(
            "Applied {} update(s) from {} changed device log(s) in {} ms",
            update_count,
            updated_devices,
            started.elapsed().as_millis()
        );

        if !errors.is_empty() {
            return Err(SyncError::Collection(errors));
        }
        self.mark_synched().await;
        Ok(())
    }

    /// Lists every device of this collective on the remote.
    async fn list_devices(&self) -> SyncResult<Vec<InstanceId>> {
        let mut devices = Vec::new();
        for key_id in self.remote.read_dir(&self.sync_path).await? {
            let dir = format!("{}/{}", self.sync_path, key_id);
            for name in self.remote.read_dir(&dir).await? {
                match InstanceId::parse(&name) {
                    Ok(device) if self.encryptor.key_id(&device) == key_id => devices.push(device),
                    Ok(device) => {
                        debug!("Skipping device {} under foreign key ID {}", device, key_id);
                    }
                    Err(e) => warn!("Skipping unrecognized remote entry {}: {}", name, e),
                }
            }
        }
        devices.sort();
        devices.dedup();
        Ok(devices)
    }

    async fn fetch(&self, device: InstanceId, last_read: Option<SystemTime>) -> SyncResult<Fetched> {
        let path = log_path(&self.sync_path, &self.encryptor.key_id(&device), &device);
        let modified = self.remote.get_last_modified(&path).await?;
        if last_read.is_some_and(|last| modified <= last) {
            return Ok(Fetched::Unchanged);
        }

        let file = self.remote.read(&path).await?;
        let (header, ciphertext) = decode_file(&file)?;
        if header.device != device {
            return Err(SyncError::Codec(format!(
                "log at {path} claims to belong to {}",
                header.device
            )));
        }
        let plaintext = self.encryptor.decrypt(&ciphertext)?;
        let patch = Patch::deserialize(device, &plaintext)?;

        debug!("Fetched log of {} with {} key(s)", device, patch.len());
        Ok(Fetched::Updated { modified, patch })
    }

    /// Applies winning mutates: plain keys one blocking task each, map
    /// elements in one transaction per map. Index markers carry no data of
    /// their own and are skipped.
    async fn apply(&self, updates: BTreeMap<String, Mutate>) -> SyncResult<()> {
        let mut plain = Vec::new();
        let mut maps: BTreeMap<String, BTreeMap<String, Option<Vec<u8>>>> = BTreeMap::new();

        for (key, mutate) in updates {
            match StoreKey::decode(&key) {
                Ok(StoreKey::Plain(key)) => plain.push((key, mutate)),
                Ok(StoreKey::MapElement { map, element }) => {
                    let value = (!mutate.deletion).then(|| mutate.value.unwrap_or_default());
                    maps.entry(map).or_default().insert(element, value);
                }
                Ok(StoreKey::MapIndex { .. }) => {}
                Ok(StoreKey::Internal(name)) => {
                    warn!("Ignoring peer mutate on internal key {}", name);
                }
                Err(e) => warn!("Ignoring peer mutate on undecodable key: {}", e),
            }
        }

        let tasks = plain.into_iter().map(|(key, mutate)| {
            let kv = Arc::clone(&self.kv);
            tokio::task::spawn_blocking(move || {
                if mutate.deletion {
                    kv.delete_from_remote(&key)
                } else {
                    kv.set_from_remote(&key, mutate.value().unwrap_or_default())
                }
            })
        });
        for result in join_all(tasks).await {
            result??;
        }

        for (map_name, edits) in maps {
            let kv = Arc::clone(&self.kv);
            tokio::task::spawn_blocking(move || kv.map_transaction_from_remote(&map_name, &edits))
                .await??;
        }
        Ok(())
    }

    async fn save_last_seen(&self, table: &BTreeMap<InstanceId, i64>) {
        let encoded = match serde_json::to_vec(table) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Failed to encode last-seen table, data may be replayed: {}", e);
                return;
            }
        };
        let store = Arc::clone(self.kv.store());
        let key = self.last_seen_key.clone();
        match tokio::task::spawn_blocking(move || store.set(&key, &encoded)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to store last-seen table, data may be replayed: {}", e),
            Err(e) => warn!("Last-seen table write did not complete: {}", e),
        }
    }

    async fn mark_synched(&self) {
        if self.synched.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("First successful collection, store is synched");
        let store = Arc::clone(self.kv.store());
        let key = internal_key(SYNCHED_KEY);
        match tokio::task::spawn_blocking(move || store.set(&key, SYNCHED_VALUE)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to persist synched flag: {}", e),
            Err(e) => warn!("Synched flag write did not complete: {}", e),
        }
    }
}

/// Loads the last-seen table. Anything unreadable is treated as empty,
/// which only replays updates that were already applied.
fn load_last_seen(store: &dyn KeyValueStore, key: &str) -> BTreeMap<InstanceId, i64> {
    match store.get(key) {
        Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            warn!("Failed to decode last-seen table, data may be replayed: {}", e);
            BTreeMap::new()
        }),
        Ok(None) => BTreeMap::new(),
        Err(e) => {
            warn!("Failed to load last-seen table, data may be replayed: {}", e);
            BTreeMap::new()
        }
    }
}
