//! Local KV adapter.
//!
//! [`InternalKv`] wraps the local [`KeyValueStore`] and is the only place
//! that fires key and map listeners. Writes arrive from two directions:
//!
//! - the local path (application writes to local-only keys, or writes the
//!   transaction log writer has already applied), which only notifies
//!   listeners registered with `local_events`
//! - the collector path (winning mutates from peers), which always notifies
//!
//! Callbacks run on a dedicated dispatcher task in the order the changes
//! were observed. The thread that changed the store never runs them.

use crate::error::{SyncError, SyncResult};
use crate::map;
use collective_storage::{KeyValueStore, StorageResult};
use collective_types::{InstanceId, StoreKey};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const REMOTE_STATUS_KEY: &str = "kv_remote_status";
const REMOTE_STATUS_VALUE: &[u8] = b"REMOTE";
const INSTANCE_ID_KEY: &str = "instance_id";

/// What happened to a key or map element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyOperation {
    Created,
    Updated,
    Deleted,
    /// Current value replayed when a listener is registered.
    Loaded,
}

impl KeyOperation {
    /// Classifies a change from `old` to `new`. `None` for "no change".
    pub(crate) fn classify(old: Option<&[u8]>, new: Option<&[u8]>) -> Option<Self> {
        match (old, new) {
            (None, None) => None,
            (None, Some(_)) => Some(Self::Created),
            (Some(_), Some(_)) => Some(Self::Updated),
            (Some(_), None) => Some(Self::Deleted),
        }
    }
}

/// The change made to one map element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementEdit {
    pub old: Option<Vec<u8>>,
    pub new: Option<Vec<u8>>,
    pub operation: KeyOperation,
}

/// Called with `(old, new, operation)` when a watched key changes.
pub type KeyCallback = Arc<dyn Fn(Option<Vec<u8>>, Option<Vec<u8>>, KeyOperation) + Send + Sync>;

/// Called with every element edit of one change to a watched map.
pub type MapCallback = Arc<dyn Fn(BTreeMap<String, ElementEdit>) + Send + Sync>;

struct Listener<C> {
    callback: C,
    local_events: bool,
}

type Job = Box<dyn FnOnce() + Send>;

/// Runs listener callbacks one at a time, in submission order.
struct Dispatcher {
    tx: mpsc::UnboundedSender<Job>,
}

impl Dispatcher {
    /// Spawns the dispatcher task. Must be called inside a Tokio runtime.
    fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(e) = tokio::task::spawn_blocking(job).await {
                    warn!("Listener callback panicked: {}", e);
                }
            }
            debug!("Listener dispatcher stopped");
        });
        Self { tx }
    }

    fn dispatch(&self, job: Job) {
        if self.tx.send(job).is_err() {
            debug!("Listener dispatcher gone, dropping notification");
        }
    }
}

/// The local store plus its change listeners.
pub struct InternalKv {
    store: Arc<dyn KeyValueStore>,
    key_listeners: RwLock<HashMap<String, Listener<KeyCallback>>>,
    map_listeners: RwLock<HashMap<String, Listener<MapCallback>>>,
    dispatcher: Dispatcher,
}

impl InternalKv {
    /// Wraps `store`. Must be called inside a Tokio runtime.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            key_listeners: RwLock::new(HashMap::new()),
            map_listeners: RwLock::new(HashMap::new()),
            dispatcher: Dispatcher::spawn(),
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    // ── Reads ───────────────────────────────────────────────────

    pub fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.store.get(key)
    }

    /// Reads every element of `map` from one consistent snapshot.
    pub fn get_map(&self, map_name: &str) -> StorageResult<BTreeMap<String, Vec<u8>>> {
        let mut elements = BTreeMap::new();
        self.store
            .transaction(&[map::index_key(map_name)], &mut |tx| {
                elements = map::read_map(tx, map_name)?;
                Ok(())
            })?;
        Ok(elements)
    }

    pub fn get_map_element(&self, map_name: &str, element: &str) -> StorageResult<Option<Vec<u8>>> {
        self.store.get(&map::element_key(map_name, element))
    }

    // ── Local path ──────────────────────────────────────────────

    /// Writes a local-only key. Returns the previous value.
    pub fn set_local(&self, key: &str, value: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let old = self.swap(key, Some(value))?;
        self.notify_key(key, old.clone(), Some(value.to_vec()), false);
        Ok(old)
    }

    /// Deletes a local-only key. Returns the previous value.
    pub fn delete_local(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let old = self.swap(key, None)?;
        self.notify_key(key, old.clone(), None, false);
        Ok(old)
    }

    /// Applies `edits` to a local-only map in one transaction.
    pub fn local_map_write(
        &self,
        map_name: &str,
        edits: &BTreeMap<String, Option<Vec<u8>>>,
        replace: bool,
    ) -> StorageResult<BTreeMap<String, ElementEdit>> {
        let applied = self.map_transaction(map_name, edits, replace)?;
        self.notify_map(map_name, applied.clone(), false);
        Ok(applied)
    }

    /// Reports a key change that was applied to the store elsewhere.
    pub(crate) fn notify_key_local(&self, key: &str, old: Option<Vec<u8>>, new: Option<Vec<u8>>) {
        self.notify_key(key, old, new, false);
    }

    /// Reports a map change that was applied to the store elsewhere.
    pub(crate) fn notify_map_local(&self, map_name: &str, edits: BTreeMap<String, ElementEdit>) {
        self.notify_map(map_name, edits, false);
    }

    // ── Collector path ──────────────────────────────────────────

    pub fn set_from_remote(&self, key: &str, value: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let old = self.swap(key, Some(value))?;
        self.notify_key(key, old.clone(), Some(value.to_vec()), true);
        Ok(old)
    }

    pub fn delete_from_remote(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let old = self.swap(key, None)?;
        self.notify_key(key, old.clone(), None, true);
        Ok(old)
    }

    /// Applies a peer's element edits to `map_name` in one transaction.
    pub fn map_transaction_from_remote(
        &self,
        map_name: &str,
        edits: &BTreeMap<String, Option<Vec<u8>>>,
    ) -> StorageResult<BTreeMap<String, ElementEdit>> {
        let applied = self.map_transaction(map_name, edits, false)?;
        self.notify_map(map_name, applied.clone(), true);
        Ok(applied)
    }

    // ── Listeners ───────────────────────────────────────────────

    /// Watches `key`. Replaces any earlier listener on the same key.
    ///
    /// The current value, if any, is replayed first as
    /// [`KeyOperation::Loaded`]. With `local_events` the callback also sees
    /// changes made on this device; otherwise only changes from peers.
    pub fn listen_on_key(
        &self,
        key: &str,
        callback: KeyCallback,
        local_events: bool,
    ) -> StorageResult<()> {
        let mut listeners = self.key_listeners.write();
        let current = self.store.get(key)?;
        listeners.insert(
            key.to_string(),
            Listener {
                callback: Arc::clone(&callback),
                local_events,
            },
        );
        if let Some(value) = current {
            self.dispatcher
                .dispatch(Box::new(move || callback(None, Some(value), KeyOperation::Loaded)));
        }
        Ok(())
    }

    /// Watches every element of `map_name`. Replaces any earlier listener
    /// on the same map. Existing elements are replayed first as
    /// [`KeyOperation::Loaded`].
    pub fn listen_on_map(
        &self,
        map_name: &str,
        callback: MapCallback,
        local_events: bool,
    ) -> StorageResult<()> {
        let mut listeners = self.map_listeners.write();
        let current = self.get_map(map_name)?;
        listeners.insert(
            map_name.to_string(),
            Listener {
                callback: Arc::clone(&callback),
                local_events,
            },
        );
        if !current.is_empty() {
            let loaded = current
                .into_iter()
                .map(|(element, value)| {
                    (
                        element,
                        ElementEdit {
                            old: None,
                            new: Some(value),
                            operation: KeyOperation::Loaded,
                        },
                    )
                })
                .collect();
            self.dispatcher.dispatch(Box::new(move || callback(loaded)));
        }
        Ok(())
    }

    // ── Remote flag ─────────────────────────────────────────────

    /// Marks the store as synchronized. The mark is permanent.
    pub fn enable_remote(&self) -> StorageResult<()> {
        self.store
            .set(&internal_key(REMOTE_STATUS_KEY), REMOTE_STATUS_VALUE)
    }

    /// True if this store has ever been opened for synchronization.
    pub fn is_remote(&self) -> StorageResult<bool> {
        Ok(self
            .store
            .get(&internal_key(REMOTE_STATUS_KEY))?
            .is_some_and(|v| v == REMOTE_STATUS_VALUE))
    }

    // ── Internals ───────────────────────────────────────────────

    fn swap(&self, key: &str, value: Option<&[u8]>) -> StorageResult<Option<Vec<u8>>> {
        let mut old = None;
        self.store.transaction(&[key.to_string()], &mut |tx| {
            old = tx.get(key)?;
            match value {
                Some(v) => tx.set(key, v.to_vec()),
                None => tx.delete(key),
            }
            Ok(())
        })?;
        Ok(old)
    }

    fn map_transaction(
        &self,
        map_name: &str,
        edits: &BTreeMap<String, Option<Vec<u8>>>,
        replace: bool,
    ) -> StorageResult<BTreeMap<String, ElementEdit>> {
        let mut applied = BTreeMap::new();
        self.store
            .transaction(&[map::index_key(map_name)], &mut |tx| {
                applied = map::apply_map_edits(tx, map_name, edits, replace)?;
                Ok(())
            })?;
        Ok(applied)
    }

    fn notify_key(&self, key: &str, old: Option<Vec<u8>>, new: Option<Vec<u8>>, remote: bool) {
        let Some(operation) = KeyOperation::classify(old.as_deref(), new.as_deref()) else {
            return;
        };
        let listeners = self.key_listeners.read();
        let Some(listener) = listeners.get(key) else {
            return;
        };
        if !remote && !listener.local_events {
            return;
        }
        let callback = Arc::clone(&listener.callback);
        self.dispatcher
            .dispatch(Box::new(move || callback(old, new, operation)));
    }

    fn notify_map(&self, map_name: &str, edits: BTreeMap<String, ElementEdit>, remote: bool) {
        if edits.is_empty() {
            return;
        }
        let listeners = self.map_listeners.read();
        let Some(listener) = listeners.get(map_name) else {
            return;
        };
        if !remote && !listener.local_events {
            return;
        }
        let callback = Arc::clone(&listener.callback);
        self.dispatcher.dispatch(Box::new(move || callback(edits)));
    }
}

/// Encoded key of an engine-owned entry.
pub(crate) fn internal_key(name: &str) -> String {
    StoreKey::Internal(name.to_string()).encode()
}

/// Returns the store's instance ID, generating and persisting one on first
/// use.
pub(crate) fn get_or_init_instance_id(store: &dyn KeyValueStore) -> SyncResult<InstanceId> {
    let key = internal_key(INSTANCE_ID_KEY);
    let mut stored = None;
    let mut created = None;
    store.transaction(&[key.clone()], &mut |tx| {
        stored = tx.get(&key)?;
        if stored.is_none() {
            let id = InstanceId::new();
            tx.set(&key, id.to_string().into_bytes());
            created = Some(id);
        }
        Ok(())
    })?;

    if let Some(id) = created {
        info!("Generated instance ID {}", id);
        return Ok(id);
    }
    let bytes = stored.ok_or_else(|| SyncError::Codec("instance ID vanished".to_string()))?;
    let text = String::from_utf8(bytes)
        .map_err(|e| SyncError::Codec(format!("stored instance ID is not UTF-8: {e}")))?;
    Ok(InstanceId::parse(&text)?)
}
