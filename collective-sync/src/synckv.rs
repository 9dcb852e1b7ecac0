//! The synchronized, versioned key-value store applications use.
//!
//! Values are stored as versioned [`Object`]s under
//! `<prefix>/<prefix>/.../<key>_<version>`. A view whose prefix chain
//! contains one of the configured synchronized prefixes sends its writes
//! through the transaction log writer; every other view writes locally
//! only. Reads always come from the local store.

use crate::collector::Collector;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::kv::{ElementEdit, InternalKv, KeyOperation, get_or_init_instance_id};
use crate::map;
use crate::notifier::Connectivity;
use crate::remote::{NoopRemote, RemoteStore};
use crate::writer::RemoteWriter;
use collective_crypto::{CollectiveEncryptor, Encryptor};
use collective_storage::KeyValueStore;
use collective_types::{InstanceId, StoreKey, now_nanos, validate_name};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const PREFIX_SEPARATOR: char = '/';
const VERSION_SEPARATOR: char = '_';

/// A versioned value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    #[serde(rename = "Version")]
    pub version: u64,
    /// Unix nanoseconds at which the object was created.
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
    #[serde(rename = "Data", with = "base64_data")]
    pub data: Vec<u8>,
}

impl Object {
    /// Creates an object stamped with the current time.
    pub fn new(version: u64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            version,
            timestamp: now_nanos(),
            data: data.into(),
        }
    }

    fn encode(&self) -> SyncResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn decode(bytes: &[u8]) -> SyncResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

mod base64_data {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// The change made to one element of a watched map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEdit {
    pub old: Option<Object>,
    pub new: Option<Object>,
    pub operation: KeyOperation,
}

/// Handle to the background writer and collector tasks.
#[derive(Debug)]
pub struct ProcessHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
    /// Signals every task to stop. Queued writes are still persisted.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits for every task to exit. Does not stop them.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Background task did not exit cleanly: {}", e);
            }
        }
    }

    /// Stops the tasks and waits for them to exit.
    pub async fn shutdown(self) {
        self.stop();
        self.join().await;
    }
}

struct SyncInner {
    my_id: InstanceId,
    config: SyncConfig,
    kv: Arc<InternalKv>,
    writer: Arc<RemoteWriter>,
    collector: Option<Arc<Collector>>,
    connectivity: Arc<Connectivity>,
    running: AtomicBool,
}

/// A view of a synchronized store at one prefix chain.
///
/// Views are cheap to clone and share all state with the store they were
/// derived from.
#[derive(Clone)]
pub struct SyncKv {
    inner: Arc<SyncInner>,
    prefixes: Vec<String>,
    synchronized: bool,
}

impl SyncKv {
    // ── Construction ────────────────────────────────────────────

    /// Opens `store` for synchronization through `remote`.
    ///
    /// Generates the instance ID on first use and marks the store as
    /// synchronized, after which it can no longer be opened local-only.
    pub async fn open(
        config: SyncConfig,
        secret: &[u8],
        remote: Arc<dyn RemoteStore>,
        store: Arc<dyn KeyValueStore>,
    ) -> SyncResult<Self> {
        let encryptor: Arc<dyn Encryptor> = Arc::new(CollectiveEncryptor::new(secret)?);
        Self::open_with_encryptor(config, encryptor, remote, store).await
    }

    /// Like [`SyncKv::open`], with a caller-supplied encryptor.
    pub async fn open_with_encryptor(
        config: SyncConfig,
        encryptor: Arc<dyn Encryptor>,
        remote: Arc<dyn RemoteStore>,
        store: Arc<dyn KeyValueStore>,
    ) -> SyncResult<Self> {
        let kv = Arc::new(InternalKv::new(Arc::clone(&store)));
        let connectivity = Arc::new(Connectivity::new());

        let (my_id, writer, collector) = {
            let kv = Arc::clone(&kv);
            let config = config.clone();
            let connectivity = Arc::clone(&connectivity);
            tokio::task::spawn_blocking(move || -> SyncResult<_> {
                let my_id = get_or_init_instance_id(store.as_ref())?;
                if !kv.is_remote()? {
                    info!("Converting store to a synchronized store: {}", my_id);
                    kv.enable_remote()?;
                }

                let writer = Arc::new(RemoteWriter::new(
                    my_id,
                    &config,
                    store,
                    Arc::clone(&remote),
                    Arc::clone(&encryptor),
                    Arc::clone(&connectivity),
                )?);
                let collector = Collector::new(
                    my_id,
                    &config,
                    remote,
                    encryptor,
                    kv,
                    Arc::clone(&writer),
                    connectivity,
                );
                Ok((my_id, writer, collector))
            })
            .await??
        };

        Ok(Self::from_parts(SyncInner {
            my_id,
            config,
            kv,
            writer,
            collector: Some(Arc::new(collector)),
            connectivity,
            running: AtomicBool::new(false),
        }))
    }

    /// Opens `store` without synchronization. No prefix is synchronized
    /// and nothing is collected.
    ///
    /// Fails with [`SyncError::RemoteDowngrade`] if the store has ever been
    /// opened with [`SyncKv::open`].
    pub async fn open_local(
        config: SyncConfig,
        secret: &[u8],
        store: Arc<dyn KeyValueStore>,
    ) -> SyncResult<Self> {
        let encryptor: Arc<dyn Encryptor> = Arc::new(CollectiveEncryptor::new(secret)?);
        let kv = Arc::new(InternalKv::new(Arc::clone(&store)));
        let connectivity = Arc::new(Connectivity::new());
        let config = SyncConfig {
            synchronized_prefixes: Vec::new(),
            ..config
        };

        let (my_id, writer) = {
            let kv = Arc::clone(&kv);
            let config = config.clone();
            let connectivity = Arc::clone(&connectivity);
            tokio::task::spawn_blocking(move || -> SyncResult<_> {
                if kv.is_remote()? {
                    error!("Refusing to open a synchronized store as local-only");
                    return Err(SyncError::RemoteDowngrade);
                }
                let my_id = get_or_init_instance_id(store.as_ref())?;
                let writer = RemoteWriter::new(
                    my_id,
                    &config,
                    store,
                    Arc::new(NoopRemote),
                    encryptor,
                    connectivity,
                )?;
                Ok((my_id, Arc::new(writer)))
            })
            .await??
        };

        Ok(Self::from_parts(SyncInner {
            my_id,
            config,
            kv,
            writer,
            collector: None,
            connectivity,
            running: AtomicBool::new(false),
        }))
    }

    /// Opens `store` for synchronization and runs one collection epoch, so
    /// the returned store already holds the collective's state.
    pub async fn clone_from_remote(
        config: SyncConfig,
        secret: &[u8],
        remote: Arc<dyn RemoteStore>,
        store: Arc<dyn KeyValueStore>,
    ) -> SyncResult<Self> {
        let kv = Self::open(config, secret, remote, store).await?;
        if let Some(collector) = &kv.inner.collector {
            collector.collect().await?;
        }
        Ok(kv)
    }

    fn from_parts(inner: SyncInner) -> Self {
        let mut kv = Self {
            inner: Arc::new(inner),
            prefixes: Vec::new(),
            synchronized: false,
        };
        kv.synchronized = kv.chain_is_synchronized();
        kv
    }

    // ── Prefixes ────────────────────────────────────────────────

    /// Returns a child view with `prefix` appended to the chain.
    pub fn prefix(&self, prefix: &str) -> SyncResult<Self> {
        validate_name(prefix)?;
        if prefix.contains(PREFIX_SEPARATOR) {
            return Err(SyncError::InvalidPrefix(format!(
                "{prefix:?} contains {PREFIX_SEPARATOR:?}"
            )));
        }
        if self.has_prefix(prefix) {
            return Err(SyncError::InvalidPrefix(format!(
                "{prefix:?} is already in the chain"
            )));
        }

        let mut child = self.clone();
        child.prefixes.push(prefix.to_string());
        child.synchronized = child.chain_is_synchronized();
        Ok(child)
    }

    /// Returns the view with an empty prefix chain.
    pub fn root(&self) -> Self {
        let mut root = self.clone();
        root.prefixes.clear();
        root.synchronized = root.chain_is_synchronized();
        root
    }

    /// The prefix chain joined by `/`.
    pub fn get_prefix(&self) -> String {
        self.prefixes.join("/")
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.prefixes.iter().any(|p| p == prefix)
    }

    /// True if writes through this view are synchronized.
    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    /// The store key of `key` at `version` in this view.
    pub fn get_full_key(&self, key: &str, version: u64) -> String {
        let mut full = String::new();
        for prefix in &self.prefixes {
            full.push_str(prefix);
            full.push(PREFIX_SEPARATOR);
        }
        full.push_str(key);
        full.push(VERSION_SEPARATOR);
        full.push_str(&version.to_string());
        full
    }

    fn chain_is_synchronized(&self) -> bool {
        self.prefixes
            .iter()
            .any(|p| self.inner.config.synchronized_prefixes.contains(p))
    }

    fn checked_key(&self, key: &str, version: u64) -> SyncResult<String> {
        validate_name(key)?;
        let full = self.get_full_key(key, version);
        StoreKey::plain(full.as_str())?;
        Ok(full)
    }

    // ── Keys ────────────────────────────────────────────────────

    pub async fn get(&self, key: &str, version: u64) -> SyncResult<Option<Object>> {
        let full = self.checked_key(key, version)?;
        let kv = Arc::clone(&self.inner.kv);
        let stored = tokio::task::spawn_blocking(move || kv.get(&full)).await??;
        stored.as_deref().map(Object::decode).transpose()
    }

    /// Stores `object` under `key` at the object's version.
    pub async fn set(&self, key: &str, object: &Object) -> SyncResult<()> {
        let full = self.checked_key(key, object.version)?;
        let encoded = object.encode()?;

        if self.synchronized {
            let old = self.inner.writer.write(&full, &encoded).await?;
            self.inner.kv.notify_key_local(&full, old, Some(encoded));
        } else {
            let kv = Arc::clone(&self.inner.kv);
            tokio::task::spawn_blocking(move || kv.set_local(&full, &encoded)).await??;
        }
        Ok(())
    }

    pub async fn delete(&self, key: &str, version: u64) -> SyncResult<()> {
        let full = self.checked_key(key, version)?;

        if self.synchronized {
            let old = self.inner.writer.delete(&full).await?;
            self.inner.kv.notify_key_local(&full, old, None);
        } else {
            let kv = Arc::clone(&self.inner.kv);
            tokio::task::spawn_blocking(move || kv.delete_local(&full)).await??;
        }
        Ok(())
    }

    // ── Maps ────────────────────────────────────────────────────

    /// Replaces the whole map with `values`. Elements not in `values` are
    /// deleted. Every value must carry `map_version`.
    pub async fn store_map(
        &self,
        map_name: &str,
        values: BTreeMap<String, Object>,
        map_version: u64,
    ) -> SyncResult<()> {
        let full_map = self.checked_key(map_name, map_version)?;
        let mut edits = BTreeMap::new();
        for (element, value) in values {
            validate_name(&element)?;
            check_version(map_version, value.version)?;
            edits.insert(element, Some(value.encode()?));
        }
        self.write_map(full_map, edits, true).await?;
        Ok(())
    }

    /// Stores one element of a map. `value` must carry `map_version`.
    pub async fn store_map_element(
        &self,
        map_name: &str,
        element: &str,
        value: &Object,
        map_version: u64,
    ) -> SyncResult<()> {
        let full_map = self.checked_key(map_name, map_version)?;
        validate_name(element)?;
        check_version(map_version, value.version)?;
        let edits = BTreeMap::from([(element.to_string(), Some(value.encode()?))]);
        self.write_map(full_map, edits, false).await?;
        Ok(())
    }

    pub async fn get_map(
        &self,
        map_name: &str,
        map_version: u64,
    ) -> SyncResult<BTreeMap<String, Object>> {
        let full_map = self.checked_key(map_name, map_version)?;
        let kv = Arc::clone(&self.inner.kv);
        let stored = tokio::task::spawn_blocking(move || kv.get_map(&full_map)).await??;
        stored
            .into_iter()
            .map(|(element, bytes)| Ok((element, Object::decode(&bytes)?)))
            .collect()
    }

    pub async fn get_map_element(
        &self,
        map_name: &str,
        element: &str,
        map_version: u64,
    ) -> SyncResult<Option<Object>> {
        let full_map = self.checked_key(map_name, map_version)?;
        validate_name(element)?;
        let kv = Arc::clone(&self.inner.kv);
        let element = element.to_string();
        let stored =
            tokio::task::spawn_blocking(move || kv.get_map_element(&full_map, &element)).await??;
        stored.as_deref().map(Object::decode).transpose()
    }

    /// Deletes one element of a map and returns it. Deleting the last
    /// element removes the map.
    pub async fn delete_map_element(
        &self,
        map_name: &str,
        element: &str,
        map_version: u64,
    ) -> SyncResult<Option<Object>> {
        let full_map = self.checked_key(map_name, map_version)?;
        validate_name(element)?;
        let edits = BTreeMap::from([(element.to_string(), None)]);
        let mut applied = self.write_map(full_map, edits, false).await?;
        applied
            .remove(element)
            .and_then(|edit| edit.old)
            .as_deref()
            .map(Object::decode)
            .transpose()
    }

    async fn write_map(
        &self,
        full_map: String,
        edits: BTreeMap<String, Option<Vec<u8>>>,
        replace: bool,
    ) -> SyncResult<BTreeMap<String, ElementEdit>> {
        if self.synchronized {
            let applied = self
                .inner
                .writer
                .write_map(&full_map, edits, replace)
                .await?;
            self.inner.kv.notify_map_local(&full_map, applied.clone());
            Ok(applied)
        } else {
            let kv = Arc::clone(&self.inner.kv);
            let applied = tokio::task::spawn_blocking(move || {
                kv.local_map_write(&full_map, &edits, replace)
            })
            .await??;
            Ok(applied)
        }
    }

    // ── Listeners ───────────────────────────────────────────────

    /// Calls `callback(old, new, operation)` whenever `key` changes. The
    /// current value is replayed first as [`KeyOperation::Loaded`].
    ///
    /// Without `local_events` only changes collected from peers are
    /// reported.
    pub fn listen_on_remote_key<F>(
        &self,
        key: &str,
        version: u64,
        callback: F,
        local_events: bool,
    ) -> SyncResult<()>
    where
        F: Fn(Option<Object>, Option<Object>, KeyOperation) + Send + Sync + 'static,
    {
        let full = self.checked_key(key, version)?;
        let watched = full.clone();
        let wrapped = move |old: Option<Vec<u8>>, new: Option<Vec<u8>>, op: KeyOperation| {
            let old = decode_or_warn(&watched, old);
            let new = decode_or_warn(&watched, new);
            callback(old, new, op);
        };
        self.inner
            .kv
            .listen_on_key(&full, Arc::new(wrapped), local_events)?;
        Ok(())
    }

    /// Calls `callback` with the element edits of every change to a map.
    /// Existing elements are replayed first as [`KeyOperation::Loaded`].
    /// Updates that leave an element's data unchanged are not reported.
    pub fn listen_on_remote_map<F>(
        &self,
        map_name: &str,
        map_version: u64,
        callback: F,
        local_events: bool,
    ) -> SyncResult<()>
    where
        F: Fn(BTreeMap<String, ObjectEdit>) + Send + Sync + 'static,
    {
        let full_map = self.checked_key(map_name, map_version)?;
        let watched = full_map.clone();
        let wrapped = move |edits: BTreeMap<String, ElementEdit>| {
            let mut decoded = BTreeMap::new();
            for (element, edit) in edits {
                let old = decode_or_warn(&watched, edit.old);
                let new = decode_or_warn(&watched, edit.new);
                if let (Some(o), Some(n)) = (&old, &new) {
                    if o.data == n.data {
                        continue;
                    }
                }
                decoded.insert(
                    element,
                    ObjectEdit {
                        old,
                        new,
                        operation: edit.operation,
                    },
                );
            }
            if !decoded.is_empty() {
                callback(decoded);
            }
        };
        self.inner
            .kv
            .listen_on_map(&full_map, Arc::new(wrapped), local_events)?;
        Ok(())
    }

    // ── Processes and status ────────────────────────────────────

    /// Starts the writer and, if synchronized, the collector.
    ///
    /// Writes to synchronized keys wait for the writer, so this must be
    /// called before they can complete.
    pub fn start_processes(&self) -> SyncResult<ProcessHandle> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(SyncError::AlreadyRunning);
        }
        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(2);

        let writer = Arc::clone(&self.inner.writer);
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = writer.run(token).await {
                error!("Transaction log writer exited: {}", e);
            }
        }));

        if let Some(collector) = &self.inner.collector {
            let collector = Arc::clone(collector);
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move { collector.run(token).await }));
        }

        info!("Started background processes for {}", self.inner.my_id);
        Ok(ProcessHandle { cancel, tasks })
    }

    /// Receives every change of the combined connectivity state.
    pub fn subscribe_connectivity(&self) -> broadcast::Receiver<bool> {
        self.inner.writer.subscribe()
    }

    /// Calls `callback` with the current connectivity state, then with
    /// every change.
    pub fn register_connection_tracker<F>(&self, callback: F)
    where
        F: Fn(bool) + Send + 'static,
    {
        let current = self.is_connected();
        self.inner
            .connectivity
            .notifier()
            .register(Some(current), callback);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connectivity.is_connected()
    }

    pub fn is_synched(&self) -> bool {
        self.inner
            .collector
            .as_ref()
            .is_some_and(|collector| collector.is_synched())
    }

    /// Waits until the store has completed one full collection, or until
    /// `timeout`. Returns false right away for a local-only store.
    pub async fn wait_for_remote(&self, timeout: Duration) -> bool {
        match &self.inner.collector {
            Some(collector) => collector.wait_until_synched(timeout).await,
            None => false,
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.inner.my_id
    }

    /// Encoded index key of a map in this view. Exposed for diagnostics.
    pub fn map_index_key(&self, map_name: &str, map_version: u64) -> String {
        map::index_key(&self.get_full_key(map_name, map_version))
    }
}

impl std::fmt::Debug for SyncKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncKv")
            .field("instance_id", &self.inner.my_id)
            .field("prefix", &self.get_prefix())
            .field("synchronized", &self.synchronized)
            .finish_non_exhaustive()
    }
}

fn check_version(expected: u64, found: u64) -> SyncResult<()> {
    if expected != found {
        return Err(SyncError::VersionMismatch { expected, found });
    }
    Ok(())
}

fn decode_or_warn(key: &str, bytes: Option<Vec<u8>>) -> Option<Object> {
    let bytes = bytes?;
    match Object::decode(&bytes) {
        Ok(object) => Some(object),
        Err(e) => {
            warn!("Failed to decode stored object at {}: {}", key, e);
            None
        }
    }
}
