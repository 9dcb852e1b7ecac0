//! Transaction log writer.
//!
//! The writer is the only code that changes this device's [`Patch`] or its
//! log file on the remote. Local writes to synchronized keys go through it:
//!
//! 1. the caller takes a shared lease on the merge lock, applies the change
//!    to the local store and records it in the mutate buffer, all in one
//!    store transaction, then queues the batch
//! 2. the runner drains the queue after a short batching window, folds the
//!    batches into the patch and persists the patch while clearing the
//!    folded batches from the buffer, again in one transaction
//! 3. the caller is acknowledged and its lease released
//! 4. the runner uploads the encrypted patch after the upload period,
//!    backing off on failure
//!
//! A crash between 1 and 2 is repaired at startup by replaying the mutate
//! buffer. A crash between 2 and 4 is repaired by the first upload after
//! restart, which always carries the whole patch.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::file::{Header, encode_file, log_path};
use crate::kv::{ElementEdit, internal_key};
use crate::map;
use crate::notifier::Connectivity;
use crate::remote::RemoteStore;
use collective_crdt::{Mutate, Patch};
use collective_crypto::Encryptor;
use collective_storage::{KeyValueStore, StorageError, StorageResult, Transaction};
use collective_types::{InstanceId, now_nanos};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MUTATE_BUFFER_KEY: &str = "mutate_buffer";

/// Batches applied to the local store but not yet folded into the persisted
/// patch, keyed by batch ID.
type MutateBuffer = BTreeMap<u64, BTreeMap<String, Mutate>>;

/// One caller's change, waiting for the runner.
struct Batch {
    id: u64,
    mutates: BTreeMap<String, Mutate>,
    // Held until the batch is persisted; keeps the collector out meanwhile
    _lease: OwnedRwLockReadGuard<()>,
    ack: oneshot::Sender<()>,
}

struct WriterShared {
    my_id: InstanceId,
    store: Arc<dyn KeyValueStore>,
    remote: Arc<dyn RemoteStore>,
    encryptor: Arc<dyn Encryptor>,
    connectivity: Arc<Connectivity>,
    upload_period: Duration,
    batch_window: Duration,
    config: SyncConfig,
    remote_path: String,
    patch_key: String,
    buffer_key: String,
    patch: RwLock<Patch>,
    revision: AtomicU64,
    merge_lock: Arc<tokio::sync::RwLock<()>>,
    queue: mpsc::UnboundedSender<Batch>,
    // Taken while a batch is applied and queued, so queue order is commit order
    submit_order: Mutex<()>,
    next_batch: AtomicU64,
    last_timestamp: AtomicI64,
    halted: AtomicBool,
    // Set under `submit_order` once the runner stops taking batches
    stopped: AtomicBool,
}

/// The transaction log writer of one synchronized store.
pub struct RemoteWriter {
    shared: Arc<WriterShared>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Batch>>>,
}

impl RemoteWriter {
    /// Loads the persisted patch, replays any batches a crash left in the
    /// mutate buffer, and persists the result.
    ///
    /// Performs blocking store I/O.
    pub fn new(
        my_id: InstanceId,
        config: &SyncConfig,
        store: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteStore>,
        encryptor: Arc<dyn Encryptor>,
        connectivity: Arc<Connectivity>,
    ) -> SyncResult<Self> {
        let patch_key = internal_key(&format!("txlog/{}", config.sync_path));
        let buffer_key = internal_key(MUTATE_BUFFER_KEY);
        let patch = load_patch(store.as_ref(), my_id, &patch_key, &buffer_key)?;
        let remote_path = log_path(&config.sync_path, &encryptor.key_id(&my_id), &my_id);
        let last_timestamp = patch.latest_timestamp().unwrap_or(0);

        debug!(
            "Transaction log writer for {} loaded {} key(s), log at {}",
            my_id,
            patch.len(),
            remote_path
        );

        let (queue, receiver) = mpsc::unbounded_channel();
        let shared = WriterShared {
            my_id,
            store,
            remote,
            encryptor,
            connectivity,
            upload_period: config.upload_period(),
            batch_window: config.batch_window(),
            config: config.clone(),
            remote_path,
            patch_key,
            buffer_key,
            patch: RwLock::new(patch),
            revision: AtomicU64::new(0),
            merge_lock: Arc::new(tokio::sync::RwLock::new(())),
            queue,
            submit_order: Mutex::new(()),
            next_batch: AtomicU64::new(0),
            last_timestamp: AtomicI64::new(last_timestamp),
            halted: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        };

        Ok(Self {
            shared: Arc::new(shared),
            receiver: Mutex::new(Some(receiver)),
        })
    }

    /// Remote path this device's log is uploaded to.
    pub fn remote_path(&self) -> &str {
        &self.shared.remote_path
    }

    /// A copy of the current patch.
    pub fn patch(&self) -> Patch {
        self.shared.patch.read().clone()
    }

    /// True if the last upload attempt succeeded.
    pub fn remote_up_to_date(&self) -> bool {
        self.shared.connectivity.writer_up_to_date()
    }

    /// Receives every change of the combined connectivity state, which
    /// includes this writer's upload outcome.
    pub fn subscribe(&self) -> broadcast::Receiver<bool> {
        self.shared.connectivity.notifier().subscribe()
    }

    /// True once the runner hit an unrecoverable local store failure.
    pub fn is_halted(&self) -> bool {
        self.shared.halted.load(Ordering::Acquire)
    }

    /// True once the runner was cancelled. Later writes are refused
    /// without touching the store.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    // ── Write path ──────────────────────────────────────────────

    /// Writes `value` to `key` and waits until the change is persisted in
    /// the patch. Returns the previous value.
    pub async fn write(&self, key: &str, value: &[u8]) -> SyncResult<Option<Vec<u8>>> {
        let key = key.to_string();
        let value = value.to_vec();
        self.submit(vec![key.clone()], move |tx, timestamp| {
            let old = tx.get(&key)?;
            tx.set(&key, value.clone());
            let mutates = BTreeMap::from([(key.clone(), Mutate::set(timestamp, value.clone()))]);
            Ok((mutates, old))
        })
        .await
    }

    /// Deletes `key` and waits until the deletion is persisted in the
    /// patch. Returns the previous value.
    pub async fn delete(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        let key = key.to_string();
        self.submit(vec![key.clone()], move |tx, timestamp| {
            let old = tx.get(&key)?;
            tx.delete(&key);
            let mutates = BTreeMap::from([(key.clone(), Mutate::delete(timestamp))]);
            Ok((mutates, old))
        })
        .await
    }

    /// Applies `edits` to `map_name` (`None` deletes an element) in one
    /// transaction and waits until they are persisted.
    ///
    /// With `replace`, existing elements missing from `edits` are deleted.
    /// Every touched element gets its own mutate, and the index key gets a
    /// marker mutate with the same timestamp.
    pub async fn write_map(
        &self,
        map_name: &str,
        edits: BTreeMap<String, Option<Vec<u8>>>,
        replace: bool,
    ) -> SyncResult<BTreeMap<String, ElementEdit>> {
        let map_name = map_name.to_string();
        self.submit(vec![map::index_key(&map_name)], move |tx, timestamp| {
            let applied = map::apply_map_edits(tx, &map_name, &edits, replace)?;

            let mut mutates = BTreeMap::new();
            for element in edits.keys().chain(applied.keys()) {
                let mutate = match edits.get(element) {
                    Some(Some(value)) => Mutate::set(timestamp, value.clone()),
                    _ => Mutate::delete(timestamp),
                };
                mutates.insert(map::element_key(&map_name, element), mutate);
            }
            mutates.insert(map::index_key(&map_name), Mutate::marker(timestamp));

            Ok((mutates, applied))
        })
        .await
    }

    async fn submit<T, F>(&self, keys: Vec<String>, apply: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnMut(&mut Transaction<'_>, i64) -> StorageResult<(BTreeMap<String, Mutate>, T)>
            + Send
            + 'static,
    {
        if self.is_halted() {
            return Err(SyncError::WriterHalted);
        }
        if self.is_stopped() {
            return Err(SyncError::WriterStopped);
        }

        let lease = Arc::clone(&self.shared.merge_lock).read_owned().await;
        let shared = Arc::clone(&self.shared);
        let (result, ack) =
            tokio::task::spawn_blocking(move || shared.apply_and_enqueue(keys, apply, lease))
                .await??;

        match ack.await {
            Ok(()) => Ok(result),
            Err(_) if self.is_halted() => Err(SyncError::WriterHalted),
            Err(_) => Err(SyncError::ChannelClosed),
        }
    }

    // ── Merge support ───────────────────────────────────────────

    /// Waits for every in-flight write to be persisted, then returns the
    /// patch together with the exclusive side of the merge lock. No write
    /// can start until the guard is dropped.
    pub async fn read_for_merge(&self) -> (OwnedRwLockWriteGuard<()>, Patch) {
        let guard = Arc::clone(&self.shared.merge_lock).write_owned().await;
        let patch = self.shared.patch.read().clone();
        (guard, patch)
    }

    // ── Runner ──────────────────────────────────────────────────

    /// Runs the writer until `cancel` fires.
    ///
    /// Uploads once immediately, then after each persisted batch. Batches
    /// already queued when `cancel` fires are still persisted; a pending
    /// upload is abandoned. Returns an error only if the local store failed,
    /// after which the writer is halted for good.
    pub async fn run(&self, cancel: CancellationToken) -> SyncResult<()> {
        let receiver = self.receiver.lock().take();
        let Some(mut rx) = receiver else {
            return Err(SyncError::AlreadyRunning);
        };
        let shared = &self.shared;
        info!("Transaction log writer started for {}", shared.my_id);

        let mut backoff = shared.upload_period;
        let mut cached: Option<(u64, Vec<u8>)> = None;
        let upload = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(upload);
        let mut armed = true;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    {
                        let _order = shared.submit_order.lock();
                        shared.stopped.store(true, Ordering::Release);
                        rx.close();
                    }
                    let mut remaining = Vec::new();
                    while let Ok(batch) = rx.try_recv() {
                        remaining.push(batch);
                    }
                    if !remaining.is_empty() {
                        self.persist(remaining).await?;
                    }
                    info!("Transaction log writer stopped");
                    return Ok(());
                }

                received = rx.recv() => {
                    let Some(first) = received else {
                        debug!("Write queue closed, stopping writer");
                        return Ok(());
                    };
                    let mut batches = vec![first];
                    if !shared.batch_window.is_zero() {
                        tokio::time::sleep(shared.batch_window).await;
                    }
                    while let Ok(batch) = rx.try_recv() {
                        batches.push(batch);
                    }
                    self.persist(batches).await?;

                    if !armed {
                        upload.as_mut().reset(Instant::now() + backoff);
                        armed = true;
                    }
                }

                () = &mut upload, if armed => {
                    armed = false;
                    match self.upload(&mut cached).await {
                        Ok(()) => {
                            backoff = shared.upload_period;
                            shared.connectivity.set_writer(true);
                        }
                        Err(e) => {
                            backoff = shared.config.next_backoff(backoff);
                            warn!(
                                "Failed to upload transaction log, retrying in {:?}: {}",
                                backoff, e
                            );
                            shared.connectivity.set_writer(false);
                            upload.as_mut().reset(Instant::now() + backoff);
                            armed = true;
                        }
                    }
                }
            }
        }
    }

    /// Folds `batches` into the patch and persists it, then acknowledges
    /// the callers. A failure halts the writer.
    async fn persist(&self, batches: Vec<Batch>) -> SyncResult<()> {
        let shared = Arc::clone(&self.shared);
        let count = batches.len();
        let (batches, result) = tokio::task::spawn_blocking(move || {
            let result = shared.persist_batches(&batches);
            (batches, result)
        })
        .await?;

        if let Err(e) = result {
            error!("Failed to persist transaction log, halting writer: {}", e);
            {
                let _order = self.shared.submit_order.lock();
                self.shared.halted.store(true, Ordering::Release);
            }
            // Dropping the batches fails every waiting caller
            drop(batches);
            return Err(e);
        }

        debug!("Persisted {} write batch(es)", count);
        for batch in batches {
            let _ = batch.ack.send(());
        }
        Ok(())
    }

    async fn upload(&self, cached: &mut Option<(u64, Vec<u8>)>) -> SyncResult<()> {
        let shared = &self.shared;
        let revision = shared.revision.load(Ordering::Acquire);
        let file = match cached {
            Some((cached_revision, bytes)) if *cached_revision == revision => bytes.clone(),
            _ => {
                let plaintext = shared.patch.read().serialize()?;
                let ciphertext = shared.encryptor.encrypt(&plaintext)?;
                let bytes = encode_file(&Header::new(shared.my_id), &ciphertext)?;
                *cached = Some((revision, bytes.clone()));
                bytes
            }
        };

        shared.remote.write(&shared.remote_path, &file).await?;
        debug!(
            "Uploaded transaction log revision {} ({} bytes)",
            revision,
            file.len()
        );
        Ok(())
    }
}

impl WriterShared {
    /// Applies one change to the store, records it in the mutate buffer and
    /// queues it for the runner. Blocking.
    fn apply_and_enqueue<T, F>(
        &self,
        keys: Vec<String>,
        mut apply: F,
        lease: OwnedRwLockReadGuard<()>,
    ) -> SyncResult<(T, oneshot::Receiver<()>)>
    where
        F: FnMut(&mut Transaction<'_>, i64) -> StorageResult<(BTreeMap<String, Mutate>, T)>,
    {
        let _order = self.submit_order.lock();
        if self.halted.load(Ordering::Acquire) {
            return Err(SyncError::WriterHalted);
        }
        if self.stopped.load(Ordering::Acquire) || self.queue.is_closed() {
            return Err(SyncError::WriterStopped);
        }

        let id = self.next_batch.fetch_add(1, Ordering::Relaxed);
        let timestamp = self.next_timestamp();
        let mut keys = keys;
        keys.push(self.buffer_key.clone());

        let mut outcome = None;
        self.store.transaction(&keys, &mut |tx| {
            let (mutates, result) = apply(tx, timestamp)?;
            let mut buffer = read_buffer(tx, &self.buffer_key)?;
            buffer.insert(id, mutates.clone());
            write_buffer(tx, &self.buffer_key, &buffer)?;
            outcome = Some((mutates, result));
            Ok(())
        })?;
        let (mutates, result) = outcome
            .ok_or_else(|| SyncError::Storage(StorageError::Aborted("write not applied".into())))?;

        let (ack, ack_rx) = oneshot::channel();
        self.queue
            .send(Batch {
                id,
                mutates,
                _lease: lease,
                ack,
            })
            .map_err(|_| SyncError::ChannelClosed)?;
        Ok((result, ack_rx))
    }

    /// Local timestamps strictly increase, even within one clock tick.
    fn next_timestamp(&self) -> i64 {
        let last = self.last_timestamp.load(Ordering::Acquire);
        let timestamp = now_nanos().max(last.saturating_add(1));
        self.last_timestamp.store(timestamp, Ordering::Release);
        timestamp
    }

    /// Blocking.
    fn persist_batches(&self, batches: &[Batch]) -> SyncResult<()> {
        let folded: BTreeSet<u64> = batches.iter().map(|b| b.id).collect();
        let serialized = {
            let mut patch = self.patch.write();
            for batch in batches {
                for (key, mutate) in &batch.mutates {
                    patch.add(key.clone(), mutate.clone());
                }
            }
            patch.serialize()?
        };

        let keys = [self.patch_key.clone(), self.buffer_key.clone()];
        self.store.transaction(&keys, &mut |tx| {
            tx.set(&self.patch_key, serialized.clone());
            let mut buffer = read_buffer(tx, &self.buffer_key)?;
            buffer.retain(|id, _| !folded.contains(id));
            write_buffer(tx, &self.buffer_key, &buffer)
        })?;

        self.revision.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Reads the persisted patch and folds in whatever the mutate buffer still
/// holds. Blocking.
fn load_patch(
    store: &dyn KeyValueStore,
    my_id: InstanceId,
    patch_key: &str,
    buffer_key: &str,
) -> SyncResult<Patch> {
    let mut loaded = Patch::new(my_id);
    let keys = [patch_key.to_string(), buffer_key.to_string()];
    store.transaction(&keys, &mut |tx| {
        let mut patch = match tx.get(patch_key)? {
            Some(bytes) => Patch::deserialize(my_id, &bytes).map_err(|e| {
                StorageError::InvalidData(format!("corrupt transaction log: {e}"))
            })?,
            None => Patch::new(my_id),
        };

        let buffer = read_buffer(tx, buffer_key)?;
        if !buffer.is_empty() {
            info!("Replaying {} unpersisted write batch(es)", buffer.len());
            for mutates in buffer.into_values() {
                for (key, mutate) in mutates {
                    patch.add(key, mutate);
                }
            }
            let serialized = patch
                .serialize()
                .map_err(|e| StorageError::InvalidData(e.to_string()))?;
            tx.set(patch_key, serialized);
            tx.delete(buffer_key);
        }

        loaded = patch;
        Ok(())
    })?;
    Ok(loaded)
}

fn read_buffer(tx: &mut Transaction<'_>, key: &str) -> StorageResult<MutateBuffer> {
    match tx.get(key)? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::InvalidData(format!("corrupt mutate buffer: {e}"))),
        None => Ok(MutateBuffer::new()),
    }
}

fn write_buffer(tx: &mut Transaction<'_>, key: &str, buffer: &MutateBuffer) -> StorageResult<()> {
    if buffer.is_empty() {
        tx.delete(key);
        return Ok(());
    }
    let bytes = serde_json::to_vec(buffer)
        .map_err(|e| StorageError::InvalidData(format!("cannot encode mutate buffer: {e}")))?;
    tx.set(key, bytes);
    Ok(())
}
