use async_trait::async_trait;
use collective_crdt::Patch;
use collective_crypto::{CollectiveEncryptor, Encryptor};
use collective_storage::{KeyValueStore, MemoryStore, StorageError, StorageResult, Transaction};
use collective_sync::{
    Connectivity, MemoryRemote, RemoteStore, RemoteWriter, SyncConfig, SyncError, SyncResult,
    decode_file,
};
use collective_types::{InstanceId, StoreKey};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const SECRET: &[u8] = b"writer test secret";

fn device() -> InstanceId {
    InstanceId::from_bytes([0x42; 8])
}

fn config() -> SyncConfig {
    SyncConfig {
        upload_period_ms: 20,
        batch_window_ms: 1,
        max_backoff_ms: 60,
        ..Default::default()
    }
}

fn encryptor() -> Arc<dyn Encryptor> {
    Arc::new(CollectiveEncryptor::new(SECRET).unwrap())
}

fn new_writer(
    config: &SyncConfig,
    store: Arc<dyn KeyValueStore>,
    remote: Arc<dyn RemoteStore>,
) -> (Arc<RemoteWriter>, Arc<Connectivity>) {
    let connectivity = Arc::new(Connectivity::new());
    let writer = RemoteWriter::new(
        device(),
        config,
        store,
        remote,
        encryptor(),
        Arc::clone(&connectivity),
    )
    .unwrap();
    (Arc::new(writer), connectivity)
}

fn start(writer: &Arc<RemoteWriter>) -> (CancellationToken, JoinHandle<SyncResult<()>>) {
    let cancel = CancellationToken::new();
    let runner = {
        let writer = Arc::clone(writer);
        let cancel = cancel.clone();
        tokio::spawn(async move { writer.run(cancel).await })
    };
    (cancel, runner)
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn patch_key() -> String {
    StoreKey::internal("txlog/collective").unwrap().encode()
}

fn buffer_key() -> String {
    StoreKey::internal("mutate_buffer").unwrap().encode()
}

fn uploaded_patch(remote: &MemoryRemote, path: &str) -> Option<Patch> {
    let file = remote.get(path)?;
    let (header, ciphertext) = decode_file(&file).unwrap();
    assert_eq!(header.device, device());
    let plaintext = encryptor().decrypt(&ciphertext).unwrap();
    Some(Patch::deserialize(header.device, &plaintext).unwrap())
}

/// Records every upload attempt and fails them while `failing` is set.
#[derive(Default)]
struct RecordingRemote {
    inner: MemoryRemote,
    attempts: Mutex<Vec<Vec<u8>>>,
    attempted_at: Mutex<Vec<Instant>>,
    failing: AtomicBool,
}

impl RecordingRemote {
    fn attempts(&self) -> Vec<Vec<u8>> {
        self.attempts.lock().unwrap().clone()
    }

    fn attempted_at(&self) -> Vec<Instant> {
        self.attempted_at.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteStore for RecordingRemote {
    async fn read(&self, path: &str) -> SyncResult<Vec<u8>> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, data: &[u8]) -> SyncResult<()> {
        self.attempts.lock().unwrap().push(data.to_vec());
        self.attempted_at.lock().unwrap().push(Instant::now());
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::Remote("remote down".to_string()));
        }
        self.inner.write(path, data).await
    }

    async fn read_dir(&self, path: &str) -> SyncResult<Vec<String>> {
        self.inner.read_dir(path).await
    }

    async fn get_last_modified(&self, path: &str) -> SyncResult<SystemTime> {
        self.inner.get_last_modified(path).await
    }

    async fn get_last_write(&self) -> SyncResult<SystemTime> {
        self.inner.get_last_write().await
    }
}

/// Fails every transaction touching the persisted patch once armed.
#[derive(Default)]
struct FailingStore {
    inner: MemoryStore,
    fail_patch: AtomicBool,
}

impl KeyValueStore for FailingStore {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.inner.set(key, value)
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key)
    }

    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.keys_with_prefix(prefix)
    }

    fn transaction(
        &self,
        keys: &[String],
        op: &mut dyn FnMut(&mut Transaction<'_>) -> StorageResult<()>,
    ) -> StorageResult<()> {
        if self.fail_patch.load(Ordering::SeqCst) && keys.iter().any(|k| k.contains("txlog/")) {
            return Err(StorageError::Aborted("disk full".to_string()));
        }
        self.inner.transaction(keys, op)
    }
}

// ── Local persistence ───────────────────────────────────────────

#[tokio::test]
async fn write_is_persisted_before_returning() {
    let store = Arc::new(MemoryStore::new());
    let (writer, _) = new_writer(&config(), store.clone(), Arc::new(MemoryRemote::new()));
    let (cancel, runner) = start(&writer);

    writer.write("profile/name", b"Alice").await.unwrap();

    assert_eq!(store.get("profile/name").unwrap(), Some(b"Alice".to_vec()));
    let persisted = Patch::deserialize(device(), &store.get(&patch_key()).unwrap().unwrap()).unwrap();
    assert_eq!(persisted.get("profile/name").unwrap().value(), Some(&b"Alice"[..]));
    assert_eq!(store.get(&buffer_key()).unwrap(), None);

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn write_and_delete_return_previous_value() {
    let store = Arc::new(MemoryStore::new());
    let (writer, _) = new_writer(&config(), store.clone(), Arc::new(MemoryRemote::new()));
    let (cancel, runner) = start(&writer);

    assert_eq!(writer.write("k", b"1").await.unwrap(), None);
    let first = writer.patch().get("k").unwrap().timestamp;
    assert_eq!(writer.write("k", b"2").await.unwrap(), Some(b"1".to_vec()));
    let second = writer.patch().get("k").unwrap().timestamp;
    assert!(second > first);

    assert_eq!(writer.delete("k").await.unwrap(), Some(b"2".to_vec()));
    assert_eq!(store.get("k").unwrap(), None);
    assert!(writer.patch().get("k").unwrap().deletion);

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn concurrent_writes_are_all_persisted() {
    let store = Arc::new(MemoryStore::new());
    let (writer, _) = new_writer(&config(), store.clone(), Arc::new(MemoryRemote::new()));
    let (cancel, runner) = start(&writer);

    let tasks: Vec<_> = (0..50)
        .map(|i| {
            let writer = Arc::clone(&writer);
            tokio::spawn(async move { writer.write(&format!("key-{i}"), b"v").await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(writer.patch().len(), 50);
    let persisted = Patch::deserialize(device(), &store.get(&patch_key()).unwrap().unwrap()).unwrap();
    assert_eq!(persisted.len(), 50);
    assert_eq!(store.get(&buffer_key()).unwrap(), None);

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn write_map_records_elements_and_index_marker() {
    let store = Arc::new(MemoryStore::new());
    let (writer, _) = new_writer(&config(), store.clone(), Arc::new(MemoryRemote::new()));
    let (cancel, runner) = start(&writer);

    let edits = BTreeMap::from([
        ("a".to_string(), Some(b"1".to_vec())),
        ("b".to_string(), Some(b"2".to_vec())),
    ]);
    writer.write_map("contacts", edits, false).await.unwrap();
    let replaced = BTreeMap::from([("b".to_string(), Some(b"3".to_vec()))]);
    let applied = writer.write_map("contacts", replaced, true).await.unwrap();
    assert_eq!(applied.len(), 2);

    let patch = writer.patch();
    let element_a = StoreKey::map_element("contacts", "a").unwrap().encode();
    let element_b = StoreKey::map_element("contacts", "b").unwrap().encode();
    let index = StoreKey::map_index("contacts").unwrap().encode();

    assert!(patch.get(&element_a).unwrap().deletion);
    assert_eq!(patch.get(&element_b).unwrap().value(), Some(&b"3"[..]));
    let marker = patch.get(&index).unwrap();
    assert!(!marker.deletion);
    assert_eq!(marker.value, None);
    assert_eq!(marker.timestamp, patch.get(&element_b).unwrap().timestamp);

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

// ── Upload ──────────────────────────────────────────────────────

#[tokio::test]
async fn patch_is_uploaded_encrypted() {
    let remote = Arc::new(MemoryRemote::new());
    let (writer, connectivity) = new_writer(&config(), Arc::new(MemoryStore::new()), remote.clone());
    let (cancel, runner) = start(&writer);

    writer.write("k", b"v").await.unwrap();
    let path = writer.remote_path().to_string();
    eventually(|| {
        uploaded_patch(&remote, &path).is_some_and(|patch| patch.get("k").is_some())
    })
    .await;
    assert!(path.starts_with("collective/"));
    assert!(path.ends_with(&device().to_string()));
    assert!(connectivity.writer_up_to_date());
    assert!(writer.remote_up_to_date());

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn retried_upload_is_byte_identical() {
    let remote = Arc::new(RecordingRemote::default());
    remote.failing.store(true, Ordering::SeqCst);
    let (writer, connectivity) = new_writer(&config(), Arc::new(MemoryStore::new()), remote.clone());
    let (cancel, runner) = start(&writer);

    writer.write("k", b"v").await.unwrap();
    let after_write = remote.attempts().len();
    eventually(|| remote.attempts().len() >= after_write + 3).await;

    let attempts = remote.attempts();
    let last = &attempts[attempts.len() - 1];
    let previous = &attempts[attempts.len() - 2];
    assert_eq!(last, previous);
    assert!(!connectivity.writer_up_to_date());

    remote.failing.store(false, Ordering::SeqCst);
    eventually(|| connectivity.writer_up_to_date()).await;

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn successful_upload_resets_backoff() {
    let config = SyncConfig {
        upload_period_ms: 10,
        max_backoff_ms: 400,
        ..config()
    };
    let remote = Arc::new(RecordingRemote::default());
    remote.failing.store(true, Ordering::SeqCst);
    let (writer, connectivity) = new_writer(&config, Arc::new(MemoryStore::new()), remote.clone());
    let (cancel, runner) = start(&writer);

    // Retries space out until they hit the ceiling
    eventually(|| {
        let times = remote.attempted_at();
        times.len() >= 2 && times[times.len() - 1] - times[times.len() - 2] >= Duration::from_millis(150)
    })
    .await;
    let times = remote.attempted_at();
    assert!(times.windows(2).all(|w| w[1] - w[0] >= Duration::from_millis(10)));

    remote.failing.store(false, Ordering::SeqCst);
    eventually(|| connectivity.writer_up_to_date()).await;

    let before = remote.attempts().len();
    writer.write("k", b"v").await.unwrap();
    let written = Instant::now();
    eventually(|| remote.attempts().len() > before).await;
    assert!(written.elapsed() < Duration::from_millis(200));

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn restart_reloads_patch_and_uploads_it() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let remote = Arc::new(MemoryRemote::new());
    let slow = SyncConfig {
        upload_period_ms: 60_000,
        ..config()
    };

    let (writer, _) = new_writer(&slow, Arc::clone(&store), remote.clone());
    let (cancel, runner) = start(&writer);
    writer.write("k", b"v").await.unwrap();
    cancel.cancel();
    runner.await.unwrap().unwrap();
    drop(writer);

    let (restarted, _) = new_writer(&slow, store, remote.clone());
    assert_eq!(restarted.patch().get("k").unwrap().value(), Some(&b"v"[..]));

    let (cancel, runner) = start(&restarted);
    let path = restarted.remote_path().to_string();
    eventually(|| {
        uploaded_patch(&remote, &path).is_some_and(|patch| patch.get("k").is_some())
    })
    .await;
    cancel.cancel();
    runner.await.unwrap().unwrap();
}

// ── Crash safety ────────────────────────────────────────────────

#[tokio::test]
async fn unfolded_batches_are_replayed_on_restart() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let remote = Arc::new(MemoryRemote::new());

    // No runner: the change reaches the store and the buffer, never the patch
    let (writer, _) = new_writer(&config(), Arc::clone(&store), remote.clone());
    let stuck = timeout(Duration::from_millis(200), writer.write("k", b"v")).await;
    assert!(stuck.is_err());
    assert_eq!(store.get("k").unwrap(), Some(b"v".to_vec()));
    assert!(store.get(&buffer_key()).unwrap().is_some());
    assert!(writer.patch().get("k").is_none());
    drop(writer);

    let (restarted, _) = new_writer(&config(), Arc::clone(&store), remote);
    assert_eq!(restarted.patch().get("k").unwrap().value(), Some(&b"v"[..]));
    assert_eq!(store.get(&buffer_key()).unwrap(), None);
    let persisted = Patch::deserialize(device(), &store.get(&patch_key()).unwrap().unwrap()).unwrap();
    assert!(persisted.get("k").is_some());
}

#[tokio::test]
async fn merge_waits_for_in_flight_writes() {
    let (writer, _) = new_writer(&config(), Arc::new(MemoryStore::new()), Arc::new(MemoryRemote::new()));

    let stuck = timeout(Duration::from_millis(100), writer.write("k", b"v")).await;
    assert!(stuck.is_err());
    assert!(timeout(Duration::from_millis(100), writer.read_for_merge()).await.is_err());

    let (cancel, runner) = start(&writer);
    let (_guard, patch) = timeout(Duration::from_secs(5), writer.read_for_merge())
        .await
        .unwrap();
    assert!(patch.get("k").is_some());
    drop(_guard);

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn persist_failure_halts_writer() {
    let store = Arc::new(FailingStore::default());
    let (writer, _) = new_writer(&config(), store.clone(), Arc::new(MemoryRemote::new()));
    let (_cancel, runner) = start(&writer);

    writer.write("before", b"1").await.unwrap();
    store.fail_patch.store(true, Ordering::SeqCst);

    let err = writer.write("after", b"2").await.unwrap_err();
    assert!(matches!(err, SyncError::WriterHalted));
    assert!(writer.is_halted());
    assert!(matches!(
        writer.write("later", b"3").await,
        Err(SyncError::WriterHalted)
    ));
    assert!(runner.await.unwrap().is_err());
}

#[tokio::test]
async fn cancel_persists_queued_writes() {
    let store = Arc::new(MemoryStore::new());
    let (writer, _) = new_writer(&config(), store.clone(), Arc::new(MemoryRemote::new()));

    // Queued with no runner yet
    let tasks: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|key| {
            let writer = Arc::clone(&writer);
            tokio::spawn(async move { writer.write(key, b"v").await })
        })
        .collect();
    eventually(|| ["a", "b", "c"].iter().all(|k| store.get(k).unwrap().is_some())).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    writer.run(cancel).await.unwrap();

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), None);
    }
    let persisted = Patch::deserialize(device(), &store.get(&patch_key()).unwrap().unwrap()).unwrap();
    for key in ["a", "b", "c"] {
        assert_eq!(persisted.get(key).unwrap().value(), Some(&b"v"[..]));
    }
    assert_eq!(store.get(&buffer_key()).unwrap(), None);
}

#[tokio::test]
async fn writes_after_stop_leave_the_store_untouched() {
    let store = Arc::new(MemoryStore::new());
    let (writer, _) = new_writer(&config(), store.clone(), Arc::new(MemoryRemote::new()));
    let (cancel, runner) = start(&writer);

    writer.write("before", b"1").await.unwrap();
    cancel.cancel();
    runner.await.unwrap().unwrap();
    assert!(writer.is_stopped());

    let err = writer.write("after", b"2").await.unwrap_err();
    assert!(matches!(err, SyncError::WriterStopped));
    assert!(matches!(
        writer.delete("before").await,
        Err(SyncError::WriterStopped)
    ));
    assert_eq!(store.get("after").unwrap(), None);
    assert_eq!(store.get("before").unwrap(), Some(b"1".to_vec()));
    assert_eq!(store.get(&buffer_key()).unwrap(), None);
    assert!(writer.patch().get("after").is_none());
}

#[tokio::test]
async fn runner_starts_only_once() {
    let (writer, _) = new_writer(&config(), Arc::new(MemoryStore::new()), Arc::new(MemoryRemote::new()));
    let (cancel, runner) = start(&writer);

    let second = writer.run(CancellationToken::new()).await;
    assert!(matches!(second, Err(SyncError::AlreadyRunning)));

    cancel.cancel();
    runner.await.unwrap().unwrap();
}
