//! Multi-device key-value synchronization for the collective.
//!
//! Several devices sharing one collective secret keep their local stores
//! consistent through an untrusted remote blob store. There is no
//! coordinator and no ordering channel: every device uploads its whole
//! change log, and every device merges everyone else's.
//!
//! # Architecture
//!
//! ## Components
//!
//! - **Writer**: the single-writer queue that persists local changes into
//!   this device's patch and uploads it, encrypted, with retry and backoff
//! - **Collector**: the periodic process that downloads peer logs, merges
//!   them last-writer-wins and applies the winners locally
//! - **KV adapter**: the local store plus key and map change listeners
//! - **SyncKv**: the versioned, prefix-scoped store applications use
//!
//! ## Sync Process
//!
//! 1. **Write**: a synchronized write is applied locally, queued, and
//!    persisted into the patch before the caller returns
//! 2. **Upload**: the patch is encrypted and replaces this device's log
//! 3. **Discover**: the collector lists every device log on the remote
//! 4. **Merge**: changed logs are decrypted and diffed against what was
//!    already applied; ties go to the larger device ID
//! 5. **Apply**: winning changes land in the local store and listeners fire
//!
//! # Example
//!
//! ```no_run
//! use collective_storage::MemoryStore;
//! use collective_sync::{FileSystemRemote, Object, SyncConfig, SyncKv};
//! use std::sync::Arc;
//!
//! # async fn example() -> collective_sync::SyncResult<()> {
//! let config = SyncConfig {
//!     synchronized_prefixes: vec!["profile".to_string()],
//!     ..Default::default()
//! };
//! let remote = Arc::new(FileSystemRemote::new("/mnt/shared"));
//! let kv = SyncKv::open(config, b"collective secret", remote, Arc::new(MemoryStore::new())).await?;
//! let processes = kv.start_processes()?;
//!
//! kv.prefix("profile")?.set("name", &Object::new(0, "Alice")).await?;
//!
//! processes.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod collector;
mod config;
mod error;
pub mod file;
mod kv;
mod map;
mod notifier;
pub mod remote;
mod synckv;
mod writer;

pub use collector::Collector;
pub use config::{EpochPolicy, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use file::{FILE_MAGIC, HEADER_VERSION, Header, decode_file, encode_file, log_path};
pub use kv::{ElementEdit, InternalKv, KeyCallback, KeyOperation, MapCallback};
pub use notifier::{Connectivity, Notifier};
pub use remote::{FileSystemRemote, MemoryRemote, NoopRemote, RemoteStore};
pub use synckv::{Object, ObjectEdit, ProcessHandle, SyncKv};
pub use writer::RemoteWriter;
