//! Local key-value storage for the collective sync engine.
//!
//! The sync engine needs an ordered, string-keyed byte map with atomic
//! multi-key read-modify-write transactions. [`KeyValueStore`] captures that
//! contract; two implementations are provided:
//!
//! - [`MemoryStore`]: a `BTreeMap` behind a read/write lock
//! - [`SqliteStore`]: a single SQLite table, one SQL transaction per
//!   store transaction

mod error;
mod memory;
mod sqlite;
mod transaction;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use transaction::Transaction;

/// An ordered, string-keyed byte store with atomic transactions.
pub trait KeyValueStore: Send + Sync {
    /// Returns the value stored at `key`.
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Stores `value` at `key`.
    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Removes `key`. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> StorageResult<()>;

    /// Returns every key starting with `prefix`, in ascending order.
    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Runs `op` against a [`Transaction`] view of the store.
    ///
    /// `keys` are loaded up front; other keys may still be read through the
    /// view. Writes staged by `op` are committed atomically if it returns
    /// `Ok` and discarded if it returns `Err`, in which case the error is
    /// passed through.
    fn transaction(
        &self,
        keys: &[String],
        op: &mut dyn FnMut(&mut Transaction<'_>) -> StorageResult<()>,
    ) -> StorageResult<()>;
}
