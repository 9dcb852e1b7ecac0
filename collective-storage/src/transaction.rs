//! Staged read-modify-write view used inside a store transaction.

use crate::error::StorageResult;
use std::collections::BTreeMap;

/// Reads a committed value from the underlying store.
pub(crate) type Reader<'a> = &'a dyn Fn(&str) -> StorageResult<Option<Vec<u8>>>;

/// A view of the store inside [`KeyValueStore::transaction`].
///
/// Reads see writes staged earlier in the same transaction. Staged writes
/// are committed together when the transaction body returns `Ok`, and
/// discarded otherwise.
///
/// [`KeyValueStore::transaction`]: crate::KeyValueStore::transaction
pub struct Transaction<'a> {
    reader: Reader<'a>,
    loaded: BTreeMap<String, Option<Vec<u8>>>,
    staged: BTreeMap<String, Option<Vec<u8>>>,
}

impl<'a> Transaction<'a> {
    /// Creates a transaction view, preloading `keys`.
    pub(crate) fn new(reader: Reader<'a>, keys: &[String]) -> StorageResult<Self> {
        let mut loaded = BTreeMap::new();
        for key in keys {
            loaded.insert(key.clone(), reader(key)?);
        }
        Ok(Self {
            reader,
            loaded,
            staged: BTreeMap::new(),
        })
    }

    /// Returns the current value of `key` as seen by this transaction.
    pub fn get(&mut self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        if let Some(staged) = self.staged.get(key) {
            return Ok(staged.clone());
        }
        if let Some(loaded) = self.loaded.get(key) {
            return Ok(loaded.clone());
        }
        let value = (self.reader)(key)?;
        self.loaded.insert(key.to_string(), value.clone());
        Ok(value)
    }

    /// Stages a write of `value` to `key`.
    pub fn set(&mut self, key: &str, value: Vec<u8>) {
        self.staged.insert(key.to_string(), Some(value));
    }

    /// Stages a deletion of `key`.
    pub fn delete(&mut self, key: &str) {
        self.staged.insert(key.to_string(), None);
    }

    /// Returns true if nothing has been staged.
    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    pub(crate) fn into_writes(self) -> BTreeMap<String, Option<Vec<u8>>> {
        self.staged
    }
}
