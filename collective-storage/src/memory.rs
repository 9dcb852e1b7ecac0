//! In-memory store, used by tests and ephemeral collectives.

use crate::error::StorageResult;
use crate::transaction::Transaction;
use crate::KeyValueStore;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// A [`KeyValueStore`] held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.data.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        self.data.write().remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let data = self.data.read();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn transaction(
        &self,
        keys: &[String],
        op: &mut dyn FnMut(&mut Transaction<'_>) -> StorageResult<()>,
    ) -> StorageResult<()> {
        let mut data = self.data.write();

        let writes = {
            let snapshot = &*data;
            let reader = |key: &str| -> StorageResult<Option<Vec<u8>>> {
                Ok(snapshot.get(key).cloned())
            };
            let mut tx = Transaction::new(&reader, keys)?;
            op(&mut tx)?;
            tx.into_writes()
        };

        for (key, value) in writes {
            match value {
                Some(v) => data.insert(key, v),
                None => data.remove(&key),
            };
        }
        Ok(())
    }
}
