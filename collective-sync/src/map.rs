//! Maps layered over the flat store.
//!
//! A map is an index key holding the JSON array of its element names plus
//! one key per element. Every helper here runs inside a store
//! [`Transaction`], so the index and its elements always move together.

use crate::kv::{ElementEdit, KeyOperation};
use collective_storage::{StorageError, StorageResult, Transaction};
use collective_types::StoreKey;
use std::collections::{BTreeMap, BTreeSet};

/// Encoded index key of `map`. Names must already be validated.
pub(crate) fn index_key(map: &str) -> String {
    StoreKey::MapIndex {
        map: map.to_string(),
    }
    .encode()
}

/// Encoded key of `element` in `map`. Names must already be validated.
pub(crate) fn element_key(map: &str, element: &str) -> String {
    StoreKey::MapElement {
        map: map.to_string(),
        element: element.to_string(),
    }
    .encode()
}

/// Reads the element names of `map`. A missing index is an empty map.
pub(crate) fn read_index(tx: &mut Transaction<'_>, map: &str) -> StorageResult<BTreeSet<String>> {
    match tx.get(&index_key(map))? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::InvalidData(format!("corrupt index of map {map}: {e}"))),
        None => Ok(BTreeSet::new()),
    }
}

/// Reads every element of `map`.
///
/// An index entry without its element key means the map was torn, which
/// the transactional writes below never produce; it is reported as invalid
/// data rather than skipped.
pub(crate) fn read_map(
    tx: &mut Transaction<'_>,
    map: &str,
) -> StorageResult<BTreeMap<String, Vec<u8>>> {
    let mut elements = BTreeMap::new();
    for element in read_index(tx, map)? {
        let value = tx.get(&element_key(map, &element))?.ok_or_else(|| {
            StorageError::InvalidData(format!("map {map} lists missing element {element}"))
        })?;
        elements.insert(element, value);
    }
    Ok(elements)
}

/// Applies `edits` to `map` (`None` deletes the element) and rewrites the
/// index to match.
///
/// With `replace`, every existing element missing from `edits` is deleted
/// too. Returns the edit made to each element that actually changed state;
/// deleting an element that does not exist is not reported. The index key
/// is removed once the last element is gone.
pub(crate) fn apply_map_edits(
    tx: &mut Transaction<'_>,
    map: &str,
    edits: &BTreeMap<String, Option<Vec<u8>>>,
    replace: bool,
) -> StorageResult<BTreeMap<String, ElementEdit>> {
    let mut index = read_index(tx, map)?;
    let existing = index.clone();

    let mut plan: BTreeMap<&str, Option<&[u8]>> = edits
        .iter()
        .map(|(element, value)| (element.as_str(), value.as_deref()))
        .collect();
    if replace {
        for element in &existing {
            plan.entry(element.as_str()).or_insert(None);
        }
    }

    let mut applied = BTreeMap::new();
    for (element, new) in plan {
        let key = element_key(map, element);
        let old = tx.get(&key)?;
        let operation = match (&old, new) {
            (None, None) => continue,
            (None, Some(_)) => KeyOperation::Created,
            (Some(_), Some(_)) => KeyOperation::Updated,
            (Some(_), None) => KeyOperation::Deleted,
        };

        match new {
            Some(value) => {
                tx.set(&key, value.to_vec());
                index.insert(element.to_string());
            }
            None => {
                tx.delete(&key);
                index.remove(element);
            }
        }

        applied.insert(
            element.to_string(),
            ElementEdit {
                old,
                new: new.map(<[u8]>::to_vec),
                operation,
            },
        );
    }

    let index_key = index_key(map);
    if index.is_empty() {
        tx.delete(&index_key);
    } else if index != existing {
        let encoded = serde_json::to_vec(&index)
            .map_err(|e| StorageError::InvalidData(format!("cannot encode index of {map}: {e}")))?;
        tx.set(&index_key, encoded);
    }

    Ok(applied)
}
