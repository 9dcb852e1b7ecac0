//! A device's patch: the latest mutate per key, and the merge across patches.
//!
//! Each device owns exactly one patch and is its only writer. Peers read it
//! wholesale and never modify it. Merging is a pure function over a set of
//! patches plus a per-peer high-water mark of timestamps already applied.

use crate::error::{CrdtError, CrdtResult};
use crate::mutate::Mutate;
use collective_types::InstanceId;
use std::collections::BTreeMap;

/// The per-device map of latest mutates, keyed by encoded store key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    owner: InstanceId,
    keys: BTreeMap<String, Mutate>,
}

/// The result of merging a set of peer patches into the local view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    /// Winning mutates the local store must apply, keyed by encoded key.
    pub updates: BTreeMap<String, Mutate>,
    /// New last-seen mark for every patch passed in.
    pub last_seen: BTreeMap<InstanceId, i64>,
}

impl Patch {
    /// Creates an empty patch owned by `owner`.
    #[must_use]
    pub fn new(owner: InstanceId) -> Self {
        Self {
            owner,
            keys: BTreeMap::new(),
        }
    }

    /// Returns the device that owns this patch.
    #[must_use]
    pub fn owner(&self) -> InstanceId {
        self.owner
    }

    /// Records `mutate` for `key`, replacing any earlier mutate for the key.
    pub fn add(&mut self, key: impl Into<String>, mutate: Mutate) {
        self.keys.insert(key.into(), mutate);
    }

    /// Returns the mutate recorded for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Mutate> {
        self.keys.get(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Iterates over `(key, mutate)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Mutate)> {
        self.keys.iter()
    }

    /// Returns the largest timestamp in the patch, or `None` if empty.
    #[must_use]
    pub fn latest_timestamp(&self) -> Option<i64> {
        self.keys.values().map(|m| m.timestamp).max()
    }

    /// Serializes the patch body. Keys are emitted in sorted order, so equal
    /// patches always produce identical bytes. The owner is not included.
    pub fn serialize(&self) -> CrdtResult<Vec<u8>> {
        serde_json::to_vec(&self.keys).map_err(CrdtError::Serialize)
    }

    /// Deserializes a patch body produced by [`Patch::serialize`].
    pub fn deserialize(owner: InstanceId, data: &[u8]) -> CrdtResult<Self> {
        let keys = serde_json::from_slice(data).map_err(CrdtError::Deserialize)?;
        Ok(Self { owner, keys })
    }

    /// Computes the updates this device must apply given its peers' patches.
    ///
    /// `peers` holds each peer patch together with the last timestamp already
    /// applied from it. Order does not matter: peers are visited in
    /// descending [`InstanceId`] order. A peer with the same owner as `self`
    /// is ignored and `self` is used in its place.
    ///
    /// A key is dirty when some peer other than `self` has a mutate for it
    /// newer than that peer's last-seen mark. For each dirty key the mutate
    /// with the greatest timestamp across all patches (including `self`)
    /// wins; a later patch only replaces the current winner with a strictly
    /// greater timestamp, so on a tie the larger `InstanceId` wins. Keys won
    /// by `self` are left out since they are already applied locally.
    #[must_use]
    pub fn diff(&self, peers: &[(&Patch, i64)]) -> DiffResult {
        let mut ordered: Vec<(&Patch, i64)> = peers
            .iter()
            .filter(|(p, _)| p.owner != self.owner)
            .copied()
            .collect();
        ordered.sort_by(|a, b| b.0.owner.cmp(&a.0.owner));

        let mut last_seen = BTreeMap::new();
        for (patch, seen) in peers {
            last_seen.insert(patch.owner, *seen);
        }

        let mut dirty: Vec<&str> = Vec::new();
        for (patch, seen) in &ordered {
            let mut high = *seen;
            for (key, mutate) in &patch.keys {
                if mutate.timestamp > *seen {
                    dirty.push(key.as_str());
                    high = high.max(mutate.timestamp);
                }
            }
            last_seen.insert(patch.owner, high);
        }
        dirty.sort_unstable();
        dirty.dedup();

        // Every patch in supremacy order, with self slotted by its own ID.
        let mut all: Vec<&Patch> = ordered.iter().map(|(p, _)| *p).collect();
        let slot = all.partition_point(|p| p.owner > self.owner);
        all.insert(slot, self);

        let mut updates = BTreeMap::new();
        for key in dirty {
            let mut winner: Option<(&Patch, &Mutate)> = None;
            for patch in &all {
                let Some(mutate) = patch.keys.get(key) else {
                    continue;
                };
                match winner {
                    Some((_, best)) if mutate.timestamp <= best.timestamp => {}
                    _ => winner = Some((patch, mutate)),
                }
            }
            match winner {
                Some((patch, mutate)) if patch.owner != self.owner => {
                    updates.insert(key.to_string(), mutate.clone());
                }
                _ => {}
            }
        }

        DiffResult { updates, last_seen }
    }
}
