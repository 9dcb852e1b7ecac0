//! Device identifiers used throughout the collective core.
//!
//! An [`InstanceId`] is 8 random bytes generated once per local store. The
//! byte-lexicographic order over IDs is the "supremacy" order used to break
//! timestamp ties during merge: the larger ID wins.

use crate::Error;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Length of an instance ID in bytes.
pub const INSTANCE_ID_LEN: usize = 8;

/// Unique identifier for one device (local store) in a collective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId([u8; INSTANCE_ID_LEN]);

impl InstanceId {
    /// Generates a new random instance ID.
    #[must_use]
    pub fn new() -> Self {
        let mut bytes = [0u8; INSTANCE_ID_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Creates an instance ID from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; INSTANCE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Creates an instance ID from a byte slice, checking its length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        let array: [u8; INSTANCE_ID_LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidInstanceId(format!(
                "expected {INSTANCE_ID_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    /// Returns the underlying bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; INSTANCE_ID_LEN] {
        &self.0
    }

    /// Parses an instance ID from its hex form.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let bytes =
            hex::decode(s).map_err(|e| Error::InvalidInstanceId(format!("{s:?}: {e}")))?;
        Self::from_slice(&bytes)
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for InstanceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for InstanceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InstanceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
