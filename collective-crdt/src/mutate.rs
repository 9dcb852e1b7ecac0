//! A single timestamped set-or-delete operation on one key.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One change to one key, as recorded in a device's patch.
///
/// The JSON form uses the field names `Timestamp`, `Value` and `Deletion`,
/// with the value encoded as standard base64 (or `null`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mutate {
    /// Unix nanoseconds at which the change was made.
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
    /// New value; `None` for deletions and map index markers.
    #[serde(rename = "Value", with = "base64_bytes", default)]
    pub value: Option<Vec<u8>>,
    /// True if the key was deleted.
    #[serde(rename = "Deletion")]
    pub deletion: bool,
}

impl Mutate {
    /// A write of `value` at `timestamp`.
    #[must_use]
    pub fn set(timestamp: i64, value: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp,
            value: Some(value.into()),
            deletion: false,
        }
    }

    /// A deletion at `timestamp`.
    #[must_use]
    pub fn delete(timestamp: i64) -> Self {
        Self {
            timestamp,
            value: None,
            deletion: true,
        }
    }

    /// A write carrying no payload. Used for map index markers, whose value
    /// is reconstructed from the map's elements on the receiving side.
    #[must_use]
    pub fn marker(timestamp: i64) -> Self {
        Self {
            timestamp,
            value: None,
            deletion: false,
        }
    }

    /// Returns the value bytes, if any.
    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&BASE64.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|s| BASE64.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
