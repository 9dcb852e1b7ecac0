//! Core type definitions for the collective sync engine.
//!
//! This crate defines the small set of types shared by every other crate:
//! - Device identifiers ([`InstanceId`])
//! - Unix-nanosecond timestamps for mutates
//! - Tagged keys for the local store namespace ([`StoreKey`])

mod ids;
mod key;
pub mod timestamp;

pub use ids::{INSTANCE_ID_LEN, InstanceId};
pub use key::{FIELD_SEPARATOR, KEY_DESIGNATOR, StoreKey, map_element_prefix, validate_name};
pub use timestamp::now_nanos;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid instance id: {0}")]
    InvalidInstanceId(String),

    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Errors raised when a key or name cannot be used in the store namespace.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("key must not be empty")]
    Empty,

    #[error("key \"{name}\" contains reserved character {character:?}")]
    ReservedCharacter { name: String, character: char },

    #[error("malformed encoded key: {0:?}")]
    Malformed(String),
}
