//! Last-writer-wins patches for the collective sync engine.
//!
//! - [`Mutate`]: one timestamped set-or-delete on one key
//! - [`Patch`]: a device's latest mutate per key, with a deterministic
//!   serialized form
//! - [`Patch::diff`]: merges peer patches into the set of updates the local
//!   store must apply
//!
//! The merge is deterministic: the same patches and last-seen marks always
//! produce the same updates, regardless of the order the peers are given in.

mod error;
mod mutate;
mod patch;

pub use error::{CrdtError, CrdtResult};
pub use mutate::Mutate;
pub use patch::{DiffResult, Patch};
