//! Remote blob stores that device logs are exchanged through.
//!
//! The engine only needs whole-file read/write/list/stat; there is no
//! locking, appending or transactions. Every upload overwrites the device's
//! own log file and every peer log is read wholesale.

pub mod filesystem;
pub mod memory;
pub mod noop;
pub mod store;

pub use filesystem::FileSystemRemote;
pub use memory::MemoryRemote;
pub use noop::NoopRemote;
pub use store::RemoteStore;
