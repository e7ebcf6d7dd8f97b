//! SessionVault KV - key-value persistence backends
//!
//! The engine only needs byte-oriented get/set/delete plus an atomic
//! multi-key transaction. This crate defines that seam and ships two
//! implementations: a durable redb database and an in-memory map used by
//! tests (with fault injection and operation counters).

pub mod backend;
pub mod error;
pub mod memory;
pub mod redb_backend;
mod tables;

// Re-exports
pub use backend::{KvBackend, KvOp, KvTransaction};
pub use error::{KvError, KvResult};
pub use memory::{MemoryBackend, MemoryStats};
pub use redb_backend::RedbBackend;
