//! SessionVault Engine - Session storage
//!
//! This crate implements the session storage engine including:
//! - Chunked session records (metadata document + append-only chunks)
//! - Content-addressable attachment store with reference counting and GC
//! - Inverted index over seven posting lists with AND/OR search
//! - Priority persistence queue with batching, retry and backoff
//! - Byte-budgeted LRU cache with TTL and pattern invalidation

pub mod access;
pub mod cache;
pub mod cas;
pub mod clock;
pub mod index;
pub mod keys;
pub mod maintenance;
pub mod queue;
pub mod space;
pub mod storage;

// Re-exports
pub use access::ReadThrough;
pub use cache::{CacheSnapshot, CacheStats, KeyPattern, LruCache};
pub use cas::{CasRecord, CasStats, ContentStore, GcReport, GcTask, PutOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use index::{
    Combinator, DateRange, IndexEvent, IndexKind, IndexManager, IndexMetadata, IndexStats,
    IntegrityReport, OptimizeReport, OptimizeTask, RebuildReason, SearchQuery,
};
pub use maintenance::CancelFlag;
pub use queue::{
    EnqueueOptions, ItemInfo, ItemType, MaintenanceTask, OverlayValue, PersistenceQueue,
    Priority, QueueEvent, QueueOp, QueueStats,
};
pub use space::{FixedSpace, SpaceSource, ensure_free};
#[cfg(unix)]
pub use space::StatvfsSpace;
pub use storage::{ChunkedSessionStorage, StorageStats};
