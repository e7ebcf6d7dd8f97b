//! Queue lifecycle events and counters

use super::item::{ItemInfo, Priority};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lifecycle notifications for observers
///
/// Delivered on a broadcast channel; slow subscribers may miss events
/// (`RecvError::Lagged`) but the queue never blocks on them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Enqueued(ItemInfo),
    Processing(ItemInfo),
    Completed(ItemInfo),
    Retry {
        item: ItemInfo,
        attempt: u32,
        delay: Duration,
    },
    Failed {
        item: ItemInfo,
        permanent: bool,
        error: String,
    },
    Dropped {
        item: ItemInfo,
        reason: String,
    },
}

impl QueueEvent {
    #[must_use]
    pub const fn item(&self) -> &ItemInfo {
        match self {
            Self::Enqueued(item) | Self::Processing(item) | Self::Completed(item) => item,
            Self::Retry { item, .. } | Self::Failed { item, .. } | Self::Dropped { item, .. } => {
                item
            }
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct QueueCounters {
    pub enqueued: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
    pub dropped: AtomicU64,
    pub transactions: AtomicU64,
    pub processing: AtomicU64,
}

impl QueueCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending_critical: usize,
    pub pending_normal: usize,
    pub pending_low: usize,
    /// Items currently being committed
    pub processing: u64,
    pub enqueued: u64,
    pub completed: u64,
    /// Permanently failed items
    pub failed: u64,
    /// Retry attempts scheduled
    pub retried: u64,
    pub dropped: u64,
    /// Backend commits issued (batches count once)
    pub transactions: u64,
}

impl QueueStats {
    #[must_use]
    pub const fn pending(&self) -> usize {
        self.pending_critical + self.pending_normal + self.pending_low
    }

    #[must_use]
    pub const fn pending_for(&self, priority: Priority) -> usize {
        match priority {
            Priority::Critical => self.pending_critical,
            Priority::Normal => self.pending_normal,
            Priority::Low => self.pending_low,
        }
    }
}
