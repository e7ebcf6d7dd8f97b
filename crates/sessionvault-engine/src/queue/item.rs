//! Queue item model

use bytes::Bytes;
use sessionvault_common::config::QueueConfig;
use sessionvault_common::{Result, SessionId};
use sessionvault_kv::KvOp;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

/// Scheduling tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    Critical = 2,
}

impl Priority {
    pub(crate) const fn tier(self) -> usize {
        match self {
            Self::Critical => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }

    /// Retry budget for this tier
    #[must_use]
    pub const fn max_retries(self, config: &QueueConfig) -> u32 {
        match self {
            Self::Critical => config.critical_retries,
            Self::Normal => config.normal_retries,
            Self::Low => config.low_retries,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of write an item carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemType {
    Simple,
    Chunk,
    Index,
    CaStorage,
    Cleanup,
}

impl ItemType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Chunk => "chunk",
            Self::Index => "index",
            Self::CaStorage => "ca-storage",
            Self::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Background work run from the queue (garbage collection, index
/// optimization). Runs on the blocking pool and may enqueue further writes.
pub trait MaintenanceTask: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self) -> Result<()>;
}

/// Payload of a queue item
#[derive(Clone)]
pub enum QueueOp {
    Put { key: String, value: Bytes },
    Delete { key: String },
    /// Ops committed together in one backend transaction
    Transaction(Vec<KvOp>),
    Maintenance(Arc<dyn MaintenanceTask>),
}

impl QueueOp {
    /// Backend ops this item commits; empty for maintenance
    #[must_use]
    pub fn kv_ops(&self) -> Vec<KvOp> {
        match self {
            Self::Put { key, value } => vec![KvOp::put(key.clone(), value.clone())],
            Self::Delete { key } => vec![KvOp::delete(key.clone())],
            Self::Transaction(ops) => ops.clone(),
            Self::Maintenance(_) => Vec::new(),
        }
    }

    /// Keys written by this item
    pub fn keys(&self) -> Box<dyn Iterator<Item = &str> + '_> {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => Box::new(std::iter::once(key.as_str())),
            Self::Transaction(ops) => Box::new(ops.iter().map(KvOp::key)),
            Self::Maintenance(_) => Box::new(std::iter::empty()),
        }
    }

    fn label(&self) -> String {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key.clone(),
            Self::Transaction(ops) => format!("txn[{} ops]", ops.len()),
            Self::Maintenance(task) => task.name().to_string(),
        }
    }
}

impl fmt::Debug for QueueOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Put { key, value } => write!(f, "Put({key}, {} bytes)", value.len()),
            Self::Delete { key } => write!(f, "Delete({key})"),
            Self::Transaction(ops) => write!(f, "Transaction({} ops)", ops.len()),
            Self::Maintenance(task) => write!(f, "Maintenance({})", task.name()),
        }
    }
}

/// Identifying fields of an item, carried on every event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfo {
    pub seq: u64,
    pub priority: Priority,
    pub item_type: ItemType,
    pub session_id: Option<SessionId>,
    /// Key, transaction size or task name
    pub label: String,
}

/// A unit of pending work
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub seq: u64,
    pub op: QueueOp,
    pub priority: Priority,
    pub item_type: ItemType,
    /// Groups batchable writes of one session into one transaction
    pub session_id: Option<SessionId>,
    pub retry_count: u32,
    pub batchable: bool,
    pub(crate) enqueued_at: Instant,
}

impl QueueItem {
    #[must_use]
    pub fn info(&self) -> ItemInfo {
        ItemInfo {
            seq: self.seq,
            priority: self.priority,
            item_type: self.item_type,
            session_id: self.session_id.clone(),
            label: self.op.label(),
        }
    }

    /// Session this item may be batched under, if any
    pub(crate) fn batch_key(&self) -> Option<&SessionId> {
        if self.batchable && !matches!(self.op, QueueOp::Maintenance(_)) {
            self.session_id.as_ref()
        } else {
            None
        }
    }
}

/// Options for a generic enqueue
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Priority,
    pub item_type: Option<ItemType>,
    pub session_id: Option<SessionId>,
    pub batchable: bool,
}
