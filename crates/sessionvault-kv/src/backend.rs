//! Backend traits consumed by the engine

use crate::error::KvResult;
use bytes::Bytes;

/// One mutation inside a batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KvOp {
    Put { key: String, value: Bytes },
    Delete { key: String },
}

impl KvOp {
    pub fn put(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }

    /// Key this op touches
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }

    /// New value, or `None` for a delete
    #[must_use]
    pub const fn value(&self) -> Option<&Bytes> {
        match self {
            Self::Put { value, .. } => Some(value),
            Self::Delete { .. } => None,
        }
    }
}

/// Byte-addressable key-value store
///
/// Single-key writes must be atomic. Multi-key atomicity is provided by
/// [`KvBackend::begin_transaction`].
pub trait KvBackend: Send + Sync {
    fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: &[u8]) -> KvResult<()>;

    fn delete(&self, key: &str) -> KvResult<()>;

    fn begin_transaction(&self) -> KvResult<Box<dyn KvTransaction>>;

    /// Apply a batch of ops as one transaction: all or nothing
    fn apply(&self, ops: &[KvOp]) -> KvResult<()> {
        let mut txn = self.begin_transaction()?;
        for op in ops {
            match op {
                KvOp::Put { key, value } => txn.save(key, value),
                KvOp::Delete { key } => txn.remove(key),
            }
        }
        txn.commit()
    }
}

/// Buffered multi-key write; nothing is visible until `commit`
pub trait KvTransaction: Send {
    fn save(&mut self, key: &str, value: &[u8]);

    fn remove(&mut self, key: &str);

    fn commit(self: Box<Self>) -> KvResult<()>;

    fn rollback(self: Box<Self>);
}
