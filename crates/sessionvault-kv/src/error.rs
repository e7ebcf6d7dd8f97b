//! Backend error types

use thiserror::Error;

/// Error type for key-value backend operations
#[derive(Debug, Error)]
pub enum KvError {
    #[error("redb error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Backend temporarily unable to serve the request
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl From<redb::TransactionError> for KvError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

pub type KvResult<T> = Result<T, KvError>;

// The engine treats every backend failure as transient: the queue retries it
// within the item's budget and the read path surfaces it to the caller.
impl From<KvError> for sessionvault_common::Error {
    fn from(e: KvError) -> Self {
        Self::TransientIo(e.to_string())
    }
}
