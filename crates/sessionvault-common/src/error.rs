//! Error types for SessionVault
//!
//! This module defines the error taxonomy shared by every engine component.
//! Read-path errors are returned to callers directly; write-path errors are
//! classified here so the persistence queue can decide whether to retry.

use thiserror::Error;

/// Common result type for SessionVault operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for SessionVault
#[derive(Debug, Error)]
pub enum Error {
    /// A session, chunk or CAS entry does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The backend is temporarily unavailable; safe to retry
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// Stored state is inconsistent (missing chunk, bad index, bad checksum)
    #[error("data corruption detected: {0}")]
    Corruption(String),

    /// The persistence queue is over capacity
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// The data volume is below its free-space floor
    #[error("insufficient disk space: {available} bytes free, {required} required")]
    InsufficientSpace { available: u64, required: u64 },

    /// Concurrent writers touched the same record
    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("persistence queue is closed")]
    QueueClosed,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not found error for a session
    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "session",
            id: id.into(),
        }
    }

    /// Create a not found error for a content hash
    pub fn blob_not_found(hash: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "content",
            id: hash.into(),
        }
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create a transient I/O error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientIo(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this is a corruption error
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
