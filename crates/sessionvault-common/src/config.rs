//! Configuration types for SessionVault
//!
//! Every field has a default so a partial TOML file (or none at all) yields
//! a usable engine configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Root configuration for the storage engine
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Chunked session storage configuration
    pub storage: StorageConfig,
    /// LRU cache configuration
    pub cache: CacheConfig,
    /// Persistence queue configuration
    pub queue: QueueConfig,
    /// Content-addressable store configuration
    pub cas: CasConfig,
    /// Inverted index configuration
    pub index: IndexConfig,
}

impl EngineConfig {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| Error::Configuration(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.storage.chunk_size == 0 {
            return Err(Error::Configuration("storage.chunk_size must be > 0".into()));
        }
        if self.cache.max_bytes == 0 {
            return Err(Error::Configuration("cache.max_bytes must be > 0".into()));
        }
        if self.queue.max_pending == 0 {
            return Err(Error::Configuration("queue.max_pending must be > 0".into()));
        }
        if self.queue.batch_window_ms == 0 {
            return Err(Error::Configuration(
                "queue.batch_window_ms must be > 0".into(),
            ));
        }
        if self.cas.gc_batch_size == 0 {
            return Err(Error::Configuration("cas.gc_batch_size must be > 0".into()));
        }
        Ok(())
    }
}

/// Chunked session storage configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Attachments per chunk, fixed when a chunk is created
    pub chunk_size: u32,
    /// Free space a write needs on the data volume; 0 disables the check
    pub min_free_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10,
            min_free_bytes: 100 * 1024 * 1024, // 100 MB
        }
    }
}

/// LRU cache configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Total byte budget across all entries
    pub max_bytes: usize,
    /// Time-to-live applied when a caller does not pass one
    pub default_ttl_secs: u64,
    /// Bookkeeping bytes added to each entry's size estimate
    pub per_entry_overhead: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024 * 1024, // 64 MB
            default_ttl_secs: 300,
            per_entry_overhead: 64,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

/// Persistence queue configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Collection window for normal-priority batching
    pub batch_window_ms: u64,
    /// Pending items before low-priority work is shed
    pub max_pending: usize,
    /// First retry delay; doubled per attempt
    pub backoff_base_ms: u64,
    /// Upper bound on the retry delay
    pub backoff_max_ms: u64,
    /// Retry budget for critical items
    pub critical_retries: u32,
    /// Retry budget for normal items
    pub normal_retries: u32,
    /// Retry budget for low items
    pub low_retries: u32,
    /// How long the scheduler must be quiet before low items run
    pub idle_poll_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_window_ms: 100,
            max_pending: 10_000,
            backoff_base_ms: 100,
            backoff_max_ms: 5_000,
            critical_retries: 5,
            normal_retries: 3,
            low_retries: 1,
            idle_poll_ms: 250,
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub const fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    #[must_use]
    pub const fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    /// Exponential backoff for the given attempt (1-based)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let ms = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(ms.min(self.backoff_max_ms))
    }
}

/// Content-addressable store configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CasConfig {
    /// Orphaned hashes examined per garbage-collection batch
    pub gc_batch_size: usize,
    /// Verify the stored CRC32C on every blob read
    pub verify_checksums: bool,
}

impl Default for CasConfig {
    fn default() -> Self {
        Self {
            gc_batch_size: 64,
            verify_checksums: true,
        }
    }
}

/// Inverted index configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Rebuild automatically when an integrity check finds corruption
    pub auto_rebuild: bool,
    /// Extra stop words on top of the built-in English list
    pub extra_stop_words: Vec<String>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            auto_rebuild: true,
            extra_stop_words: Vec::new(),
        }
    }
}
