//! Byte-budgeted LRU cache for metadata, chunk and index documents
//!
//! Reads consult this cache before the backend. Capacity is a total byte
//! budget rather than an entry count: each entry is charged its key length,
//! value length and a fixed bookkeeping overhead. Entries also expire after
//! a TTL regardless of recency.

use crate::clock::{Clock, SystemClock};
use bytes::Bytes;
use parking_lot::Mutex;
use sessionvault_common::config::CacheConfig;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Which keys an invalidation applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern {
    Exact(String),
    Prefix(String),
}

impl KeyPattern {
    /// `"session/chunk/s1/*"` is a prefix pattern, anything else is exact
    #[must_use]
    pub fn parse(pattern: &str) -> Self {
        pattern.strip_suffix('*').map_or_else(
            || Self::Exact(pattern.to_string()),
            |prefix| Self::Prefix(prefix.to_string()),
        )
    }

    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(k) => k == key,
            Self::Prefix(p) => key.starts_with(p.as_str()),
        }
    }
}

impl From<&str> for KeyPattern {
    fn from(pattern: &str) -> Self {
        Self::parse(pattern)
    }
}

struct CacheEntry {
    value: Bytes,
    /// Charged size in bytes
    size: usize,
    /// Logical access tick; key into the recency index
    last_access: u64,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Access tick -> key, oldest first
    recency: BTreeMap<u64, String>,
    used_bytes: usize,
    clock: u64,
}

impl CacheInner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.last_access);
        self.used_bytes -= entry.size;
        Some(entry)
    }

    fn pop_lru(&mut self) -> Option<String> {
        let (_, key) = self.recency.pop_first()?;
        if let Some(entry) = self.entries.remove(&key) {
            self.used_bytes -= entry.size;
        }
        Some(key)
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: AtomicU64,
    /// Number of cache misses (including expired entries)
    pub misses: AtomicU64,
    /// Entries evicted to stay within the byte budget
    pub evictions: AtomicU64,
    /// Entries dropped because their TTL elapsed
    pub expirations: AtomicU64,
    /// Entries removed by `delete`/`invalidate`
    pub invalidations: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

/// Point-in-time view of cache occupancy and counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheSnapshot {
    pub entries: usize,
    pub used_bytes: usize,
    pub max_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub hit_ratio: f64,
}

/// Byte-budgeted LRU cache with per-entry TTL
pub struct LruCache {
    inner: Mutex<CacheInner>,
    max_bytes: usize,
    per_entry_overhead: usize,
    /// `None` when the configured default TTL is zero
    default_ttl: Option<Duration>,
    clock: Arc<dyn Clock>,
    stats: CacheStats,
}

impl LruCache {
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let ttl = config.default_ttl();
        Self {
            inner: Mutex::new(CacheInner::default()),
            max_bytes: config.max_bytes,
            per_entry_overhead: config.per_entry_overhead,
            default_ttl: (!ttl.is_zero()).then_some(ttl),
            clock,
            stats: CacheStats::default(),
        }
    }

    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let (entries, used_bytes) = {
            let inner = self.inner.lock();
            (inner.entries.len(), inner.used_bytes)
        };
        CacheSnapshot {
            entries,
            used_bytes,
            max_bytes: self.max_bytes,
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            expirations: self.stats.expirations.load(Ordering::Relaxed),
            invalidations: self.stats.invalidations.load(Ordering::Relaxed),
            hit_ratio: self.stats.hit_ratio(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Bytes currently charged against the budget
    pub fn used_bytes(&self) -> usize {
        self.inner.lock().used_bytes
    }

    pub const fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    fn entry_size(&self, key: &str, value: &Bytes) -> usize {
        key.len() + value.len() + self.per_entry_overhead
    }

    /// Look up a key, refreshing its recency on a hit
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(key) {
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => entry.expires_at.is_some_and(|t| now >= t),
        };
        if expired {
            inner.remove(key);
            self.stats.expirations.fetch_add(1, Ordering::Relaxed);
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let tick = inner.tick();
        let CacheInner {
            entries, recency, ..
        } = &mut *inner;
        let entry = entries.get_mut(key)?;
        recency.remove(&entry.last_access);
        entry.last_access = tick;
        recency.insert(tick, key.to_string());

        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    /// Insert or replace a value
    ///
    /// `ttl` overrides the configured default. Values larger than the whole
    /// budget are not cached. Returns whether the value was stored.
    pub fn set(&self, key: impl Into<String>, value: Bytes, ttl: Option<Duration>) -> bool {
        let key = key.into();
        let size = self.entry_size(&key, &value);
        let mut inner = self.inner.lock();
        inner.remove(&key);

        if size > self.max_bytes {
            debug!(
                "Not caching {} ({} bytes exceeds budget {})",
                key, size, self.max_bytes
            );
            return false;
        }

        while inner.used_bytes + size > self.max_bytes {
            if inner.pop_lru().is_none() {
                break;
            }
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }

        let expires_at = ttl.or(self.default_ttl).map(|d| self.clock.now() + d);
        let tick = inner.tick();
        inner.recency.insert(tick, key.clone());
        inner.used_bytes += size;
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                size,
                last_access: tick,
                expires_at,
            },
        );
        true
    }

    /// Remove a single key
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.inner.lock().remove(key).is_some();
        if removed {
            self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove every key matching `pattern`; returns how many were removed
    pub fn invalidate(&self, pattern: impl Into<KeyPattern>) -> usize {
        let pattern = pattern.into();
        if let KeyPattern::Exact(key) = &pattern {
            return usize::from(self.delete(key));
        }

        let mut inner = self.inner.lock();
        let matching: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| pattern.matches(k))
            .cloned()
            .collect();
        for key in &matching {
            inner.remove(key);
        }
        self.stats
            .invalidations
            .fetch_add(matching.len() as u64, Ordering::Relaxed);
        matching.len()
    }

    /// Check presence without touching recency or expiry
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Drop every expired entry; returns how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|t| now >= t))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        self.stats
            .expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Clear all entries from the cache
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
        inner.used_bytes = 0;
    }
}
