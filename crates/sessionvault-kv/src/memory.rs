//! In-memory backend with operation counters and fault injection
//!
//! Used by the engine's tests to observe how many backend transactions a
//! workload produces, which keys a read touched, and how the queue reacts
//! to transient failures.

use crate::backend::{KvBackend, KvTransaction};
use crate::error::{KvError, KvResult};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

type Entries = Arc<RwLock<BTreeMap<String, Vec<u8>>>>;

#[derive(Default)]
struct Counters {
    gets: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    injected_failures: AtomicU64,
    fail_writes: AtomicU64,
    fail_reads: AtomicU64,
}

impl Counters {
    /// Consume one pending injected failure, if any
    fn take(slot: &AtomicU64, injected: &AtomicU64) -> bool {
        let taken = slot
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if taken {
            injected.fetch_add(1, Ordering::Relaxed);
        }
        taken
    }

    fn fail_write(&self) -> bool {
        Self::take(&self.fail_writes, &self.injected_failures)
    }

    fn fail_read(&self) -> bool {
        Self::take(&self.fail_reads, &self.injected_failures)
    }
}

/// Point-in-time snapshot of backend activity
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub gets: u64,
    pub sets: u64,
    pub deletes: u64,
    pub transactions_committed: u64,
    pub transactions_rolled_back: u64,
    pub injected_failures: u64,
}

/// Key-value backend held entirely in memory
#[derive(Clone, Default)]
pub struct MemoryBackend {
    entries: Entries,
    counters: Arc<Counters>,
    read_log: Arc<Mutex<Vec<String>>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes (single-key or transaction commits) fail
    pub fn fail_next_writes(&self, n: u64) {
        self.counters.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` reads fail
    pub fn fail_next_reads(&self, n: u64) {
        self.counters.fail_reads.store(n, Ordering::SeqCst);
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        let c = &self.counters;
        MemoryStats {
            gets: c.gets.load(Ordering::Relaxed),
            sets: c.sets.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
            transactions_committed: c.commits.load(Ordering::Relaxed),
            transactions_rolled_back: c.rollbacks.load(Ordering::Relaxed),
            injected_failures: c.injected_failures.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    #[must_use]
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Keys read so far that start with `prefix`, in read order
    #[must_use]
    pub fn reads_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.read_log
            .lock()
            .iter()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn clear_read_log(&self) {
        self.read_log.lock().clear();
    }

    /// Overwrite a key directly, bypassing counters (test setup only)
    pub fn insert_raw(&self, key: &str, value: &[u8]) {
        self.entries.write().insert(key.to_string(), value.to_vec());
    }

    fn injected(op: &str) -> KvError {
        KvError::Unavailable(format!("injected {op} failure"))
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        if self.counters.fail_read() {
            return Err(Self::injected("read"));
        }
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        self.read_log.lock().push(key.to_string());
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> KvResult<()> {
        if self.counters.fail_write() {
            return Err(Self::injected("write"));
        }
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> KvResult<()> {
        if self.counters.fail_write() {
            return Err(Self::injected("write"));
        }
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.entries.write().remove(key);
        Ok(())
    }

    fn begin_transaction(&self) -> KvResult<Box<dyn KvTransaction>> {
        Ok(Box::new(MemoryTransaction {
            entries: Arc::clone(&self.entries),
            counters: Arc::clone(&self.counters),
            ops: Vec::new(),
        }))
    }
}

struct MemoryTransaction {
    entries: Entries,
    counters: Arc<Counters>,
    ops: Vec<(String, Option<Vec<u8>>)>,
}

impl KvTransaction for MemoryTransaction {
    fn save(&mut self, key: &str, value: &[u8]) {
        self.ops.push((key.to_string(), Some(value.to_vec())));
    }

    fn remove(&mut self, key: &str) {
        self.ops.push((key.to_string(), None));
    }

    fn commit(self: Box<Self>) -> KvResult<()> {
        if self.counters.fail_write() {
            self.counters.rollbacks.fetch_add(1, Ordering::Relaxed);
            return Err(MemoryBackend::injected("commit"));
        }
        let mut entries = self.entries.write();
        for (key, value) in self.ops {
            match value {
                Some(v) => {
                    self.counters.sets.fetch_add(1, Ordering::Relaxed);
                    entries.insert(key, v);
                }
                None => {
                    self.counters.deletes.fetch_add(1, Ordering::Relaxed);
                    entries.remove(&key);
                }
            }
        }
        self.counters.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        self.counters.rollbacks.fetch_add(1, Ordering::Relaxed);
    }
}
