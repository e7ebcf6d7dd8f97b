//! Content-addressable store for attachment bytes
//!
//! Blobs are keyed by SHA-256 of their content and carry a reference
//! count. Storing bytes that already exist only bumps the count. Releasing
//! never deletes bytes: a hash whose count reaches zero is recorded in the
//! orphan list and reclaimed by an explicit, batched garbage collection.
//!
//! Every read-modify-write of a hash's record happens under that hash's
//! lock, and the resulting writes are enqueued before the lock is released,
//! so concurrent put/release on one hash are serialized. When several locks
//! are needed they are taken in hash order, followed by the orphan-list
//! lock.

use crate::access::{ReadThrough, encode_bincode, encode_json};
use crate::keys;
use crate::maintenance::CancelFlag;
use crate::queue::{
    EnqueueOptions, ItemType, MaintenanceTask, PersistenceQueue, Priority, QueueOp,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use sessionvault_common::config::CasConfig;
use sessionvault_common::{ContentHash, Error, Result, SessionId, content_checksum};
use sessionvault_kv::KvOp;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Reference record stored next to each blob
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasRecord {
    pub ref_count: u64,
    pub size: u64,
    pub crc32c: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of storing bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PutOutcome {
    pub hash: ContentHash,
    pub ref_count: u64,
    /// The bytes were already stored
    pub deduplicated: bool,
}

/// Summary of one garbage-collection sweep
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Orphan-list entries looked at
    pub examined: usize,
    /// Blobs deleted
    pub freed: usize,
    pub bytes_freed: u64,
    /// Orphans that gained a reference again before collection
    pub resurrected: usize,
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct CasCounters {
    puts: AtomicU64,
    new_entries: AtomicU64,
    dedup_hits: AtomicU64,
    bytes_written: AtomicU64,
    bytes_saved: AtomicU64,
    releases: AtomicU64,
    gc_runs: AtomicU64,
    gc_freed: AtomicU64,
    gc_bytes_freed: AtomicU64,
}

/// Point-in-time CAS statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CasStats {
    pub puts: u64,
    pub new_entries: u64,
    pub dedup_hits: u64,
    pub bytes_written: u64,
    /// Bytes not written thanks to deduplication
    pub bytes_saved: u64,
    pub releases: u64,
    pub gc_runs: u64,
    pub gc_freed: u64,
    pub gc_bytes_freed: u64,
}

impl CasStats {
    /// Fraction of puts served by an existing blob
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn dedup_ratio(&self) -> f64 {
        if self.puts == 0 {
            return 0.0;
        }
        self.dedup_hits as f64 / self.puts as f64
    }
}

pub struct ContentStore {
    reader: ReadThrough,
    config: CasConfig,
    locks: DashMap<ContentHash, Arc<Mutex<()>>>,
    orphans_lock: Mutex<()>,
    counters: CasCounters,
}

impl ContentStore {
    pub fn new(reader: ReadThrough, config: CasConfig) -> Self {
        Self {
            reader,
            config,
            locks: DashMap::new(),
            orphans_lock: Mutex::new(()),
            counters: CasCounters::default(),
        }
    }

    fn queue(&self) -> &PersistenceQueue {
        self.reader.queue()
    }

    fn lock_for(&self, hash: &ContentHash) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(*hash).or_default().value())
    }

    /// Forget per-hash locks nobody else holds
    fn forget_idle_locks<'a>(&self, hashes: impl IntoIterator<Item = &'a ContentHash>) {
        for hash in hashes {
            self.locks.remove_if(hash, |_, l| Arc::strong_count(l) == 1);
        }
    }

    #[cfg(test)]
    pub(crate) fn lock_entries(&self) -> usize {
        self.locks.len()
    }

    /// Store bytes, or add a reference to the existing copy
    pub fn put(&self, bytes: &[u8]) -> Result<ContentHash> {
        self.put_with(bytes, None).map(|o| o.hash)
    }

    /// Like [`put`](Self::put); writes are batched with the session's
    /// other writes when `session` is given
    pub fn put_with(&self, bytes: &[u8], session: Option<&SessionId>) -> Result<PutOutcome> {
        let hash = ContentHash::compute(bytes);
        let outcome = {
            let lock = self.lock_for(&hash);
            let _guard = lock.lock();
            self.put_locked(hash, bytes, session)
        };
        self.forget_idle_locks([&hash]);
        outcome
    }

    fn put_locked(
        &self,
        hash: ContentHash,
        bytes: &[u8],
        session: Option<&SessionId>,
    ) -> Result<PutOutcome> {
        let now = Utc::now();
        let ref_key = keys::cas_ref(&hash);
        let existing: Option<CasRecord> = self.reader.get_bincode(&ref_key)?;

        let (record, ops, deduplicated) = match existing {
            Some(mut record) if record.ref_count > 0 => {
                record.ref_count += 1;
                record.updated_at = now;
                let ops = vec![KvOp::put(ref_key, encode_bincode(&record)?)];
                (record, ops, true)
            }
            previous => {
                // New content, or an orphan not yet collected: (re)write the blob
                let record = CasRecord {
                    ref_count: 1,
                    size: bytes.len() as u64,
                    crc32c: content_checksum(bytes),
                    created_at: previous.map_or(now, |r| r.created_at),
                    updated_at: now,
                };
                let ops = vec![
                    KvOp::put(keys::cas_blob(&hash), Bytes::copy_from_slice(bytes)),
                    KvOp::put(ref_key, encode_bincode(&record)?),
                ];
                (record, ops, false)
            }
        };

        self.queue().enqueue_with(
            QueueOp::Transaction(ops),
            EnqueueOptions {
                priority: Priority::Normal,
                item_type: Some(ItemType::CaStorage),
                session_id: session.cloned(),
                batchable: session.is_some(),
            },
        )?;

        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        if deduplicated {
            self.counters.dedup_hits.fetch_add(1, Ordering::Relaxed);
            self.counters
                .bytes_saved
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            debug!("CAS dedup hit {} (refs={})", hash.short(), record.ref_count);
        } else {
            self.counters.new_entries.fetch_add(1, Ordering::Relaxed);
            self.counters
                .bytes_written
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            debug!("CAS stored {} ({} bytes)", hash.short(), bytes.len());
        }

        Ok(PutOutcome {
            hash,
            ref_count: record.ref_count,
            deduplicated,
        })
    }

    /// Fetch bytes by hash
    pub fn get(&self, hash: &ContentHash) -> Result<Bytes> {
        let record = self
            .record(hash)?
            .ok_or_else(|| Error::blob_not_found(hash.to_hex()))?;
        let bytes = self.reader.get(&keys::cas_blob(hash))?.ok_or_else(|| {
            Error::corruption(format!("CAS blob {} missing for existing record", hash.short()))
        })?;

        if self.config.verify_checksums {
            let actual = content_checksum(&bytes);
            if actual != record.crc32c {
                return Err(Error::corruption(format!(
                    "CAS blob {} checksum mismatch: stored {:08x}, computed {:08x}",
                    hash.short(),
                    record.crc32c,
                    actual
                )));
            }
        }
        Ok(bytes)
    }

    pub fn record(&self, hash: &ContentHash) -> Result<Option<CasRecord>> {
        self.reader.get_bincode(&keys::cas_ref(hash))
    }

    /// Current reference count; zero for unknown hashes
    pub fn ref_count(&self, hash: &ContentHash) -> Result<u64> {
        Ok(self.record(hash)?.map_or(0, |r| r.ref_count))
    }

    pub fn contains(&self, hash: &ContentHash) -> Result<bool> {
        Ok(self.record(hash)?.is_some())
    }

    /// Drop one reference; returns the remaining count
    pub fn release(&self, hash: &ContentHash) -> Result<u64> {
        self.release_many(&[*hash], |ops| {
            if !ops.is_empty() {
                self.queue().enqueue_cas(ops, Priority::Normal)?;
            }
            Ok(())
        })
        .map(|remaining| remaining.get(hash).copied().unwrap_or(0))
    }

    /// Drop one reference per listed hash (repeats count) and hand the
    /// resulting ops to `commit` while every affected hash is still locked
    ///
    /// `commit` is always called, with an empty list when nothing changed.
    ///
    /// Used by session deletion so the releases land in the same atomic
    /// unit as the rest of the delete. Returns the remaining counts.
    pub fn release_many<F>(
        &self,
        hashes: &[ContentHash],
        commit: F,
    ) -> Result<BTreeMap<ContentHash, u64>>
    where
        F: FnOnce(Vec<KvOp>) -> Result<()>,
    {
        let mut wanted: BTreeMap<ContentHash, u64> = BTreeMap::new();
        for hash in hashes {
            *wanted.entry(*hash).or_default() += 1;
        }

        let result = {
            let locks: Vec<Arc<Mutex<()>>> = wanted.keys().map(|h| self.lock_for(h)).collect();
            let _guards: Vec<MutexGuard<'_, ()>> = locks.iter().map(|l| l.lock()).collect();
            self.release_locked(&wanted, commit)
        };
        self.forget_idle_locks(wanted.keys());
        if result.is_ok() {
            self.counters
                .releases
                .fetch_add(hashes.len() as u64, Ordering::Relaxed);
        }
        result
    }

    fn release_locked<F>(
        &self,
        wanted: &BTreeMap<ContentHash, u64>,
        commit: F,
    ) -> Result<BTreeMap<ContentHash, u64>>
    where
        F: FnOnce(Vec<KvOp>) -> Result<()>,
    {
        let _orphans_guard = self.orphans_lock.lock();

        let now = Utc::now();
        let mut ops = Vec::new();
        let mut remaining = BTreeMap::new();
        let mut new_orphans = Vec::new();

        for (hash, n) in wanted {
            let Some(mut record) = self.record(hash)? else {
                warn!("Release of unknown CAS entry {}", hash.short());
                continue;
            };
            if record.ref_count < *n {
                warn!(
                    "CAS entry {} released {} times with only {} refs",
                    hash.short(),
                    n,
                    record.ref_count
                );
            }
            let was_live = record.ref_count > 0;
            record.ref_count = record.ref_count.saturating_sub(*n);
            record.updated_at = now;
            if was_live && record.ref_count == 0 {
                new_orphans.push(*hash);
            }
            remaining.insert(*hash, record.ref_count);
            ops.push(KvOp::put(keys::cas_ref(hash), encode_bincode(&record)?));
        }

        if !new_orphans.is_empty() {
            let mut orphans = self.orphans()?;
            orphans.extend(new_orphans);
            ops.push(KvOp::put(keys::CAS_ORPHANS, encode_json(&orphans)?));
        }

        commit(ops)?;
        Ok(remaining)
    }

    /// Hashes whose reference count reached zero and are awaiting collection
    pub fn orphans(&self) -> Result<BTreeSet<ContentHash>> {
        let list: Option<Vec<ContentHash>> = self.reader.get_json(keys::CAS_ORPHANS)?;
        Ok(list.unwrap_or_default().into_iter().collect())
    }

    /// Delete blobs whose reference count is zero
    ///
    /// Works through the orphan list in batches of `gc_batch_size`, checking
    /// `cancel` between batches. Each batch's deletes and the orphan-list
    /// update are enqueued as one atomic unit; a second run right after
    /// finds nothing to free.
    pub fn garbage_collect(&self, cancel: &CancelFlag) -> Result<GcReport> {
        let mut report = GcReport::default();
        let candidates: Vec<ContentHash> = {
            let _orphans_guard = self.orphans_lock.lock();
            self.orphans()?.into_iter().collect()
        };

        for batch in candidates.chunks(self.config.gc_batch_size.max(1)) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                info!("CAS garbage collection cancelled after {} entries", report.examined);
                break;
            }
            self.collect_batch(batch, &mut report)?;
        }

        self.counters.gc_runs.fetch_add(1, Ordering::Relaxed);
        self.counters
            .gc_freed
            .fetch_add(report.freed as u64, Ordering::Relaxed);
        self.counters
            .gc_bytes_freed
            .fetch_add(report.bytes_freed, Ordering::Relaxed);
        info!(
            "CAS garbage collection: examined {}, freed {} ({} bytes), resurrected {}",
            report.examined, report.freed, report.bytes_freed, report.resurrected
        );
        Ok(report)
    }

    fn collect_batch(&self, batch: &[ContentHash], report: &mut GcReport) -> Result<()> {
        let result = self.collect_locked(batch, report);
        self.forget_idle_locks(batch);
        result
    }

    fn collect_locked(&self, batch: &[ContentHash], report: &mut GcReport) -> Result<()> {
        let locks: Vec<Arc<Mutex<()>>> = batch.iter().map(|h| self.lock_for(h)).collect();
        let _guards: Vec<MutexGuard<'_, ()>> = locks.iter().map(|l| l.lock()).collect();
        let _orphans_guard = self.orphans_lock.lock();

        let mut ops = Vec::new();
        let mut settled = BTreeSet::new();
        for hash in batch {
            report.examined += 1;
            match self.record(hash) {
                Ok(Some(record)) if record.ref_count == 0 => {
                    ops.push(KvOp::delete(keys::cas_blob(hash)));
                    ops.push(KvOp::delete(keys::cas_ref(hash)));
                    report.freed += 1;
                    report.bytes_freed += record.size;
                    debug!("CAS collecting {} ({} bytes)", hash.short(), record.size);
                }
                Ok(Some(_)) => report.resurrected += 1,
                Ok(None) => {}
                Err(e) if e.is_corruption() => {
                    // Undecodable record: leave it for inspection
                    warn!("Skipping unreadable CAS record {}: {}", hash.short(), e);
                }
                Err(e) => return Err(e),
            }
            settled.insert(*hash);
        }

        let mut orphans = self.orphans()?;
        orphans.retain(|h| !settled.contains(h));
        ops.push(KvOp::put(keys::CAS_ORPHANS, encode_json(&orphans)?));
        self.queue().enqueue_cas(ops, Priority::Normal)?;
        Ok(())
    }

    pub fn stats(&self) -> CasStats {
        let c = &self.counters;
        CasStats {
            puts: c.puts.load(Ordering::Relaxed),
            new_entries: c.new_entries.load(Ordering::Relaxed),
            dedup_hits: c.dedup_hits.load(Ordering::Relaxed),
            bytes_written: c.bytes_written.load(Ordering::Relaxed),
            bytes_saved: c.bytes_saved.load(Ordering::Relaxed),
            releases: c.releases.load(Ordering::Relaxed),
            gc_runs: c.gc_runs.load(Ordering::Relaxed),
            gc_freed: c.gc_freed.load(Ordering::Relaxed),
            gc_bytes_freed: c.gc_bytes_freed.load(Ordering::Relaxed),
        }
    }
}

/// Garbage collection as a low-priority queue item
pub struct GcTask {
    cas: Arc<ContentStore>,
    cancel: CancelFlag,
}

impl GcTask {
    pub const fn new(cas: Arc<ContentStore>, cancel: CancelFlag) -> Self {
        Self { cas, cancel }
    }
}

impl MaintenanceTask for GcTask {
    fn name(&self) -> &str {
        "cas-gc"
    }

    fn run(&self) -> Result<()> {
        self.cas.garbage_collect(&self.cancel).map(|_| ())
    }
}
