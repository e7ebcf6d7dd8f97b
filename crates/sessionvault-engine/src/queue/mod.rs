//! Persistence queue
//!
//! The only path by which the engine mutates the key-value backend.
//! Callers enqueue writes and return immediately; a background tokio task
//! commits them:
//!
//! - **Critical** items are dispatched immediately, one at a time.
//! - **Normal** items are collected for `batch_window`, then committed in
//!   groups. Batchable items sharing a session id become one backend
//!   transaction.
//! - **Low** items (cleanup) run only after the queue has been idle for
//!   `idle_poll`.
//!
//! Transient failures are retried with exponential backoff up to a
//! per-tier budget; the failed item goes back to the head of its tier so
//! FIFO order within the tier holds. Until a write commits, its value is
//! visible to readers through the pending overlay.

mod events;
mod item;
mod worker;

pub use events::{QueueEvent, QueueStats};
pub use item::{EnqueueOptions, ItemInfo, ItemType, MaintenanceTask, Priority, QueueItem, QueueOp};

use crate::cache::LruCache;
use bytes::Bytes;
use events::QueueCounters;
use parking_lot::Mutex;
use sessionvault_common::config::QueueConfig;
use sessionvault_common::{Error, Result, SessionId};
use sessionvault_kv::{KvBackend, KvOp};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Newest not-yet-committed value of a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayValue {
    Put(Bytes),
    Tombstone,
}

#[derive(Debug)]
struct PendingKey {
    /// Sequence number of the newest write to this key
    latest_seq: u64,
    /// `None` once the newest write was abandoned; reads fall through
    visible: Option<OverlayValue>,
    /// Unresolved items writing this key
    writers: usize,
    /// Highest sequence number already committed for this key
    committed_seq: u64,
}

pub(crate) struct QueueState {
    tiers: [VecDeque<QueueItem>; 3],
    paused_until: [Option<Instant>; 3],
    overlay: HashMap<String, PendingKey>,
    unresolved: BTreeSet<u64>,
    closed: bool,
    stopping: bool,
    /// Last time critical or normal work was enqueued or processed
    last_busy: Instant,
}

impl QueueState {
    fn new() -> Self {
        Self {
            tiers: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            paused_until: [None; 3],
            overlay: HashMap::new(),
            unresolved: BTreeSet::new(),
            closed: false,
            stopping: false,
            last_busy: Instant::now(),
        }
    }

    fn pending(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    fn register(&mut self, item: &QueueItem) {
        for op in item.op.kv_ops() {
            let visible = match &op {
                KvOp::Put { value, .. } => OverlayValue::Put(value.clone()),
                KvOp::Delete { .. } => OverlayValue::Tombstone,
            };
            let entry = self
                .overlay
                .entry(op.key().to_string())
                .or_insert(PendingKey {
                    latest_seq: item.seq,
                    visible: None,
                    writers: 0,
                    committed_seq: 0,
                });
            entry.latest_seq = item.seq;
            entry.visible = Some(visible);
            entry.writers += 1;
        }
        self.unresolved.insert(item.seq);
    }

    /// Release an item's overlay claims. `abandoned` hides its value if it
    /// was the newest write of a key.
    fn resolve(&mut self, item: &QueueItem, abandoned: bool) {
        for key in item.op.keys() {
            let remove = match self.overlay.get_mut(key) {
                Some(entry) => {
                    entry.writers = entry.writers.saturating_sub(1);
                    if abandoned && entry.latest_seq == item.seq {
                        entry.visible = None;
                    }
                    entry.writers == 0
                }
                None => false,
            };
            if remove {
                self.overlay.remove(key);
            }
        }
        self.unresolved.remove(&item.seq);
    }
}

pub(crate) struct QueueShared {
    config: QueueConfig,
    backend: Arc<dyn KvBackend>,
    cache: Arc<LruCache>,
    state: Mutex<QueueState>,
    /// Wakes the worker
    wake: Notify,
    /// Wakes `flush` callers after items resolve
    resolved: Notify,
    events: broadcast::Sender<QueueEvent>,
    counters: QueueCounters,
    next_seq: AtomicU64,
    commit_generation: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QueueShared {
    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn push(
        &self,
        op: QueueOp,
        priority: Priority,
        item_type: ItemType,
        session_id: Option<SessionId>,
        batchable: bool,
    ) -> Result<u64> {
        let mut dropped = Vec::new();
        let item = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::QueueClosed);
            }
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            let now = Instant::now();
            let item = QueueItem {
                seq,
                op,
                priority,
                item_type,
                session_id,
                retry_count: 0,
                batchable,
                enqueued_at: now,
            };

            if state.pending() >= self.config.max_pending {
                let low = Priority::Low.tier();
                if let Some(victim) = state.tiers[low].pop_front() {
                    state.resolve(&victim, true);
                    dropped.push(victim);
                } else if priority == Priority::Low {
                    drop(state);
                    warn!(
                        "Persistence queue full ({} pending), dropping incoming {} item",
                        self.config.max_pending, item.item_type
                    );
                    QueueCounters::bump(&self.counters.dropped);
                    self.emit(QueueEvent::Dropped {
                        item: item.info(),
                        reason: "queue full".to_string(),
                    });
                    return Err(Error::Capacity(format!(
                        "persistence queue full ({} pending)",
                        self.config.max_pending
                    )));
                } else {
                    warn!(
                        "Persistence queue over capacity ({} pending), accepting {} item",
                        state.pending(),
                        priority
                    );
                }
            }

            state.register(&item);
            if priority != Priority::Low {
                state.last_busy = now;
            }
            state.tiers[priority.tier()].push_back(item.clone());
            item
        };

        for victim in dropped {
            warn!(
                "Persistence queue full, evicted pending low item seq={} ({})",
                victim.seq,
                victim.info().label
            );
            QueueCounters::bump(&self.counters.dropped);
            self.emit(QueueEvent::Dropped {
                item: victim.info(),
                reason: "evicted to make room".to_string(),
            });
            self.resolved.notify_waiters();
        }

        QueueCounters::bump(&self.counters.enqueued);
        debug!(
            "Enqueued seq={} priority={} type={} {}",
            item.seq,
            item.priority,
            item.item_type,
            item.info().label
        );
        self.emit(QueueEvent::Enqueued(item.info()));
        self.wake.notify_one();
        Ok(item.seq)
    }

    fn is_resolved_below(&self, target: u64) -> bool {
        self.state
            .lock()
            .unresolved
            .first()
            .is_none_or(|&oldest| oldest >= target)
    }
}

/// Handle to the persistence queue; cheap to clone
#[derive(Clone)]
pub struct PersistenceQueue {
    shared: Arc<QueueShared>,
}

impl PersistenceQueue {
    /// Start the queue and spawn its worker on the current tokio runtime
    pub fn start(
        config: QueueConfig,
        backend: Arc<dyn KvBackend>,
        cache: Arc<LruCache>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::internal(format!("persistence queue needs a tokio runtime: {e}")))?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(QueueShared {
            config,
            backend,
            cache,
            state: Mutex::new(QueueState::new()),
            wake: Notify::new(),
            resolved: Notify::new(),
            events,
            counters: QueueCounters::default(),
            next_seq: AtomicU64::new(1),
            commit_generation: AtomicU64::new(0),
            worker: Mutex::new(None),
        });
        let handle = runtime.spawn(worker::run(Arc::clone(&shared)));
        *shared.worker.lock() = Some(handle);
        info!(
            "Persistence queue started (batch window {:?}, max pending {})",
            shared.config.batch_window(),
            shared.config.max_pending
        );
        Ok(Self { shared })
    }

    /// Enqueue a simple write
    pub fn enqueue(
        &self,
        key: impl Into<String>,
        value: impl Into<Bytes>,
        priority: Priority,
    ) -> Result<u64> {
        self.shared.push(
            QueueOp::Put {
                key: key.into(),
                value: value.into(),
            },
            priority,
            ItemType::Simple,
            None,
            false,
        )
    }

    /// Enqueue any op with explicit options
    pub fn enqueue_with(&self, op: QueueOp, options: EnqueueOptions) -> Result<u64> {
        let item_type = options.item_type.unwrap_or(ItemType::Simple);
        self.shared.push(
            op,
            options.priority,
            item_type,
            options.session_id,
            options.batchable,
        )
    }

    pub fn enqueue_delete(&self, key: impl Into<String>, priority: Priority) -> Result<u64> {
        self.shared.push(
            QueueOp::Delete { key: key.into() },
            priority,
            ItemType::Simple,
            None,
            false,
        )
    }

    /// Enqueue a chunk write, batchable with other writes of the session
    pub fn enqueue_chunk(
        &self,
        session_id: &SessionId,
        key: impl Into<String>,
        value: impl Into<Bytes>,
    ) -> Result<u64> {
        self.shared.push(
            QueueOp::Put {
                key: key.into(),
                value: value.into(),
            },
            Priority::Normal,
            ItemType::Chunk,
            Some(session_id.clone()),
            true,
        )
    }

    /// Enqueue posting-list document writes as one atomic unit
    pub fn enqueue_index(&self, ops: Vec<KvOp>) -> Result<u64> {
        self.shared.push(
            single_or_transaction(ops),
            Priority::Normal,
            ItemType::Index,
            None,
            false,
        )
    }

    /// Enqueue CAS blob/record writes as one atomic unit
    pub fn enqueue_cas(&self, ops: Vec<KvOp>, priority: Priority) -> Result<u64> {
        self.shared.push(
            single_or_transaction(ops),
            priority,
            ItemType::CaStorage,
            None,
            false,
        )
    }

    /// Enqueue a pre-assembled atomic unit
    pub fn enqueue_transaction(&self, ops: Vec<KvOp>, options: EnqueueOptions) -> Result<u64> {
        self.enqueue_with(QueueOp::Transaction(ops), options)
    }

    /// Enqueue low-priority maintenance work
    pub fn enqueue_cleanup(&self, task: Arc<dyn MaintenanceTask>) -> Result<u64> {
        self.shared.push(
            QueueOp::Maintenance(task),
            Priority::Low,
            ItemType::Cleanup,
            None,
            false,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> QueueStats {
        let (critical, normal, low) = {
            let state = self.shared.state.lock();
            (
                state.tiers[0].len(),
                state.tiers[1].len(),
                state.tiers[2].len(),
            )
        };
        let c = &self.shared.counters;
        QueueStats {
            pending_critical: critical,
            pending_normal: normal,
            pending_low: low,
            processing: c.processing.load(Ordering::Relaxed),
            enqueued: c.enqueued.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            transactions: c.transactions.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Wait until every item enqueued before this call has committed,
    /// failed permanently or been dropped
    pub async fn flush(&self) {
        let target = self.shared.next_seq.load(Ordering::SeqCst);
        loop {
            let notified = self.shared.resolved.notified();
            if self.shared.is_resolved_below(target) {
                return;
            }
            notified.await;
        }
    }

    /// Flush, stop accepting work, flush again, then stop the worker
    pub async fn shutdown(&self) {
        self.flush().await;
        self.shared.state.lock().closed = true;
        // Maintenance items may have enqueued follow-up writes
        self.flush().await;
        self.shared.state.lock().stopping = true;
        self.shared.wake.notify_one();

        let handle = self.shared.worker.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!("Persistence queue worker failed: {}", e);
        }
        info!("Persistence queue shut down");
    }

    /// Newest pending value of `key`, if an unresolved write exists
    pub(crate) fn overlay_get(&self, key: &str) -> Option<OverlayValue> {
        self.shared
            .state
            .lock()
            .overlay
            .get(key)
            .and_then(|p| p.visible.clone())
    }

    pub(crate) fn commit_generation(&self) -> u64 {
        self.shared.commit_generation.load(Ordering::SeqCst)
    }

    /// Cache a backend read unless a commit happened since `generation`
    pub(crate) fn fill_cache(&self, generation: u64, key: &str, value: Bytes) {
        let state = self.shared.state.lock();
        if self.shared.commit_generation.load(Ordering::SeqCst) == generation
            && !state.overlay.contains_key(key)
        {
            self.shared.cache.set(key, value, None);
        }
    }
}

fn single_or_transaction(mut ops: Vec<KvOp>) -> QueueOp {
    if ops.len() == 1
        && let Some(op) = ops.pop()
    {
        return match op {
            KvOp::Put { key, value } => QueueOp::Put { key, value },
            KvOp::Delete { key } => QueueOp::Delete { key },
        };
    }
    QueueOp::Transaction(ops)
}

#[cfg(test)]
mod tests;
