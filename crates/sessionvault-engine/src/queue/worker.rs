//! Queue worker: scheduling, batching, commit and retry

use super::events::{QueueCounters, QueueEvent};
use super::item::{Priority, QueueItem, QueueOp};
use super::{QueueShared, QueueState};
use sessionvault_common::{Error, Result, SessionId};
use sessionvault_kv::KvOp;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Upper bound on items drained into one normal-priority batch
const MAX_BATCH_ITEMS: usize = 512;

enum Dispatch {
    /// Committed as one group: a critical item with the writes it carries,
    /// or one low item
    Unit(Vec<QueueItem>),
    Batch(Vec<QueueItem>),
    Wait(Option<Instant>),
    Stop,
}

fn earliest(a: Option<Instant>, b: Instant) -> Option<Instant> {
    Some(a.map_or(b, |a| a.min(b)))
}

/// Take the normal-tier writes of `item`'s session that were enqueued
/// before it. A critical metadata write must not land ahead of the chunk
/// writes it points at, so they commit in its transaction.
fn take_session_writes(state: &mut QueueState, item: &QueueItem) -> Vec<QueueItem> {
    let Some(session) = item.session_id.as_ref() else {
        return Vec::new();
    };
    let carried = |n: &QueueItem| n.seq < item.seq && n.session_id.as_ref() == Some(session);
    let normal = &mut state.tiers[Priority::Normal.tier()];
    if !normal.iter().any(carried) {
        return Vec::new();
    }
    let (taken, kept): (Vec<QueueItem>, Vec<QueueItem>) = normal.drain(..).partition(carried);
    normal.extend(kept);
    taken
}

impl QueueShared {
    fn next_dispatch(&self, now: Instant) -> Dispatch {
        let mut state = self.state.lock();
        let mut wake_at = None;

        for tier in 0..3 {
            if let Some(until) = state.paused_until[tier] {
                if now >= until {
                    state.paused_until[tier] = None;
                } else if !state.tiers[tier].is_empty() {
                    wake_at = earliest(wake_at, until);
                }
            }
        }

        let critical = Priority::Critical.tier();
        if state.paused_until[critical].is_none()
            && let Some(item) = state.tiers[critical].pop_front()
        {
            state.last_busy = now;
            let mut unit = take_session_writes(&mut state, &item);
            if !unit.is_empty() {
                debug!(
                    "Critical seq={} carries {} pending writes of its session",
                    item.seq,
                    unit.len()
                );
            }
            unit.push(item);
            return Dispatch::Unit(unit);
        }

        let normal = Priority::Normal.tier();
        if state.paused_until[normal].is_none()
            && let Some(front) = state.tiers[normal].front()
        {
            let window_end = front.enqueued_at + self.config.batch_window();
            if now >= window_end || state.stopping {
                let take = state.tiers[normal].len().min(MAX_BATCH_ITEMS);
                let batch: Vec<QueueItem> = state.tiers[normal].drain(..take).collect();
                state.last_busy = now;
                return Dispatch::Batch(batch);
            }
            wake_at = earliest(wake_at, window_end);
        }

        let low = Priority::Low.tier();
        if state.paused_until[low].is_none()
            && !state.tiers[low].is_empty()
            && state.tiers[critical].is_empty()
            && state.tiers[normal].is_empty()
        {
            let idle_at = state.last_busy + self.config.idle_poll();
            if now >= idle_at || state.stopping {
                if let Some(item) = state.tiers[low].pop_front() {
                    return Dispatch::Unit(vec![item]);
                }
            } else {
                wake_at = earliest(wake_at, idle_at);
            }
        }

        if state.stopping && state.pending() == 0 {
            return Dispatch::Stop;
        }
        Dispatch::Wait(wake_at)
    }

    /// Split a normal batch into commit groups
    ///
    /// Batchable items of one session form one group, placed where the
    /// session's first item was; every other item is its own group.
    pub(super) fn group_batch(items: Vec<QueueItem>) -> Vec<Vec<QueueItem>> {
        let mut groups: Vec<Vec<QueueItem>> = Vec::new();
        let mut by_session: Vec<(SessionId, usize)> = Vec::new();
        for item in items {
            let slot = item.batch_key().and_then(|sid| {
                by_session
                    .iter()
                    .find(|(s, _)| s == sid)
                    .map(|(_, idx)| *idx)
            });
            match slot {
                Some(idx) => groups[idx].push(item),
                None => {
                    if let Some(sid) = item.batch_key() {
                        by_session.push((sid.clone(), groups.len()));
                    }
                    groups.push(vec![item]);
                }
            }
        }
        groups
    }

    /// Backend ops for a group, skipping keys a newer item already committed
    fn prepare_ops(&self, group: &[QueueItem]) -> Vec<(u64, KvOp)> {
        let state = self.state.lock();
        let mut ops = Vec::new();
        for item in group {
            for op in item.op.kv_ops() {
                let stale = state
                    .overlay
                    .get(op.key())
                    .is_some_and(|p| p.committed_seq > item.seq);
                if stale {
                    debug!("Skipping superseded write seq={} {}", item.seq, op.key());
                } else {
                    ops.push((item.seq, op));
                }
            }
        }
        ops
    }

    fn finish_success(&self, group: &[QueueItem], ops: &[(u64, KvOp)]) {
        {
            let mut state = self.state.lock();
            for (seq, op) in ops {
                if let Some(pending) = state.overlay.get_mut(op.key()) {
                    pending.committed_seq = pending.committed_seq.max(*seq);
                }
                self.cache.invalidate(op.key());
            }
            if !ops.is_empty() {
                self.commit_generation.fetch_add(1, Ordering::SeqCst);
            }
            for item in group {
                state.resolve(item, false);
            }
            if group.iter().any(|i| i.priority != Priority::Low) {
                state.last_busy = Instant::now();
            }
        }

        if !ops.is_empty() {
            QueueCounters::bump(&self.counters.transactions);
        }
        for item in group {
            QueueCounters::bump(&self.counters.completed);
            debug!("Completed seq={} {}", item.seq, item.info().label);
            self.emit(QueueEvent::Completed(item.info()));
        }
        self.resolved.notify_waiters();
    }

    /// Handle a failed group; returns the items to retry
    ///
    /// A group shares one fate: it is retried while any member has retry
    /// budget left, and abandoned as a whole otherwise.
    fn finish_failure(&self, group: Vec<QueueItem>, err: &Error) -> Vec<QueueItem> {
        let exhausted = group
            .iter()
            .all(|i| i.retry_count >= i.priority.max_retries(&self.config));
        let permanent = !err.is_retryable() || exhausted;
        let mut retry = Vec::new();
        let mut abandoned = Vec::new();
        for mut item in group {
            self.emit(QueueEvent::Failed {
                item: item.info(),
                permanent,
                error: err.to_string(),
            });
            if permanent {
                error!(
                    "Failed to persist seq={} ({}) after {} retries: {}",
                    item.seq,
                    item.info().label,
                    item.retry_count,
                    err
                );
                QueueCounters::bump(&self.counters.failed);
                abandoned.push(item);
            } else {
                item.retry_count += 1;
                let delay = self.config.backoff(item.retry_count);
                warn!(
                    "Retrying seq={} ({}) attempt {} in {:?}: {}",
                    item.seq,
                    item.info().label,
                    item.retry_count,
                    delay,
                    err
                );
                QueueCounters::bump(&self.counters.retried);
                self.emit(QueueEvent::Retry {
                    item: item.info(),
                    attempt: item.retry_count,
                    delay,
                });
                retry.push(item);
            }
        }

        if !abandoned.is_empty() {
            let mut state = self.state.lock();
            for item in &abandoned {
                state.resolve(item, true);
            }
            drop(state);
            self.resolved.notify_waiters();
        }
        retry
    }

    /// Put items back at the head of their tier, oldest first, and pause
    /// every tier they came from until the backoff for `attempt` elapses
    fn requeue_front(&self, mut items: Vec<QueueItem>, attempt: u32) {
        if items.is_empty() {
            return;
        }
        items.sort_by_key(|i| i.seq);
        let until = Instant::now() + self.config.backoff(attempt);
        let mut state = self.state.lock();
        for item in items.into_iter().rev() {
            let tier = item.priority.tier();
            state.tiers[tier].push_front(item);
            let slot = &mut state.paused_until[tier];
            *slot = Some(slot.map_or(until, |u| u.max(until)));
        }
        drop(state);
        self.wake.notify_one();
    }
}

/// Commit one group; returns the items that should be retried
async fn commit_group(shared: &Arc<QueueShared>, group: Vec<QueueItem>) -> Vec<QueueItem> {
    let count = group.len() as u64;
    shared.counters.processing.fetch_add(count, Ordering::Relaxed);
    for item in &group {
        shared.emit(QueueEvent::Processing(item.info()));
    }

    let maintenance = match group.as_slice() {
        [item] => match &item.op {
            QueueOp::Maintenance(task) => Some(Arc::clone(task)),
            _ => None,
        },
        _ => None,
    };

    let (result, ops) = if let Some(task) = maintenance {
        debug!("Running maintenance task {}", task.name());
        let result = tokio::task::spawn_blocking(move || task.run())
            .await
            .unwrap_or_else(|e| Err(Error::internal(format!("maintenance task panicked: {e}"))));
        (result, Vec::new())
    } else {
        let ops = shared.prepare_ops(&group);
        let result = if ops.is_empty() {
            Ok(())
        } else {
            let backend = Arc::clone(&shared.backend);
            let batch: Vec<KvOp> = ops.iter().map(|(_, op)| op.clone()).collect();
            tokio::task::spawn_blocking(move || apply_ops(backend.as_ref(), &batch))
                .await
                .unwrap_or_else(|e| Err(Error::internal(format!("backend commit panicked: {e}"))))
        };
        (result, ops)
    };

    shared.counters.processing.fetch_sub(count, Ordering::Relaxed);
    match result {
        Ok(()) => {
            if group.len() > 1 {
                debug!("Committed batch of {} items in one transaction", group.len());
            }
            shared.finish_success(&group, &ops);
            Vec::new()
        }
        Err(e) => shared.finish_failure(group, &e),
    }
}

fn apply_ops(backend: &dyn sessionvault_kv::KvBackend, ops: &[KvOp]) -> Result<()> {
    match ops {
        [KvOp::Put { key, value }] => backend.set(key, value)?,
        [KvOp::Delete { key }] => backend.delete(key)?,
        _ => backend.apply(ops)?,
    }
    Ok(())
}

fn max_attempt(items: &[QueueItem]) -> u32 {
    items.iter().map(|i| i.retry_count).max().unwrap_or(1)
}

async fn process_unit(shared: &Arc<QueueShared>, items: Vec<QueueItem>) {
    let retry = commit_group(shared, items).await;
    let attempt = max_attempt(&retry);
    shared.requeue_front(retry, attempt);
}

async fn process_batch(shared: &Arc<QueueShared>, items: Vec<QueueItem>) {
    let mut groups = QueueShared::group_batch(items).into_iter();
    while let Some(group) = groups.next() {
        let retry = commit_group(shared, group).await;
        if !retry.is_empty() {
            // Keep tier order: the failed group and everything after it go
            // back to the head, and the tier waits out the backoff.
            let attempt = max_attempt(&retry);
            let mut rest: Vec<QueueItem> = groups.flatten().collect();
            rest.extend(retry);
            shared.requeue_front(rest, attempt);
            return;
        }
    }
}

/// Worker loop; exits once the queue is stopping and drained
pub(crate) async fn run(shared: Arc<QueueShared>) {
    debug!("Persistence queue worker running");
    loop {
        let wake = shared.wake.notified();
        match shared.next_dispatch(Instant::now()) {
            Dispatch::Unit(items) => process_unit(&shared, items).await,
            Dispatch::Batch(items) => process_batch(&shared, items).await,
            Dispatch::Wait(Some(deadline)) => {
                tokio::select! {
                    () = wake => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
            Dispatch::Wait(None) => wake.await,
            Dispatch::Stop => break,
        }
    }
    info!("Persistence queue worker stopped");
}
