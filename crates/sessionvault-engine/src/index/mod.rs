//! Inverted index manager
//!
//! Seven posting lists (topic, month bucket, tag, word, category,
//! sub-category, status) held in memory and persisted one JSON document per
//! list, plus an `index/meta` document. Searches are answered from memory
//! by posting-list lookups; writes go through the persistence queue.
//!
//! Every update computes the affected documents and enqueues them while
//! holding the index write lock, so documents reach the queue in the order
//! they were computed.

mod postings;
mod query;
mod tokenize;

pub use postings::{IndexKind, PostingList, PostingLists, posting_keys};
pub use query::{Combinator, DateRange, SearchQuery};
pub use tokenize::Tokenizer;

use crate::access::{ReadThrough, encode_json};
use crate::keys;
use crate::maintenance::CancelFlag;
use crate::queue::{MaintenanceTask, PersistenceQueue};
use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use sessionvault_common::config::IndexConfig;
use sessionvault_common::{Result, SessionId, SessionMetadata};
use sessionvault_kv::KvOp;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Bumped whenever the persisted document layout changes
pub const SCHEMA_VERSION: u32 = 1;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Persisted index bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub last_built: Option<DateTime<Utc>>,
    pub last_optimized: Option<DateTime<Utc>>,
    pub schema_version: u32,
    pub session_count: u64,
}

impl Default for IndexMetadata {
    fn default() -> Self {
        Self {
            last_built: None,
            last_optimized: None,
            schema_version: SCHEMA_VERSION,
            session_count: 0,
        }
    }
}

/// A posting that disagrees with stored metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostingIssue {
    pub kind: IndexKind,
    pub key: String,
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub sessions_checked: usize,
    /// Postings that reference a session with no metadata
    pub orphans: Vec<PostingIssue>,
    /// Postings the metadata implies but the index lacks
    pub gaps: Vec<PostingIssue>,
    /// Postings of a live session under a key its metadata no longer implies
    pub stale: Vec<PostingIssue>,
    /// An automatic rebuild was performed
    pub rebuilt: bool,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.orphans.is_empty() && self.gaps.is_empty() && self.stale.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeReport {
    pub lists_rewritten: usize,
    pub empty_keys_removed: usize,
    pub cancelled: bool,
}

/// Why the index was rebuilt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildReason {
    Requested,
    Missing,
    Unreadable(String),
    SchemaMismatch { found: u32 },
    IntegrityFailure {
        orphans: usize,
        gaps: usize,
        stale: usize,
    },
    OrphanInSearch(SessionId),
}

/// Integrity and rebuild notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexEvent {
    IntegrityChecked {
        orphans: usize,
        gaps: usize,
        stale: usize,
    },
    CorruptionDetected { reason: RebuildReason },
    Rebuilt { sessions: usize, reason: RebuildReason },
    Optimized(OptimizeReport),
}

/// Per-list entry counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub keys: BTreeMap<IndexKind, usize>,
    pub postings: usize,
    pub sessions: usize,
}

/// Outcome of loading persisted documents
pub enum LoadState {
    Loaded,
    /// Documents are missing or unusable; caller should rebuild
    NeedsRebuild(RebuildReason),
}

struct IndexState {
    lists: PostingLists,
    meta: IndexMetadata,
}

/// In-memory edits of one update, replayed backwards if its commit fails
#[derive(Default)]
struct Undo {
    /// `(kind, key, session, added)`
    postings: Vec<(IndexKind, String, SessionId, bool)>,
    session_count: Option<u64>,
}

impl Undo {
    fn revert(self, state: &mut IndexState) {
        for (kind, key, id, added) in self.postings.into_iter().rev() {
            if added {
                state.lists.remove_posting(kind, &key, &id);
            } else {
                state.lists.add_posting(kind, &key, &id);
            }
        }
        if let Some(count) = self.session_count {
            state.meta.session_count = count;
        }
    }
}

pub struct IndexManager {
    reader: ReadThrough,
    tokenizer: Tokenizer,
    config: IndexConfig,
    state: RwLock<IndexState>,
    events: broadcast::Sender<IndexEvent>,
}

impl IndexManager {
    /// Load persisted documents; reports when a rebuild is needed
    pub fn open(reader: ReadThrough, config: IndexConfig) -> (Self, LoadState) {
        let tokenizer = Tokenizer::new(&config.extra_stop_words);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let manager = Self {
            reader,
            tokenizer,
            config,
            state: RwLock::new(IndexState {
                lists: PostingLists::default(),
                meta: IndexMetadata::default(),
            }),
            events,
        };
        let load = match manager.load() {
            Ok(load) => load,
            Err(e) => {
                warn!("Index documents unreadable, rebuild required: {}", e);
                LoadState::NeedsRebuild(RebuildReason::Unreadable(e.to_string()))
            }
        };
        if let LoadState::NeedsRebuild(reason) = &load {
            manager.emit(IndexEvent::CorruptionDetected {
                reason: reason.clone(),
            });
        }
        (manager, load)
    }

    fn load(&self) -> Result<LoadState> {
        let Some(meta) = self.reader.get_json::<IndexMetadata>(keys::INDEX_META)? else {
            return Ok(LoadState::NeedsRebuild(RebuildReason::Missing));
        };
        if meta.schema_version != SCHEMA_VERSION {
            return Ok(LoadState::NeedsRebuild(RebuildReason::SchemaMismatch {
                found: meta.schema_version,
            }));
        }

        let mut lists = PostingLists::default();
        for kind in IndexKind::ALL {
            let doc: Option<PostingList> =
                self.reader.get_json(&keys::posting_list(kind.as_str()))?;
            lists.set_list(kind, doc.unwrap_or_default());
        }
        info!(
            "Loaded index: {} sessions, {} postings",
            meta.session_count,
            lists.posting_count()
        );
        *self.state.write() = IndexState { lists, meta };
        Ok(LoadState::Loaded)
    }

    fn emit(&self, event: IndexEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    pub const fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    fn queue(&self) -> &PersistenceQueue {
        self.reader.queue()
    }

    fn document_op(state: &IndexState, kind: IndexKind) -> Result<KvOp> {
        Ok(KvOp::put(
            keys::posting_list(kind.as_str()),
            encode_json(state.lists.list(kind))?,
        ))
    }

    fn meta_op(state: &IndexState) -> Result<KvOp> {
        Ok(KvOp::put(keys::INDEX_META, encode_json(&state.meta)?))
    }

    fn all_documents(state: &IndexState) -> Result<Vec<KvOp>> {
        let mut ops = IndexKind::ALL
            .into_iter()
            .map(|kind| Self::document_op(state, kind))
            .collect::<Result<Vec<_>>>()?;
        ops.push(Self::meta_op(state)?);
        Ok(ops)
    }

    /// Replace the whole index with one built from `sessions`
    pub fn build(&self, sessions: &[SessionMetadata], reason: RebuildReason) -> Result<()> {
        let lists = PostingLists::build(sessions, &self.tokenizer);
        let mut state = self.state.write();
        state.lists = lists;
        state.meta.last_built = Some(Utc::now());
        state.meta.schema_version = SCHEMA_VERSION;
        state.meta.session_count = sessions.len() as u64;
        let ops = Self::all_documents(&state)?;
        self.queue().enqueue_index(ops)?;
        drop(state);

        info!("Rebuilt index from {} sessions ({:?})", sessions.len(), reason);
        self.emit(IndexEvent::Rebuilt {
            sessions: sessions.len(),
            reason,
        });
        Ok(())
    }

    /// Wholesale rebuild on request
    pub fn rebuild(&self, sessions: &[SessionMetadata]) -> Result<()> {
        self.build(sessions, RebuildReason::Requested)
    }

    /// Apply a metadata change in memory and return the documents to
    /// persist, with the write lock still held by the returned guard
    ///
    /// Only lists whose keys differ between `previous` and `new` are
    /// touched, so edits that leave indexed fields alone write nothing.
    fn apply_change(
        &self,
        new: Option<&SessionMetadata>,
        previous: Option<&SessionMetadata>,
    ) -> Result<(RwLockWriteGuard<'_, IndexState>, Vec<KvOp>, Undo)> {
        let keyed = |meta: Option<&SessionMetadata>| -> BTreeMap<IndexKind, BTreeSet<String>> {
            meta.map(|m| posting_keys(m, &self.tokenizer).into_iter().collect())
                .unwrap_or_default()
        };
        let before = keyed(previous);
        let after = keyed(new);

        let mut state = self.state.write();
        let mut touched = BTreeSet::new();
        let mut undo = Undo::default();
        for kind in IndexKind::ALL {
            let old_keys = before.get(&kind);
            let new_keys = after.get(&kind);
            if let (Some(prev), Some(keys)) = (previous, old_keys) {
                // A changed id means every old posting goes
                let same_id = new.is_some_and(|m| m.id == prev.id);
                for key in keys {
                    let kept = same_id && new_keys.is_some_and(|n| n.contains(key));
                    if !kept && state.lists.remove_posting(kind, key, &prev.id) {
                        touched.insert(kind);
                        undo.postings.push((kind, key.clone(), prev.id.clone(), false));
                    }
                }
            }
            if let (Some(meta), Some(keys)) = (new, new_keys) {
                for key in keys {
                    if state.lists.add_posting(kind, key, &meta.id) {
                        touched.insert(kind);
                        undo.postings.push((kind, key.clone(), meta.id.clone(), true));
                    }
                }
            }
        }

        let count_delta: i64 = match (new.is_some(), previous.is_some()) {
            (true, false) => 1,
            (false, true) => -1,
            _ => 0,
        };
        if touched.is_empty() && count_delta == 0 {
            return Ok((state, Vec::new(), undo));
        }
        undo.session_count = Some(state.meta.session_count);
        state.meta.session_count = state.meta.session_count.saturating_add_signed(count_delta);

        let ops = touched
            .into_iter()
            .map(|kind| Self::document_op(&state, kind))
            .chain(std::iter::once(Self::meta_op(&state)))
            .collect::<Result<Vec<_>>>();
        match ops {
            Ok(ops) => Ok((state, ops, undo)),
            Err(e) => {
                undo.revert(&mut state);
                Err(e)
            }
        }
    }

    /// Incremental update: move a session from the postings implied by
    /// `previous` to those implied by `new`. `new = None` removes it.
    pub fn update(
        &self,
        new: Option<&SessionMetadata>,
        previous: Option<&SessionMetadata>,
    ) -> Result<()> {
        self.update_with(new, previous, |ops| {
            if !ops.is_empty() {
                self.queue().enqueue_index(ops)?;
            }
            Ok(())
        })
    }

    /// Like [`update`](Self::update) but hands the documents to `commit`,
    /// e.g. to include them in a larger atomic unit. `commit` runs with
    /// the index locked and receives an empty list when nothing changed.
    /// If `commit` fails the in-memory postings are restored.
    pub fn update_with<F>(
        &self,
        new: Option<&SessionMetadata>,
        previous: Option<&SessionMetadata>,
        commit: F,
    ) -> Result<()>
    where
        F: FnOnce(Vec<KvOp>) -> Result<()>,
    {
        if new.is_none() && previous.is_none() {
            return Ok(());
        }
        let (mut guard, ops, undo) = self.apply_change(new, previous)?;
        debug!("Index update writes {} documents", ops.len());
        if let Err(e) = commit(ops) {
            undo.revert(&mut guard);
            debug!("Index update rolled back: {}", e);
            return Err(e);
        }
        Ok(())
    }

    /// Session ids matching `query`
    pub fn search(&self, query: &SearchQuery) -> BTreeSet<SessionId> {
        self.state.read().lists.search(query, &self.tokenizer)
    }

    /// Compare every posting against stored metadata
    ///
    /// With `auto_rebuild` on, an unhealthy index is rebuilt from
    /// `sessions` before returning.
    pub fn verify_integrity(&self, sessions: &[SessionMetadata]) -> Result<IntegrityReport> {
        let mut report = IntegrityReport {
            sessions_checked: sessions.len(),
            ..Default::default()
        };
        {
            let state = self.state.read();
            let mut implied: BTreeMap<(&SessionId, IndexKind), BTreeSet<String>> =
                BTreeMap::new();
            for meta in sessions {
                for (kind, expected) in posting_keys(meta, &self.tokenizer) {
                    implied.insert((&meta.id, kind), expected);
                }
            }

            for kind in IndexKind::ALL {
                for (key, ids) in state.lists.list(kind) {
                    for id in ids {
                        let issue = || PostingIssue {
                            kind,
                            key: key.clone(),
                            session_id: id.clone(),
                        };
                        match implied.get(&(id, kind)) {
                            None => report.orphans.push(issue()),
                            Some(expected) if !expected.contains(key) => {
                                report.stale.push(issue());
                            }
                            Some(_) => {}
                        }
                    }
                }
            }

            for ((id, kind), expected) in implied {
                let list = state.lists.list(kind);
                for key in expected {
                    let present = list.get(&key).is_some_and(|ids| ids.contains(id));
                    if !present {
                        report.gaps.push(PostingIssue {
                            kind,
                            key,
                            session_id: id.clone(),
                        });
                    }
                }
            }
        }

        self.emit(IndexEvent::IntegrityChecked {
            orphans: report.orphans.len(),
            gaps: report.gaps.len(),
            stale: report.stale.len(),
        });

        if !report.is_healthy() {
            warn!(
                "Index integrity check failed: {} orphan postings, {} gaps, {} stale",
                report.orphans.len(),
                report.gaps.len(),
                report.stale.len()
            );
            let reason = RebuildReason::IntegrityFailure {
                orphans: report.orphans.len(),
                gaps: report.gaps.len(),
                stale: report.stale.len(),
            };
            self.emit(IndexEvent::CorruptionDetected {
                reason: reason.clone(),
            });
            if self.config.auto_rebuild {
                self.build(sessions, reason)?;
                report.rebuilt = true;
            }
        }
        Ok(report)
    }

    /// Compact documents without changing search results
    ///
    /// Drops empty keys and rewrites each list's document (loaded
    /// documents with duplicate ids are deduplicated on rewrite). Checks
    /// `cancel` between lists.
    pub fn optimize(&self, cancel: &CancelFlag) -> Result<OptimizeReport> {
        let mut report = OptimizeReport::default();
        for kind in IndexKind::ALL {
            if cancel.is_cancelled() {
                report.cancelled = true;
                info!("Index optimization cancelled after {} lists", report.lists_rewritten);
                break;
            }
            let mut state = self.state.write();
            report.empty_keys_removed += state.lists.prune_empty(kind);
            let op = Self::document_op(&state, kind)?;
            self.queue().enqueue_index(vec![op])?;
            report.lists_rewritten += 1;
        }

        if !report.cancelled {
            let mut state = self.state.write();
            state.meta.last_optimized = Some(Utc::now());
            let op = Self::meta_op(&state)?;
            self.queue().enqueue_index(vec![op])?;
        }
        info!(
            "Index optimized: {} lists rewritten, {} empty keys removed",
            report.lists_rewritten, report.empty_keys_removed
        );
        self.emit(IndexEvent::Optimized(report));
        Ok(report)
    }

    pub fn metadata(&self) -> IndexMetadata {
        self.state.read().meta.clone()
    }

    pub fn stats(&self) -> IndexStats {
        let state = self.state.read();
        IndexStats {
            keys: IndexKind::ALL
                .into_iter()
                .map(|k| (k, state.lists.list(k).len()))
                .collect(),
            postings: state.lists.posting_count(),
            sessions: state.lists.all_sessions().len(),
        }
    }

    /// Record that a search hit an id with no metadata
    pub(crate) fn report_orphan(&self, id: &SessionId) -> RebuildReason {
        let reason = RebuildReason::OrphanInSearch(id.clone());
        warn!("Search resolved session {} with no metadata", id);
        self.emit(IndexEvent::CorruptionDetected {
            reason: reason.clone(),
        });
        reason
    }
}

/// Index optimization as a low-priority queue item
pub struct OptimizeTask {
    index: Arc<IndexManager>,
    cancel: CancelFlag,
}

impl OptimizeTask {
    pub const fn new(index: Arc<IndexManager>, cancel: CancelFlag) -> Self {
        Self { index, cancel }
    }
}

impl MaintenanceTask for OptimizeTask {
    fn name(&self) -> &str {
        "index-optimize"
    }

    fn run(&self) -> Result<()> {
        self.index.optimize(&self.cancel).map(|_| ())
    }
}
