//! Chunked Session Storage
//!
//! Splits each session into a small metadata document and append-only
//! chunks of attachment descriptors, with attachment bytes held in the
//! content-addressable store. Combines the cache, CAS, index and
//! persistence queue behind one interface.
//!
//! Reads go through [`ReadThrough`], so a write is visible as soon as it is
//! enqueued. Mutations of one session are serialized by a per-session
//! lock; lock order is session, session registry, CAS hashes, CAS orphan
//! list, index.

use crate::access::{ReadThrough, encode_bincode, encode_json};
use crate::cache::{CacheSnapshot, LruCache};
use crate::cas::{CasStats, ContentStore, GcReport, GcTask};
use crate::index::{
    IndexEvent, IndexManager, IndexStats, IntegrityReport, LoadState, OptimizeReport,
    OptimizeTask, RebuildReason, SearchQuery,
};
use crate::keys;
use crate::maintenance::CancelFlag;
use crate::space::{SpaceSource, ensure_free};
use crate::queue::{
    EnqueueOptions, ItemType, PersistenceQueue, Priority, QueueEvent, QueueStats,
};
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use sessionvault_common::config::EngineConfig;
use sessionvault_common::{
    Attachment, AttachmentKind, Chunk, ChunkPointer, Error, NewAttachment, NewSession, Result,
    Session, SessionId, SessionMetadata, SessionStatus, SessionSummary,
};
use sessionvault_kv::{KvBackend, KvOp};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Engine-wide statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub sessions: usize,
    pub queue: QueueStats,
    pub cache: CacheSnapshot,
    pub cas: CasStats,
    pub index: IndexStats,
}

pub struct ChunkedSessionStorage {
    /// Engine configuration
    config: EngineConfig,
    /// Shared read cache
    cache: Arc<LruCache>,
    /// Write path
    queue: PersistenceQueue,
    /// Overlay, cache and backend read path
    reader: ReadThrough,
    /// Attachment bytes
    cas: Arc<ContentStore>,
    /// Posting lists
    index: Arc<IndexManager>,
    /// Per-session mutation locks
    session_locks: DashMap<SessionId, Arc<Mutex<()>>>,
    /// Guards read-modify-write of the session registry
    registry_lock: Mutex<()>,
    /// Shared by scheduled GC and optimize runs
    maintenance_cancel: CancelFlag,
    /// Free-space source for write preflight; unchecked when absent
    space: Option<Arc<dyn SpaceSource>>,
}

impl ChunkedSessionStorage {
    /// Open the engine over `backend`
    ///
    /// Must be called inside a tokio runtime; the persistence queue spawns
    /// its worker on it. An unusable index is rebuilt from metadata.
    pub fn open(backend: Arc<dyn KvBackend>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(LruCache::new(&config.cache));
        let queue = PersistenceQueue::start(
            config.queue.clone(),
            Arc::clone(&backend),
            Arc::clone(&cache),
        )?;
        let reader = ReadThrough::new(backend, Arc::clone(&cache), queue.clone());
        let cas = Arc::new(ContentStore::new(reader.clone(), config.cas.clone()));
        let (index, load) = IndexManager::open(reader.clone(), config.index.clone());

        let storage = Self {
            config,
            cache,
            queue,
            reader,
            cas,
            index: Arc::new(index),
            session_locks: DashMap::new(),
            registry_lock: Mutex::new(()),
            maintenance_cancel: CancelFlag::new(),
            space: None,
        };

        if let LoadState::NeedsRebuild(reason) = load {
            let sessions = storage.list_metadata()?;
            if sessions.is_empty() && reason == RebuildReason::Missing {
                debug!("No index documents and no sessions; nothing to rebuild");
            } else {
                storage.index.build(&sessions, reason)?;
            }
        }

        info!(
            "Session storage opened: {} sessions, chunk size {}",
            storage.session_count()?,
            storage.config.storage.chunk_size
        );
        Ok(storage)
    }

    /// Check free space before writes that add bytes
    #[must_use]
    pub fn with_space_source(mut self, source: Arc<dyn SpaceSource>) -> Self {
        self.space = Some(source);
        self
    }

    fn ensure_space(&self, required: u64) -> Result<()> {
        match &self.space {
            Some(source) => {
                ensure_free(source.as_ref(), required, self.config.storage.min_free_bytes)
            }
            None => Ok(()),
        }
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub const fn queue(&self) -> &PersistenceQueue {
        &self.queue
    }

    pub fn cache(&self) -> &LruCache {
        &self.cache
    }

    pub fn cas(&self) -> &ContentStore {
        &self.cas
    }

    pub fn index(&self) -> &IndexManager {
        &self.index
    }

    fn session_lock(&self, id: &SessionId) -> Arc<Mutex<()>> {
        Arc::clone(self.session_locks.entry(id.clone()).or_default().value())
    }

    // --- listing -----------------------------------------------------------

    /// Ids from the session registry, in creation order
    pub fn session_ids(&self) -> Result<Vec<SessionId>> {
        Ok(self
            .reader
            .get_json::<Vec<SessionId>>(keys::SESSION_INDEX)?
            .unwrap_or_default())
    }

    /// Number of sessions, answered from the registry alone
    pub fn session_count(&self) -> Result<usize> {
        Ok(self.session_ids()?.len())
    }

    /// Metadata of one session, if it exists
    pub fn metadata(&self, id: &SessionId) -> Result<Option<SessionMetadata>> {
        self.reader.get_json(&keys::session_meta(id))
    }

    fn require_metadata(&self, id: &SessionId) -> Result<SessionMetadata> {
        self.metadata(id)?
            .ok_or_else(|| Error::session_not_found(id.as_str()))
    }

    /// Every session's metadata; never reads chunks
    pub fn list_metadata(&self) -> Result<Vec<SessionMetadata>> {
        let ids = self.session_ids()?;
        let mut sessions = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.metadata(id)? {
                Some(meta) => sessions.push(meta),
                None => warn!("Session {} is registered but has no metadata", id),
            }
        }
        Ok(sessions)
    }

    pub fn list_summaries(&self) -> Result<Vec<SessionSummary>> {
        Ok(self
            .list_metadata()?
            .iter()
            .map(SessionSummary::from)
            .collect())
    }

    // --- lifecycle ---------------------------------------------------------

    /// Register a new active session
    pub fn create_session(&self, new: NewSession) -> Result<SessionMetadata> {
        let meta = SessionMetadata::from_new(SessionId::new(), new, Utc::now());
        let encoded = encode_json(&meta)?;
        self.ensure_space(encoded.len() as u64)?;
        let lock = self.session_lock(&meta.id);
        let _session_guard = lock.lock();
        let _registry_guard = self.registry_lock.lock();

        let mut ids = self.session_ids()?;
        ids.push(meta.id.clone());
        let ops = vec![
            KvOp::put(keys::session_meta(&meta.id), encoded),
            KvOp::put(keys::SESSION_INDEX, encode_json(&ids)?),
        ];
        self.commit_with_index(&meta, None, ops, Priority::Normal)?;

        info!("Created session {} ({:?})", meta.id, meta.name);
        Ok(meta)
    }

    /// Persist edited metadata
    ///
    /// Chunk bookkeeping (pointers, counts, creation time) always comes from
    /// the stored copy so an edit cannot race an append. Saving metadata for
    /// an unknown id registers it.
    pub fn save_metadata(&self, id: &SessionId, mut metadata: SessionMetadata) -> Result<()> {
        if &metadata.id != id {
            return Err(Error::invalid_argument(format!(
                "metadata id {} does not match {}",
                metadata.id, id
            )));
        }
        let lock = self.session_lock(id);
        let _session_guard = lock.lock();

        let previous = self.metadata(id)?;
        if let Some(prev) = &previous {
            metadata.created_at = prev.created_at;
            metadata.image_count = prev.image_count;
            metadata.audio_count = prev.audio_count;
            metadata.image_chunk_count = prev.image_chunk_count;
            metadata.audio_chunk_count = prev.audio_chunk_count;
            metadata.chunks.clone_from(&prev.chunks);
        }
        metadata.updated_at = Utc::now();

        let mut ops = vec![KvOp::put(keys::session_meta(id), encode_json(&metadata)?)];
        let _registry_guard = if previous.is_none() {
            let guard = self.registry_lock.lock();
            let mut ids = self.session_ids()?;
            ids.push(id.clone());
            ops.push(KvOp::put(keys::SESSION_INDEX, encode_json(&ids)?));
            Some(guard)
        } else {
            None
        };
        self.commit_with_index(&metadata, previous.as_ref(), ops, Priority::Normal)
    }

    /// Change lifecycle status; committed at critical priority
    pub fn update_status(&self, id: &SessionId, status: SessionStatus) -> Result<SessionMetadata> {
        let lock = self.session_lock(id);
        let _session_guard = lock.lock();

        let previous = self.require_metadata(id)?;
        let mut meta = previous.clone();
        let now = Utc::now();
        meta.status = status;
        meta.updated_at = now;
        if matches!(status, SessionStatus::Completed | SessionStatus::Interrupted) {
            meta.ended_at.get_or_insert(now);
        }

        let ops = vec![KvOp::put(keys::session_meta(id), encode_json(&meta)?)];
        self.commit_with_index(&meta, Some(&previous), ops, Priority::Critical)?;
        info!("Session {} status {} -> {}", id, previous.status, status);
        Ok(meta)
    }

    /// Enqueue `ops` together with the index documents the change implies
    fn commit_with_index(
        &self,
        meta: &SessionMetadata,
        previous: Option<&SessionMetadata>,
        mut ops: Vec<KvOp>,
        priority: Priority,
    ) -> Result<()> {
        self.index.update_with(Some(meta), previous, |index_ops| {
            ops.extend(index_ops);
            self.queue.enqueue_transaction(
                ops,
                EnqueueOptions {
                    priority,
                    item_type: Some(ItemType::Simple),
                    session_id: Some(meta.id.clone()),
                    batchable: false,
                },
            )?;
            Ok(())
        })
    }

    // --- attachments -------------------------------------------------------

    /// Store attachment bytes and append the descriptor to the open chunk
    ///
    /// Reads only the metadata and the current open chunk. The chunk and
    /// metadata writes are one atomic unit, batchable with the session's
    /// other writes.
    pub fn append_attachment(
        &self,
        id: &SessionId,
        kind: AttachmentKind,
        item: NewAttachment,
    ) -> Result<Attachment> {
        self.ensure_space(item.bytes.len() as u64)?;
        let lock = self.session_lock(id);
        let _session_guard = lock.lock();

        let mut meta = self.require_metadata(id)?;
        let capacity = self.config.storage.chunk_size;

        let open_chunk = match meta.chunk_pointers(kind).last() {
            Some(pointer) => {
                let chunk: Chunk = self.reader.get_bincode(&pointer.key)?.ok_or_else(|| {
                    Error::corruption(format!("chunk {} referenced by {} is missing", pointer.key, id))
                })?;
                (!chunk.is_full()).then_some(chunk)
            }
            None => None,
        };
        let mut chunk = match open_chunk {
            Some(chunk) => chunk,
            None => {
                let index = meta.chunk_count(kind);
                meta.push_chunk(ChunkPointer {
                    kind,
                    index,
                    key: keys::chunk(id, kind, index),
                });
                debug!("Opening {} chunk {} for session {}", kind, index, id);
                Chunk::new(id.clone(), kind, index, capacity)
            }
        };

        let stored = self.cas.put_with(&item.bytes, Some(id))?;
        let now = Utc::now();
        let attachment = Attachment {
            id: Uuid::new_v4().to_string(),
            kind,
            hash: stored.hash,
            size_bytes: item.bytes.len() as u64,
            mime_type: item.mime_type,
            captured_at: item.captured_at.unwrap_or(now),
            duration_ms: item.duration_ms,
        };
        chunk.push(attachment.clone())?;
        meta.bump_item_count(kind);
        meta.updated_at = now;

        let chunk_key = keys::chunk(id, kind, chunk.index);
        self.queue.enqueue_transaction(
            vec![
                KvOp::put(chunk_key, encode_bincode(&chunk)?),
                KvOp::put(keys::session_meta(id), encode_json(&meta)?),
            ],
            EnqueueOptions {
                priority: Priority::Normal,
                item_type: Some(ItemType::Chunk),
                session_id: Some(id.clone()),
                batchable: true,
            },
        )?;
        Ok(attachment)
    }

    /// Bytes of a stored attachment
    pub fn load_attachment_bytes(&self, attachment: &Attachment) -> Result<Bytes> {
        self.cas.get(&attachment.hash)
    }

    /// Metadata plus every attachment, in chunk order
    pub fn load_full(&self, id: &SessionId) -> Result<Session> {
        let metadata = self.require_metadata(id)?;
        let mut images = Vec::with_capacity(metadata.image_count as usize);
        let mut audio = Vec::with_capacity(metadata.audio_count as usize);

        for kind in AttachmentKind::ALL {
            let target = match kind {
                AttachmentKind::Image => &mut images,
                AttachmentKind::Audio => &mut audio,
            };
            for pointer in metadata.chunk_pointers(kind) {
                let chunk: Chunk = self.reader.get_bincode(&pointer.key)?.ok_or_else(|| {
                    Error::corruption(format!("chunk {} referenced by {} is missing", pointer.key, id))
                })?;
                if &chunk.session_id != id || chunk.kind != kind || chunk.index != pointer.index {
                    return Err(Error::corruption(format!(
                        "chunk {} does not belong to {} at {}/{}",
                        pointer.key, id, kind, pointer.index
                    )));
                }
                target.extend(chunk.items);
            }
        }

        Ok(Session {
            metadata,
            images,
            audio,
        })
    }

    // --- deletion ----------------------------------------------------------

    /// Remove a session as one atomic unit
    ///
    /// Drops the registry entry, metadata and every chunk, releases one CAS
    /// reference per attachment and removes the session from all posting
    /// lists.
    pub fn delete_session(&self, id: &SessionId) -> Result<()> {
        let lock = self.session_lock(id);
        let result = {
            let _session_guard = lock.lock();
            self.delete_locked(id)
        };
        drop(lock);
        self.session_locks
            .remove_if(id, |_, l| Arc::strong_count(l) == 1);
        result
    }

    fn delete_locked(&self, id: &SessionId) -> Result<()> {
        let meta = self.require_metadata(id)?;

        let mut hashes = Vec::new();
        let mut ops = vec![KvOp::delete(keys::session_meta(id))];
        for pointer in &meta.chunks {
            match self.reader.get_bincode::<Chunk>(&pointer.key) {
                Ok(Some(chunk)) => hashes.extend(chunk.items.iter().map(|a| a.hash)),
                Ok(None) => warn!("Chunk {} already missing while deleting {}", pointer.key, id),
                Err(e) if e.is_corruption() => {
                    warn!("Unreadable chunk {} while deleting {}: {}", pointer.key, id, e);
                }
                Err(e) => return Err(e),
            }
            ops.push(KvOp::delete(pointer.key.clone()));
        }

        let _registry_guard = self.registry_lock.lock();
        let mut ids = self.session_ids()?;
        ids.retain(|s| s != id);
        ops.push(KvOp::put(keys::SESSION_INDEX, encode_json(&ids)?));

        let released = hashes.len();
        self.cas.release_many(&hashes, |cas_ops| {
            ops.extend(cas_ops);
            self.index.update_with(None, Some(&meta), |index_ops| {
                ops.extend(index_ops);
                self.queue.enqueue_transaction(
                    ops,
                    EnqueueOptions {
                        priority: Priority::Normal,
                        item_type: Some(ItemType::Simple),
                        session_id: Some(id.clone()),
                        batchable: false,
                    },
                )?;
                Ok(())
            })
        })?;

        info!(
            "Deleted session {} ({} chunks, {} attachment references released)",
            id,
            meta.chunks.len(),
            released
        );
        Ok(())
    }

    // --- search ------------------------------------------------------------

    /// Matching sessions, newest first, capped at `query.limit`
    ///
    /// A hit with no metadata means the index is stale: it is rebuilt and
    /// the query re-run once.
    pub fn search_sessions(&self, query: &SearchQuery) -> Result<Vec<SessionMetadata>> {
        let mut rebuilt = false;
        loop {
            let ids = self.index.search(query);
            let mut found = Vec::with_capacity(ids.len());
            let mut orphan = None;
            for id in &ids {
                match self.metadata(id)? {
                    Some(meta) => found.push(meta),
                    None => {
                        orphan = Some(id.clone());
                        break;
                    }
                }
            }

            if let Some(id) = orphan {
                let reason = self.index.report_orphan(&id);
                if rebuilt {
                    return Err(Error::corruption(format!(
                        "index still references missing session {id} after rebuild"
                    )));
                }
                let sessions = self.list_metadata()?;
                self.index.build(&sessions, reason)?;
                rebuilt = true;
                continue;
            }

            found.sort_by(|a, b| {
                b.started_at
                    .cmp(&a.started_at)
                    .then_with(|| a.id.cmp(&b.id))
            });
            if let Some(limit) = query.limit {
                found.truncate(limit);
            }
            return Ok(found);
        }
    }

    // --- maintenance -------------------------------------------------------

    /// Check the index against stored metadata
    pub fn verify_index(&self) -> Result<IntegrityReport> {
        let sessions = self.list_metadata()?;
        self.index.verify_integrity(&sessions)
    }

    /// Rebuild the index from stored metadata; returns sessions indexed
    pub fn rebuild_index(&self) -> Result<usize> {
        let sessions = self.list_metadata()?;
        self.index.rebuild(&sessions)?;
        Ok(sessions.len())
    }

    pub fn optimize_index(&self) -> Result<OptimizeReport> {
        self.index.optimize(&self.maintenance_cancel)
    }

    pub fn garbage_collect(&self) -> Result<GcReport> {
        self.cas.garbage_collect(&self.maintenance_cancel)
    }

    /// Queue GC and index optimization as low-priority cleanup
    pub fn schedule_maintenance(&self) -> Result<Vec<u64>> {
        self.maintenance_cancel.reset();
        let gc = GcTask::new(Arc::clone(&self.cas), self.maintenance_cancel.clone());
        let optimize = OptimizeTask::new(Arc::clone(&self.index), self.maintenance_cancel.clone());
        Ok(vec![
            self.queue.enqueue_cleanup(Arc::new(gc))?,
            self.queue.enqueue_cleanup(Arc::new(optimize))?,
        ])
    }

    /// Stop running maintenance at its next batch boundary
    pub fn cancel_maintenance(&self) {
        self.maintenance_cancel.cancel();
    }

    // --- observability -----------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue.subscribe()
    }

    pub fn subscribe_index(&self) -> broadcast::Receiver<IndexEvent> {
        self.index.subscribe()
    }

    pub fn stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            sessions: self.session_count()?,
            queue: self.queue.stats(),
            cache: self.cache.snapshot(),
            cas: self.cas.stats(),
            index: self.index.stats(),
        })
    }

    /// Wait for every write enqueued so far
    pub async fn flush(&self) {
        self.queue.flush().await;
    }

    /// Flush and stop the write path
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
        info!("Session storage shut down");
    }
}

#[cfg(test)]
mod tests;
