use super::*;
use crate::space::FixedSpace;
use chrono::TimeZone;
use sessionvault_common::config::{QueueConfig, StorageConfig};
use sessionvault_common::{ContentHash, Error};
use sessionvault_kv::MemoryBackend;
use std::collections::BTreeSet;

fn test_config() -> EngineConfig {
    EngineConfig {
        storage: StorageConfig {
            chunk_size: 10,
            ..StorageConfig::default()
        },
        queue: QueueConfig {
            batch_window_ms: 5,
            idle_poll_ms: 5,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            ..QueueConfig::default()
        },
        ..EngineConfig::default()
    }
}

fn open(backend: &MemoryBackend) -> ChunkedSessionStorage {
    ChunkedSessionStorage::open(Arc::new(backend.clone()), test_config()).unwrap()
}

fn image(n: u32) -> NewAttachment {
    NewAttachment {
        bytes: format!("frame-{n}").into_bytes(),
        mime_type: Some("image/png".into()),
        ..Default::default()
    }
}

fn tagged(name: &str, tag: &str) -> NewSession {
    NewSession::named(name).with_tags([tag])
}

#[tokio::test]
async fn test_create_and_list() {
    let backend = MemoryBackend::new();
    let storage = open(&backend);
    let a = storage.create_session(tagged("Morning review", "review")).unwrap();
    let b = storage.create_session(tagged("Evening review", "review")).unwrap();

    assert_eq!(storage.session_ids().unwrap(), vec![a.id.clone(), b.id.clone()]);
    assert_eq!(storage.session_count().unwrap(), 2);
    let summaries = storage.list_summaries().unwrap();
    assert_eq!(summaries[0].name, "Morning review");
    assert_eq!(summaries[1].status, SessionStatus::Active);

    storage.flush().await;
    assert!(backend.contains(&keys::session_meta(&a.id)));
    assert!(backend.contains(keys::SESSION_INDEX));
}

#[tokio::test]
async fn test_listing_never_reads_chunks() {
    let backend = MemoryBackend::new();
    let storage = open(&backend);
    let s = storage.create_session(NewSession::named("Listing")).unwrap();
    for n in 0..15 {
        storage.append_attachment(&s.id, AttachmentKind::Image, image(n)).unwrap();
    }
    storage.flush().await;
    storage.cache().clear();
    backend.clear_read_log();

    let listed = storage.list_metadata().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].image_count, 15);
    assert!(backend.reads_with_prefix(keys::SESSION_CHUNK_PREFIX).is_empty());
    assert!(backend.reads_with_prefix(keys::CAS_BLOB_PREFIX).is_empty());
}

#[tokio::test]
async fn test_append_rolls_over_chunks() {
    let backend = MemoryBackend::new();
    let storage = open(&backend);
    let s = storage.create_session(NewSession::named("Rollover")).unwrap();

    let appended: Vec<String> = (0..25)
        .map(|n| {
            storage
                .append_attachment(&s.id, AttachmentKind::Image, image(n))
                .unwrap()
                .id
        })
        .collect();
    storage
        .append_attachment(&s.id, AttachmentKind::Audio, NewAttachment::from_bytes(b"pcm".to_vec()))
        .unwrap();

    let meta = storage.metadata(&s.id).unwrap().unwrap();
    assert_eq!(meta.image_chunk_count, 3);
    assert_eq!(meta.audio_chunk_count, 1);
    assert_eq!(meta.image_count, 25);

    let full = storage.load_full(&s.id).unwrap();
    let loaded: Vec<String> = full.images.iter().map(|a| a.id.clone()).collect();
    assert_eq!(loaded, appended);
    assert_eq!(full.audio.len(), 1);

    storage.flush().await;
    assert_eq!(backend.keys_with_prefix(&keys::session_chunks(&s.id)).len(), 4);
}

#[tokio::test]
async fn test_append_reads_only_open_chunk() {
    let backend = MemoryBackend::new();
    let storage = open(&backend);
    let s = storage.create_session(NewSession::named("Large")).unwrap();
    for n in 0..30 {
        storage.append_attachment(&s.id, AttachmentKind::Image, image(n)).unwrap();
    }
    storage.flush().await;
    storage.cache().clear();
    backend.clear_read_log();

    storage.append_attachment(&s.id, AttachmentKind::Image, image(30)).unwrap();
    assert_eq!(
        backend.reads_with_prefix(&keys::session_chunks(&s.id)),
        vec![keys::chunk(&s.id, AttachmentKind::Image, 2)]
    );
    assert_eq!(storage.metadata(&s.id).unwrap().unwrap().image_chunk_count, 4);
}

#[tokio::test]
async fn test_appends_for_one_session_share_a_transaction() {
    let backend = MemoryBackend::new();
    let storage = open(&backend);
    let s = storage.create_session(NewSession::named("Batch")).unwrap();
    storage.flush().await;
    let before = backend.stats().transactions_committed;

    for n in 0..10 {
        storage.append_attachment(&s.id, AttachmentKind::Image, image(n)).unwrap();
    }
    storage.flush().await;
    assert_eq!(backend.stats().transactions_committed - before, 1);
}

#[tokio::test]
async fn test_load_full_errors() {
    let backend = MemoryBackend::new();
    let storage = open(&backend);
    let unknown = SessionId::parse("missing").unwrap();
    assert!(storage.load_full(&unknown).unwrap_err().is_not_found());

    let s = storage.create_session(NewSession::named("Broken")).unwrap();
    storage.append_attachment(&s.id, AttachmentKind::Image, image(1)).unwrap();
    storage.flush().await;

    backend
        .delete(&keys::chunk(&s.id, AttachmentKind::Image, 0))
        .unwrap();
    storage.cache().clear();
    assert!(storage.load_full(&s.id).unwrap_err().is_corruption());
}

#[tokio::test]
async fn test_update_status_is_critical_and_indexed() {
    let backend = MemoryBackend::new();
    let storage = open(&backend);
    let s = storage.create_session(NewSession::named("Status")).unwrap();
    let mut rx = storage.subscribe();

    let done = storage.update_status(&s.id, SessionStatus::Completed).unwrap();
    assert!(done.ended_at.is_some());
    storage.flush().await;

    let mut critical = false;
    while let Ok(event) = rx.try_recv() {
        if let QueueEvent::Completed(info) = event {
            critical |= info.priority == Priority::Critical;
        }
    }
    assert!(critical);

    let hits = storage
        .search_sessions(&SearchQuery::status(SessionStatus::Completed))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(storage
        .search_sessions(&SearchQuery::status(SessionStatus::Active))
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_save_metadata_keeps_chunk_bookkeeping() {
    let backend = MemoryBackend::new();
    let storage = open(&backend);
    let s = storage.create_session(tagged("Draft", "draft")).unwrap();
    for n in 0..3 {
        storage.append_attachment(&s.id, AttachmentKind::Image, image(n)).unwrap();
    }

    let mut edited = s.clone();
    edited.name = "Final".into();
    edited.tags = BTreeSet::from(["published".to_string()]);
    storage.save_metadata(&s.id, edited).unwrap();

    let meta = storage.metadata(&s.id).unwrap().unwrap();
    assert_eq!(meta.name, "Final");
    assert_eq!(meta.image_count, 3);
    assert_eq!(meta.image_chunk_count, 1);
    assert_eq!(storage.search_sessions(&SearchQuery::tag("published")).unwrap().len(), 1);
    assert!(storage.search_sessions(&SearchQuery::tag("draft")).unwrap().is_empty());

    let other = SessionId::parse("other").unwrap();
    let err = storage.save_metadata(&other, meta).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn test_delete_is_one_transaction() {
    let backend = MemoryBackend::new();
    let storage = open(&backend);
    let s = storage.create_session(tagged("Doomed", "tmp")).unwrap();
    for n in 0..12 {
        storage.append_attachment(&s.id, AttachmentKind::Image, image(n)).unwrap();
    }
    storage.flush().await;
    let before = backend.stats().transactions_committed;

    storage.delete_session(&s.id).unwrap();
    storage.flush().await;
    assert_eq!(backend.stats().transactions_committed - before, 1);

    assert!(storage.metadata(&s.id).unwrap().is_none());
    assert!(storage.session_ids().unwrap().is_empty());
    assert!(backend.keys_with_prefix(&keys::session_chunks(&s.id)).is_empty());
    assert!(storage.search_sessions(&SearchQuery::tag("tmp")).unwrap().is_empty());
    assert_eq!(storage.cas().orphans().unwrap().len(), 12);
    assert!(storage.delete_session(&s.id).unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_shared_attachment_survives_one_delete() {
    let backend = MemoryBackend::new();
    let storage = open(&backend);
    let a = storage.create_session(NewSession::named("A")).unwrap();
    let b = storage.create_session(NewSession::named("B")).unwrap();
    let bytes = NewAttachment::from_bytes(b"same screenshot".to_vec());
    storage.append_attachment(&a.id, AttachmentKind::Image, bytes.clone()).unwrap();
    let kept = storage.append_attachment(&b.id, AttachmentKind::Image, bytes).unwrap();
    let hash = ContentHash::compute(b"same screenshot");
    assert_eq!(storage.cas().ref_count(&hash).unwrap(), 2);

    storage.delete_session(&a.id).unwrap();
    assert_eq!(storage.cas().ref_count(&hash).unwrap(), 1);
    assert_eq!(
        storage.load_attachment_bytes(&kept).unwrap(),
        Bytes::from_static(b"same screenshot")
    );

    storage.delete_session(&b.id).unwrap();
    assert_eq!(storage.cas().ref_count(&hash).unwrap(), 0);
    let report = storage.garbage_collect().unwrap();
    assert_eq!(report.freed, 1);
    storage.flush().await;
    assert!(!backend.contains(&keys::cas_blob(&hash)));
    assert_eq!(storage.garbage_collect().unwrap().freed, 0);
}

#[tokio::test]
async fn test_search_sorted_newest_first_with_limit() {
    let backend = MemoryBackend::new();
    let storage = open(&backend);
    for month in [1, 3, 2] {
        let mut new = tagged(&format!("Month {month}"), "monthly");
        new.started_at = Some(Utc.with_ymd_and_hms(2024, month, 1, 9, 0, 0).unwrap());
        storage.create_session(new).unwrap();
    }

    let hits = storage
        .search_sessions(&SearchQuery::tag("monthly").with_limit(2))
        .unwrap();
    let names: Vec<&str> = hits.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["Month 3", "Month 2"]);
}

#[tokio::test]
async fn test_search_hit_without_metadata_rebuilds() {
    let backend = MemoryBackend::new();
    let storage = open(&backend);
    let real = storage.create_session(tagged("Real", "shared")).unwrap();
    let ghost = SessionMetadata::from_new(
        SessionId::parse("ghost").unwrap(),
        tagged("Ghost", "shared"),
        Utc::now(),
    );
    storage.index().update(Some(&ghost), None).unwrap();
    let mut rx = storage.subscribe_index();

    let hits = storage.search_sessions(&SearchQuery::tag("shared")).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, real.id);

    let mut rebuilt = false;
    while let Ok(event) = rx.try_recv() {
        if let IndexEvent::Rebuilt { reason, .. } = event {
            assert_eq!(reason, RebuildReason::OrphanInSearch(ghost.id.clone()));
            rebuilt = true;
        }
    }
    assert!(rebuilt);
}

#[tokio::test]
async fn test_reopen_rebuilds_lost_index() {
    let backend = MemoryBackend::new();
    let id = {
        let storage = open(&backend);
        let s = storage.create_session(tagged("Persisted", "keep")).unwrap();
        storage.shutdown().await;
        s.id
    };
    backend.delete(keys::INDEX_META).unwrap();
    backend.insert_raw(&keys::posting_list("tag"), b"garbage");

    let storage = open(&backend);
    let hits = storage.search_sessions(&SearchQuery::tag("keep")).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, id);
    assert!(storage.verify_index().unwrap().is_healthy());
}

#[tokio::test]
async fn test_scheduled_maintenance_collects_garbage() {
    let backend = MemoryBackend::new();
    let storage = open(&backend);
    let s = storage.create_session(NewSession::named("Scratch")).unwrap();
    storage.append_attachment(&s.id, AttachmentKind::Image, image(7)).unwrap();
    storage.delete_session(&s.id).unwrap();
    storage.flush().await;

    let seqs = storage.schedule_maintenance().unwrap();
    assert_eq!(seqs.len(), 2);
    storage.flush().await;
    // GC enqueued its deletes while running
    storage.flush().await;

    let hash = ContentHash::compute(b"frame-7");
    assert!(!backend.contains(&keys::cas_blob(&hash)));
    assert!(storage.cas().orphans().unwrap().is_empty());
    assert!(storage.index().metadata().last_optimized.is_some());
    assert_eq!(storage.stats().unwrap().cas.gc_freed, 1);
}

#[tokio::test]
async fn test_stats_snapshot() {
    let backend = MemoryBackend::new();
    let storage = open(&backend);
    let s = storage.create_session(NewSession::named("Stats")).unwrap();
    storage.append_attachment(&s.id, AttachmentKind::Image, image(1)).unwrap();
    storage.append_attachment(&s.id, AttachmentKind::Image, image(1)).unwrap();
    storage.flush().await;

    let stats = storage.stats().unwrap();
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.cas.dedup_hits, 1);
    assert_eq!(stats.queue.pending(), 0);
    assert_eq!(stats.index.sessions, 1);
    assert!(stats.cache.max_bytes > 0);
}

fn open_with(backend: &MemoryBackend, config: EngineConfig) -> ChunkedSessionStorage {
    ChunkedSessionStorage::open(Arc::new(backend.clone()), config).unwrap()
}

fn stored_metadata(backend: &MemoryBackend, id: &SessionId) -> SessionMetadata {
    let raw = backend.get(&keys::session_meta(id)).unwrap().unwrap();
    serde_json::from_slice(&raw).unwrap()
}

#[tokio::test]
async fn test_status_change_lands_with_pending_appends() {
    let backend = MemoryBackend::new();
    let mut config = test_config();
    config.queue.batch_window_ms = 2_000;
    let storage = open_with(&backend, config);
    let s = storage.create_session(NewSession::named("Overtake")).unwrap();
    storage.append_attachment(&s.id, AttachmentKind::Image, image(0)).unwrap();
    storage.update_status(&s.id, SessionStatus::Paused).unwrap();

    // The critical write does not wait for the batch window
    let meta_key = keys::session_meta(&s.id);
    for _ in 0..200 {
        if backend.contains(&meta_key) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    let stored = stored_metadata(&backend, &s.id);
    assert_eq!(stored.status, SessionStatus::Paused);
    assert_eq!(stored.chunks.len(), 1);
    for pointer in &stored.chunks {
        assert!(backend.contains(&pointer.key), "{} missing", pointer.key);
    }
    storage.shutdown().await;
}

#[tokio::test]
async fn test_failed_status_change_never_points_at_missing_chunk() {
    let backend = MemoryBackend::new();
    let mut config = test_config();
    config.queue.normal_retries = 0;
    config.queue.critical_retries = 0;
    let storage = open_with(&backend, config);
    let s = storage.create_session(NewSession::named("Doomed")).unwrap();
    storage.flush().await;

    backend.fail_next_writes(100);
    storage.append_attachment(&s.id, AttachmentKind::Image, image(0)).unwrap();
    storage.update_status(&s.id, SessionStatus::Paused).unwrap();
    storage.flush().await;
    assert!(storage.stats().unwrap().queue.failed > 0);

    let stored = stored_metadata(&backend, &s.id);
    for pointer in &stored.chunks {
        assert!(backend.contains(&pointer.key), "{} missing", pointer.key);
    }
    storage.cache().clear();
    assert!(storage.load_full(&s.id).is_ok());
}

#[tokio::test]
async fn test_writes_refused_below_free_space_floor() {
    let backend = MemoryBackend::new();
    let mut config = test_config();
    config.storage.min_free_bytes = 1_000;
    let space = FixedSpace::new(1_000_000);
    let storage = ChunkedSessionStorage::open(Arc::new(backend.clone()), config)
        .unwrap()
        .with_space_source(Arc::new(space.clone()));

    let s = storage.create_session(NewSession::named("Tight")).unwrap();
    storage.append_attachment(&s.id, AttachmentKind::Image, image(0)).unwrap();

    space.set(1_005);
    let err = storage
        .append_attachment(&s.id, AttachmentKind::Image, image(1))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InsufficientSpace {
            available: 1_005,
            required: 1_007
        }
    ));
    assert!(matches!(
        storage.create_session(NewSession::named("Refused")),
        Err(Error::InsufficientSpace { .. })
    ));

    // Nothing from the refused calls is visible
    assert_eq!(storage.session_count().unwrap(), 1);
    assert_eq!(storage.metadata(&s.id).unwrap().unwrap().image_count, 1);
    assert_eq!(storage.cas().stats().new_entries, 1);

    space.set(1_000_000);
    storage.append_attachment(&s.id, AttachmentKind::Image, image(1)).unwrap();
    storage.shutdown().await;
}

#[tokio::test]
async fn test_zero_floor_skips_space_check() {
    let backend = MemoryBackend::new();
    let mut config = test_config();
    config.storage.min_free_bytes = 0;
    let storage = ChunkedSessionStorage::open(Arc::new(backend.clone()), config)
        .unwrap()
        .with_space_source(Arc::new(FixedSpace::new(0)));
    let s = storage.create_session(NewSession::named("Unchecked")).unwrap();
    storage.append_attachment(&s.id, AttachmentKind::Image, image(0)).unwrap();
    storage.shutdown().await;
}
