use super::*;
use sessionvault_common::config::CacheConfig;
use sessionvault_kv::MemoryBackend;
use std::sync::atomic::AtomicUsize;
use tokio::sync::broadcast::Receiver;

fn fast_config() -> QueueConfig {
    QueueConfig {
        batch_window_ms: 20,
        idle_poll_ms: 20,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        ..QueueConfig::default()
    }
}

fn start(config: QueueConfig) -> (PersistenceQueue, MemoryBackend, Arc<LruCache>) {
    let backend = MemoryBackend::new();
    let cache = Arc::new(LruCache::new(&CacheConfig::default()));
    let queue = PersistenceQueue::start(config, Arc::new(backend.clone()), Arc::clone(&cache))
        .unwrap();
    (queue, backend, cache)
}

fn drain(rx: &mut Receiver<QueueEvent>) -> Vec<QueueEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

struct CountingTask {
    runs: AtomicUsize,
}

impl MaintenanceTask for CountingTask {
    fn name(&self) -> &str {
        "counting"
    }

    fn run(&self) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_put_commits_on_flush() {
    let (queue, backend, _) = start(fast_config());
    queue.enqueue("k", b"v".to_vec(), Priority::Normal).unwrap();
    queue.flush().await;

    assert!(backend.contains("k"));
    let stats = queue.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.pending(), 0);
}

#[tokio::test]
async fn test_priority_ordering() {
    let (queue, _, _) = start(fast_config());
    let mut rx = queue.subscribe();

    queue.enqueue("low", b"l".to_vec(), Priority::Low).unwrap();
    queue.enqueue("normal", b"n".to_vec(), Priority::Normal).unwrap();
    queue.enqueue("critical", b"c".to_vec(), Priority::Critical).unwrap();
    queue.flush().await;

    let order: Vec<Priority> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            QueueEvent::Processing(item) => Some(item.priority),
            _ => None,
        })
        .collect();
    assert_eq!(
        order,
        vec![Priority::Critical, Priority::Normal, Priority::Low]
    );
}

#[tokio::test]
async fn test_batchable_chunk_writes_share_one_transaction() {
    let (queue, backend, _) = start(fast_config());
    let session = SessionId::parse("s1").unwrap();

    for i in 0..10 {
        queue
            .enqueue_chunk(&session, format!("session/chunk/s1/image/{i:06}"), vec![i as u8])
            .unwrap();
    }
    queue.flush().await;

    let stats = backend.stats();
    assert_eq!(stats.transactions_committed, 1);
    assert_eq!(stats.sets, 10);
    assert_eq!(queue.stats().transactions, 1);
}

#[tokio::test]
async fn test_sessions_batch_separately() {
    let (queue, backend, _) = start(fast_config());
    let a = SessionId::parse("a").unwrap();
    let b = SessionId::parse("b").unwrap();

    for i in 0..3 {
        queue.enqueue_chunk(&a, format!("a/{i}"), vec![1]).unwrap();
        queue.enqueue_chunk(&b, format!("b/{i}"), vec![2]).unwrap();
    }
    queue.flush().await;

    assert_eq!(backend.stats().transactions_committed, 2);
    assert_eq!(backend.len(), 6);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let (queue, backend, _) = start(fast_config());
    let mut rx = queue.subscribe();
    backend.fail_next_writes(2);

    queue.enqueue("status", b"paused".to_vec(), Priority::Critical).unwrap();
    queue.flush().await;

    assert_eq!(backend.get("status").unwrap(), Some(b"paused".to_vec()));
    let stats = queue.stats();
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);

    let attempts: Vec<u32> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            QueueEvent::Retry { attempt, .. } => Some(attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2]);
}

#[tokio::test]
async fn test_retry_keeps_tier_order() {
    let (queue, backend, _) = start(fast_config());
    backend.fail_next_writes(1);

    queue.enqueue("k", b"first".to_vec(), Priority::Normal).unwrap();
    queue.enqueue("k", b"second".to_vec(), Priority::Normal).unwrap();
    queue.flush().await;

    assert_eq!(backend.get("k").unwrap(), Some(b"second".to_vec()));
}

#[tokio::test]
async fn test_exhausted_retries_fail_permanently() {
    let (queue, backend, _) = start(fast_config());
    let mut rx = queue.subscribe();
    backend.fail_next_writes(100);

    queue.enqueue("k", b"v".to_vec(), Priority::Normal).unwrap();
    assert_eq!(queue.overlay_get("k"), Some(OverlayValue::Put(Bytes::from_static(b"v"))));
    queue.flush().await;

    let stats = queue.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retried, 3);
    // The abandoned value is no longer visible
    assert_eq!(queue.overlay_get("k"), None);

    let permanent = drain(&mut rx).into_iter().any(|e| {
        matches!(
            e,
            QueueEvent::Failed {
                permanent: true,
                ..
            }
        )
    });
    assert!(permanent);
}

#[tokio::test]
async fn test_overlay_gives_read_your_writes() {
    let (queue, backend, _) = start(fast_config());
    queue.enqueue("k", b"v".to_vec(), Priority::Normal).unwrap();
    queue.enqueue_delete("gone", Priority::Normal).unwrap();

    assert!(!backend.contains("k"));
    assert_eq!(
        queue.overlay_get("k"),
        Some(OverlayValue::Put(Bytes::from_static(b"v")))
    );
    assert_eq!(queue.overlay_get("gone"), Some(OverlayValue::Tombstone));

    queue.flush().await;
    assert_eq!(queue.overlay_get("k"), None);
    assert!(backend.contains("k"));
}

#[tokio::test]
async fn test_critical_write_not_overwritten_by_older_normal_write() {
    let (queue, backend, _) = start(fast_config());
    queue.enqueue("meta", b"old".to_vec(), Priority::Normal).unwrap();
    queue.enqueue("meta", b"new".to_vec(), Priority::Critical).unwrap();
    queue.flush().await;

    assert_eq!(backend.get("meta").unwrap(), Some(b"new".to_vec()));
}

#[tokio::test]
async fn test_commit_invalidates_cache() {
    let (queue, _, cache) = start(fast_config());
    cache.set("k", Bytes::from_static(b"old"), None);
    let generation = queue.commit_generation();

    queue.enqueue("k", b"new".to_vec(), Priority::Critical).unwrap();
    queue.flush().await;

    assert!(!cache.contains("k"));
    assert!(queue.commit_generation() > generation);

    // A fill from before the commit is rejected
    queue.fill_cache(generation, "k", Bytes::from_static(b"old"));
    assert!(!cache.contains("k"));
}

#[tokio::test]
async fn test_capacity_drops_low_priority_first() {
    let config = QueueConfig {
        max_pending: 2,
        ..fast_config()
    };
    let (queue, backend, _) = start(config);
    let mut rx = queue.subscribe();

    queue.enqueue("low-a", b"a".to_vec(), Priority::Low).unwrap();
    queue.enqueue("low-b", b"b".to_vec(), Priority::Low).unwrap();
    queue.enqueue("normal", b"n".to_vec(), Priority::Normal).unwrap();
    queue.enqueue("critical", b"c".to_vec(), Priority::Critical).unwrap();
    let err = queue
        .enqueue("low-c", b"c".to_vec(), Priority::Low)
        .unwrap_err();
    assert!(matches!(err, Error::Capacity(_)));
    // Soft cap for normal work
    queue.enqueue("normal-2", b"m".to_vec(), Priority::Normal).unwrap();

    queue.flush().await;

    assert_eq!(queue.stats().dropped, 3);
    assert!(backend.contains("normal"));
    assert!(backend.contains("normal-2"));
    assert!(backend.contains("critical"));
    assert!(!backend.contains("low-a"));
    assert!(!backend.contains("low-b"));

    let dropped: Vec<String> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            QueueEvent::Dropped { item, .. } => Some(item.label),
            _ => None,
        })
        .collect();
    assert_eq!(dropped, vec!["low-a", "low-b", "low-c"]);
}

#[tokio::test]
async fn test_cleanup_runs_maintenance_task() {
    let (queue, _, _) = start(fast_config());
    let task = Arc::new(CountingTask {
        runs: AtomicUsize::new(0),
    });
    queue.enqueue_cleanup(task.clone()).unwrap();
    queue.flush().await;
    assert_eq!(task.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_transaction_is_all_or_nothing() {
    let config = QueueConfig {
        normal_retries: 0,
        ..fast_config()
    };
    let (queue, backend, _) = start(config);
    backend.fail_next_writes(1);

    queue
        .enqueue_transaction(
            vec![KvOp::put("a", b"1".to_vec()), KvOp::put("b", b"2".to_vec())],
            EnqueueOptions::default(),
        )
        .unwrap();
    queue.flush().await;

    assert!(!backend.contains("a"));
    assert!(!backend.contains("b"));
    assert_eq!(queue.stats().failed, 1);
}

#[tokio::test]
async fn test_shutdown_closes_queue() {
    let (queue, backend, _) = start(fast_config());
    queue.enqueue("k", b"v".to_vec(), Priority::Low).unwrap();
    queue.shutdown().await;

    assert!(backend.contains("k"));
    assert!(queue.is_closed());
    assert!(matches!(
        queue.enqueue("k2", b"v".to_vec(), Priority::Critical),
        Err(Error::QueueClosed)
    ));
}

async fn wait_for(backend: &MemoryBackend, key: &str) {
    for _ in 0..400 {
        if backend.contains(key) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("{key} never committed");
}

fn session_options(priority: Priority, session: &SessionId) -> EnqueueOptions {
    EnqueueOptions {
        priority,
        item_type: Some(ItemType::Simple),
        session_id: Some(session.clone()),
        batchable: false,
    }
}

#[tokio::test]
async fn test_critical_write_carries_older_writes_of_its_session() {
    let config = QueueConfig {
        batch_window_ms: 2_000,
        ..fast_config()
    };
    let (queue, backend, _) = start(config);
    let session = SessionId::parse("s1").unwrap();
    let other = SessionId::parse("s2").unwrap();

    queue
        .enqueue_chunk(&session, "session/chunk/s1/image/000000", vec![1])
        .unwrap();
    queue
        .enqueue_chunk(&other, "session/chunk/s2/image/000000", vec![2])
        .unwrap();
    queue
        .enqueue_transaction(
            vec![KvOp::put("session/meta/s1", b"paused".to_vec())],
            session_options(Priority::Critical, &session),
        )
        .unwrap();

    // Committed long before the normal batch window closes
    wait_for(&backend, "session/meta/s1").await;
    assert!(backend.contains("session/chunk/s1/image/000000"));
    assert!(!backend.contains("session/chunk/s2/image/000000"));
    assert_eq!(backend.stats().transactions_committed, 1);
    assert_eq!(queue.stats().pending_normal, 1);

    queue.shutdown().await;
    assert!(backend.contains("session/chunk/s2/image/000000"));
}

#[tokio::test]
async fn test_newer_normal_write_is_not_carried() {
    let config = QueueConfig {
        batch_window_ms: 200,
        ..fast_config()
    };
    let (queue, backend, _) = start(config);
    let session = SessionId::parse("s1").unwrap();
    let critical = queue
        .enqueue_transaction(
            vec![KvOp::put("session/meta/s1", b"v1".to_vec())],
            session_options(Priority::Critical, &session),
        )
        .unwrap();
    let normal = queue
        .enqueue_transaction(
            vec![KvOp::put("session/meta/s1", b"v2".to_vec())],
            session_options(Priority::Normal, &session),
        )
        .unwrap();
    assert!(normal > critical);

    queue.shutdown().await;
    assert_eq!(backend.get("session/meta/s1").unwrap(), Some(b"v2".to_vec()));
}

#[tokio::test]
async fn test_carried_writes_share_the_critical_retry_budget() {
    let config = QueueConfig {
        batch_window_ms: 60_000,
        normal_retries: 0,
        critical_retries: 2,
        ..fast_config()
    };
    let (queue, backend, _) = start(config);
    let session = SessionId::parse("s1").unwrap();
    backend.fail_next_writes(1);

    queue
        .enqueue_chunk(&session, "session/chunk/s1/image/000000", vec![1])
        .unwrap();
    queue
        .enqueue_transaction(
            vec![KvOp::put("session/meta/s1", b"paused".to_vec())],
            session_options(Priority::Critical, &session),
        )
        .unwrap();
    queue.flush().await;

    assert!(backend.contains("session/meta/s1"));
    assert!(backend.contains("session/chunk/s1/image/000000"));
    let stats = queue.stats();
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.completed, 2);
}

#[tokio::test]
async fn test_carried_writes_fail_together() {
    let config = QueueConfig {
        batch_window_ms: 60_000,
        normal_retries: 3,
        critical_retries: 0,
        ..fast_config()
    };
    let (queue, backend, _) = start(config);
    let session = SessionId::parse("s1").unwrap();
    backend.fail_next_writes(100);

    queue
        .enqueue_chunk(&session, "session/chunk/s1/image/000000", vec![1])
        .unwrap();
    queue
        .enqueue_transaction(
            vec![KvOp::put("session/meta/s1", b"paused".to_vec())],
            session_options(Priority::Critical, &session),
        )
        .unwrap();
    queue.flush().await;

    assert!(!backend.contains("session/meta/s1"));
    assert!(!backend.contains("session/chunk/s1/image/000000"));
    assert_eq!(queue.stats().failed, 2);
}

#[test]
fn test_group_batch_by_session() {
    let session = |s: &str| Some(SessionId::parse(s).unwrap());
    let item = |seq: u64, sid: Option<SessionId>, batchable: bool| QueueItem {
        seq,
        op: QueueOp::Put {
            key: format!("k{seq}"),
            value: Bytes::new(),
        },
        priority: Priority::Normal,
        item_type: ItemType::Chunk,
        session_id: sid,
        retry_count: 0,
        batchable,
        enqueued_at: Instant::now(),
    };

    let groups = QueueShared::group_batch(vec![
        item(1, session("a"), true),
        item(2, None, false),
        item(3, session("a"), true),
        item(4, session("b"), true),
        item(5, session("a"), false),
    ]);
    let seqs: Vec<Vec<u64>> = groups
        .iter()
        .map(|g| g.iter().map(|i| i.seq).collect())
        .collect();
    assert_eq!(seqs, vec![vec![1, 3], vec![2], vec![4], vec![5]]);
}
