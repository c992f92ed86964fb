//! Tests for the in-memory queue store

use super::*;
use std::time::Duration;

fn entry(score: f64, payload: &str) -> StoredEntry {
    StoredEntry {
        score,
        enqueued_at: Timestamp::now(),
        payload: payload.to_string(),
    }
}

fn dead_letter(payload: &str) -> StoredDeadLetter {
    StoredDeadLetter {
        failed_at: Timestamp::now(),
        payload: payload.to_string(),
    }
}

fn payloads(entries: &[StoredEntry]) -> Vec<&str> {
    entries.iter().map(|e| e.payload.as_str()).collect()
}

// ============================================================================
// Ordering and Due Filtering
// ============================================================================

#[tokio::test]
async fn test_pop_due_returns_lowest_scores_first() {
    let store = MemoryQueueStore::new();
    store.insert(QueueType::Upload, entry(3.0, "c")).await.unwrap();
    store.insert(QueueType::Upload, entry(1.0, "a")).await.unwrap();
    store.insert(QueueType::Upload, entry(2.0, "b")).await.unwrap();

    let popped = store.pop_due(QueueType::Upload, 10, 100.0).await.unwrap();

    assert_eq!(payloads(&popped), vec!["a", "b", "c"]);
    assert_eq!(store.pending_count(QueueType::Upload).await.unwrap(), 0);
}

#[tokio::test]
async fn test_equal_scores_keep_insertion_order() {
    let store = MemoryQueueStore::new();
    for payload in ["first", "second", "third"] {
        store
            .insert(QueueType::LivePosition, entry(5.0, payload))
            .await
            .unwrap();
    }

    let popped = store.pop_due(QueueType::LivePosition, 3, 5.0).await.unwrap();

    assert_eq!(payloads(&popped), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_pop_due_skips_entries_not_yet_due() {
    let store = MemoryQueueStore::new();
    store.insert(QueueType::Upload, entry(1.0, "due")).await.unwrap();
    store
        .insert(QueueType::Upload, entry(1_000.0, "later"))
        .await
        .unwrap();

    let popped = store.pop_due(QueueType::Upload, 10, 500.0).await.unwrap();

    assert_eq!(payloads(&popped), vec!["due"]);
    assert_eq!(store.pending_count(QueueType::Upload).await.unwrap(), 1);
}

#[tokio::test]
async fn test_pop_due_respects_max_items() {
    let store = MemoryQueueStore::new();
    for i in 0..5 {
        store
            .insert(QueueType::DeviceFeed, entry(i as f64, &i.to_string()))
            .await
            .unwrap();
    }

    let popped = store.pop_due(QueueType::DeviceFeed, 2, 100.0).await.unwrap();

    assert_eq!(payloads(&popped), vec!["0", "1"]);
    assert_eq!(store.pending_count(QueueType::DeviceFeed).await.unwrap(), 3);
}

#[tokio::test]
async fn test_pop_due_on_empty_partition_returns_immediately() {
    let store = MemoryQueueStore::new();

    let popped = store.pop_due(QueueType::DerivedScore, 10, f64::MAX).await.unwrap();

    assert!(popped.is_empty());
}

#[tokio::test]
async fn test_partitions_are_independent() {
    let store = MemoryQueueStore::new();
    store.insert(QueueType::Upload, entry(1.0, "u")).await.unwrap();

    assert_eq!(store.pending_count(QueueType::LivePosition).await.unwrap(), 0);
    assert!(store
        .pop_due(QueueType::LivePosition, 10, 100.0)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(store.pending_count(QueueType::Upload).await.unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_pops_never_share_entries() {
    let store = MemoryQueueStore::new();
    for i in 0..200 {
        store
            .insert(QueueType::Upload, entry(i as f64, &i.to_string()))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            loop {
                let popped = store.pop_due(QueueType::Upload, 7, f64::MAX).await.unwrap();
                if popped.is_empty() {
                    break;
                }
                seen.extend(popped.into_iter().map(|e| e.payload));
            }
            seen
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all.sort();
    let before = all.len();
    all.dedup();

    assert_eq!(before, 200);
    assert_eq!(all.len(), 200);
}

// ============================================================================
// Dead-Letter Partition
// ============================================================================

#[tokio::test]
async fn test_dlq_pop_and_peek_are_oldest_first() {
    let store = MemoryQueueStore::new();
    for payload in ["a", "b", "c"] {
        store
            .dlq_insert(QueueType::Upload, dead_letter(payload))
            .await
            .unwrap();
    }

    let peeked = store.dlq_peek(QueueType::Upload, 2).await.unwrap();
    assert_eq!(peeked[0].payload, "a");
    assert_eq!(peeked[1].payload, "b");
    assert_eq!(store.dlq_count(QueueType::Upload).await.unwrap(), 3);

    let popped = store.dlq_pop(QueueType::Upload, 2).await.unwrap();
    assert_eq!(popped.len(), 2);
    assert_eq!(popped[0].payload, "a");
    assert_eq!(store.dlq_count(QueueType::Upload).await.unwrap(), 1);

    let rest = store.dlq_pop(QueueType::Upload, 10).await.unwrap();
    assert_eq!(rest[0].payload, "c");
}

// ============================================================================
// Administrative Operations
// ============================================================================

#[tokio::test]
async fn test_clear_keeps_dlq_unless_requested() {
    let store = MemoryQueueStore::new();
    store.insert(QueueType::Upload, entry(1.0, "a")).await.unwrap();
    store.insert(QueueType::Upload, entry(2.0, "b")).await.unwrap();
    store
        .dlq_insert(QueueType::Upload, dead_letter("x"))
        .await
        .unwrap();

    let counts = store.clear(QueueType::Upload, false).await.unwrap();
    assert_eq!(counts, ClearCounts { queue: 2, dead_letter: 0 });
    assert_eq!(store.dlq_count(QueueType::Upload).await.unwrap(), 1);

    let counts = store.clear(QueueType::Upload, true).await.unwrap();
    assert_eq!(counts, ClearCounts { queue: 0, dead_letter: 1 });
    assert_eq!(store.dlq_count(QueueType::Upload).await.unwrap(), 0);
}

#[tokio::test]
async fn test_purge_older_than_removes_only_old_entries() {
    let store = MemoryQueueStore::new();
    let old = Timestamp::now().subtract_duration(Duration::from_secs(3600));

    store
        .insert(
            QueueType::Upload,
            StoredEntry {
                score: 1.0,
                enqueued_at: old,
                payload: "old".to_string(),
            },
        )
        .await
        .unwrap();
    store.insert(QueueType::Upload, entry(2.0, "new")).await.unwrap();
    store
        .dlq_insert(
            QueueType::Upload,
            StoredDeadLetter {
                failed_at: old,
                payload: "old-dlq".to_string(),
            },
        )
        .await
        .unwrap();

    let cutoff = Timestamp::now().subtract_duration(Duration::from_secs(60));

    let counted = store.count_older_than(QueueType::Upload, cutoff).await.unwrap();
    assert_eq!(counted, ClearCounts { queue: 1, dead_letter: 1 });
    assert_eq!(store.pending_count(QueueType::Upload).await.unwrap(), 2);

    let purged = store.purge_older_than(QueueType::Upload, cutoff).await.unwrap();
    assert_eq!(purged, counted);
    assert_eq!(store.pending_count(QueueType::Upload).await.unwrap(), 1);
    assert_eq!(store.dlq_count(QueueType::Upload).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unavailable_store_rejects_operations() {
    let store = MemoryQueueStore::new();
    store.set_unavailable(true);

    let err = store
        .insert(QueueType::Upload, entry(1.0, "a"))
        .await
        .unwrap_err();
    assert!(err.is_transient());

    store.set_unavailable(false);
    store.insert(QueueType::Upload, entry(1.0, "a")).await.unwrap();
}

// ============================================================================
// Snapshots
// ============================================================================

#[tokio::test]
async fn test_snapshot_restore_preserves_order_and_dlq() {
    let store = MemoryQueueStore::new();
    store.insert(QueueType::Upload, entry(2.0, "b")).await.unwrap();
    store.insert(QueueType::Upload, entry(1.0, "a")).await.unwrap();
    store
        .dlq_insert(QueueType::DeviceFeed, dead_letter("x"))
        .await
        .unwrap();

    let snapshot = store.snapshot().unwrap();
    let restored = MemoryQueueStore::new();
    restored.restore(snapshot).unwrap();

    let popped = restored.pop_due(QueueType::Upload, 10, 10.0).await.unwrap();
    assert_eq!(payloads(&popped), vec!["a", "b"]);
    assert_eq!(restored.dlq_count(QueueType::DeviceFeed).await.unwrap(), 1);
}

#[tokio::test]
async fn test_snapshot_with_entry_does_not_touch_live_store() {
    let store = MemoryQueueStore::new();

    let snapshot = store
        .snapshot()
        .unwrap()
        .with_entry(QueueType::Upload, entry(1.0, "pending"))
        .with_dead_letter(QueueType::Upload, dead_letter("dead"));

    assert_eq!(store.pending_count(QueueType::Upload).await.unwrap(), 0);
    let upload = snapshot
        .partitions
        .iter()
        .find(|p| p.queue_type == QueueType::Upload)
        .unwrap();
    assert_eq!(upload.queue.len(), 1);
    assert_eq!(upload.dead_letter.len(), 1);
}

#[tokio::test]
async fn test_injected_insert_failures_are_consumed_one_by_one() {
    let store = MemoryQueueStore::new();
    store.fail_next_inserts(1);
    store.fail_next_dlq_inserts(2);

    assert!(store.insert(QueueType::Upload, entry(1.0, "a")).await.is_err());
    store.insert(QueueType::Upload, entry(1.0, "a")).await.unwrap();

    assert!(store
        .dlq_insert(QueueType::Upload, dead_letter("x"))
        .await
        .is_err());
    assert!(store
        .dlq_insert(QueueType::Upload, dead_letter("x"))
        .await
        .is_err());
    store
        .dlq_insert(QueueType::Upload, dead_letter("x"))
        .await
        .unwrap();

    assert_eq!(store.pending_count(QueueType::Upload).await.unwrap(), 1);
    assert_eq!(store.dlq_count(QueueType::Upload).await.unwrap(), 1);
}
