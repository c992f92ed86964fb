//! Tests for the consumer worker cycle

use super::*;
use crate::adapters::{MemoryPointStore, MemoryQueueStore};
use crate::queue_store::{QueueStore, StoredEntry};
use crate::{Position, Timestamp};

const TIMEOUT: Duration = Duration::from_secs(2);

struct Harness {
    worker: ConsumerWorker,
    queue: IngestQueue,
    queue_store: MemoryQueueStore,
    points: MemoryPointStore,
    counters: Arc<QueueCounters>,
}

fn harness(queue_type: QueueType, policy: RetryPolicy) -> Harness {
    let queue_store = MemoryQueueStore::new();
    let queue = IngestQueue::new(Arc::new(queue_store.clone()));
    let points = MemoryPointStore::new();
    let counters = Arc::new(QueueCounters::new());

    let worker = ConsumerWorker::new(
        queue_type,
        queue.clone(),
        Validator::new(Arc::new(points.clone()), TIMEOUT),
        PersistenceSink::new(Arc::new(points.clone()), TIMEOUT),
        policy,
        counters.clone(),
    )
    .with_poll_interval(Duration::from_millis(10));

    Harness {
        worker,
        queue,
        queue_store,
        points,
        counters,
    }
}

fn no_delay_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(max_retries, Duration::ZERO, Duration::ZERO)
}

fn points_for(owner: i64, count: usize) -> Vec<PointRecord> {
    (0..count)
        .map(|i| {
            PointRecord::new(
                OwnerId::new(owner),
                Timestamp::from_millis(1_700_000_000_000 + i as i64 * 1000),
                Position::new(52.0 + i as f64 * 0.001, 4.0),
            )
        })
        .collect()
}

// ============================================================================
// Happy Path
// ============================================================================

#[tokio::test]
async fn test_empty_queue_produces_empty_report() {
    let h = harness(QueueType::Upload, RetryPolicy::default());

    let report = h.worker.run_cycle(10).await.unwrap();

    assert!(report.is_empty());
    assert_eq!(h.points.upsert_attempts(), 0);
    assert_eq!(h.worker.state(), WorkerState::Idle);
}

#[tokio::test]
async fn test_valid_batch_is_persisted() {
    let h = harness(QueueType::Upload, RetryPolicy::default());
    h.points.add_owner(QueueType::Upload, OwnerId::new(1));
    h.queue
        .enqueue(QueueType::Upload, points_for(1, 3), None)
        .await
        .unwrap();

    let report = h.worker.run_cycle(10).await.unwrap();

    assert_eq!(report.fetched_items, 1);
    assert_eq!(report.persisted_points, 3);
    assert!(report.dead_lettered.is_empty());
    assert!(report.retries.is_empty());
    assert_eq!(h.points.row_count(QueueType::Upload), 3);
    assert_eq!(h.counters.processed_total(), 3);
    assert_eq!(h.counters.in_flight(), 0);
    assert_eq!(h.queue.size(QueueType::Upload).await.unwrap(), 0);
}

#[tokio::test]
async fn test_items_from_one_cycle_share_one_validation_and_upsert() {
    let h = harness(QueueType::LivePosition, RetryPolicy::default());
    h.points.add_owner(QueueType::LivePosition, OwnerId::new(1));
    h.points.add_owner(QueueType::LivePosition, OwnerId::new(2));
    h.queue
        .enqueue(QueueType::LivePosition, points_for(1, 2), None)
        .await
        .unwrap();
    h.queue
        .enqueue(QueueType::LivePosition, points_for(2, 2), None)
        .await
        .unwrap();

    let report = h.worker.run_cycle(10).await.unwrap();

    assert_eq!(report.fetched_items, 2);
    assert_eq!(report.persisted_points, 4);
    assert_eq!(h.points.exists_calls(), 1);
    assert_eq!(h.points.upsert_attempts(), 1);
}

#[tokio::test]
async fn test_batch_size_limits_items_per_cycle() {
    let h = harness(QueueType::DerivedScore, RetryPolicy::default());
    for owner in 0..5 {
        h.queue
            .enqueue(QueueType::DerivedScore, points_for(owner, 1), None)
            .await
            .unwrap();
    }

    let report = h.worker.run_cycle(2).await.unwrap();

    assert_eq!(report.fetched_items, 2);
    assert_eq!(h.queue.size(QueueType::DerivedScore).await.unwrap(), 3);
}

#[tokio::test]
async fn test_types_without_parent_skip_owner_lookup() {
    let h = harness(QueueType::DerivedScore, RetryPolicy::default());
    h.queue
        .enqueue(QueueType::DerivedScore, points_for(404, 2), None)
        .await
        .unwrap();

    let report = h.worker.run_cycle(10).await.unwrap();

    assert_eq!(report.persisted_points, 2);
    assert_eq!(h.points.exists_calls(), 0);
}

// ============================================================================
// Validation Failures
// ============================================================================

#[tokio::test]
async fn test_unknown_owner_points_are_dead_lettered_and_rest_persisted() {
    let h = harness(QueueType::Upload, RetryPolicy::default());
    h.points.add_owner(QueueType::Upload, OwnerId::new(1));

    let mut points = points_for(1, 5);
    points.extend(points_for(2, 5));
    h.queue.enqueue(QueueType::Upload, points, None).await.unwrap();

    let report = h.worker.run_cycle(10).await.unwrap();

    assert_eq!(report.persisted_points, 5);
    assert_eq!(report.dead_lettered.len(), 1);
    assert_eq!(report.dead_lettered[0].reason, DlqReason::UnknownParentReference);
    assert_eq!(report.dead_lettered[0].count, 5);
    assert!(report.retries.is_empty());

    assert_eq!(h.points.row_count(QueueType::Upload), 5);
    assert!(h
        .points
        .rows(QueueType::Upload)
        .iter()
        .all(|p| p.owner == OwnerId::new(1)));

    let dlq = h.queue.peek_dead_letters(QueueType::Upload, 10).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].count, 5);
    assert!(dlq[0].points.iter().all(|p| p.owner == OwnerId::new(2)));
    assert_eq!(h.counters.failed_total(), 5);
    assert_eq!(h.counters.processed_total(), 5);
}

#[tokio::test]
async fn test_validator_error_reschedules_every_item() {
    let h = harness(QueueType::Upload, no_delay_policy(3));
    h.points.add_owner(QueueType::Upload, OwnerId::new(1));
    h.queue
        .enqueue(QueueType::Upload, points_for(1, 1), None)
        .await
        .unwrap();
    h.queue
        .enqueue(QueueType::Upload, points_for(1, 1), None)
        .await
        .unwrap();
    h.points.set_unavailable(true);

    let report = h.worker.run_cycle(10).await.unwrap();

    assert_eq!(report.retries.len(), 2);
    assert!(report.retries.iter().all(|r| r.retry_count == 1));
    assert!(report.dead_lettered.is_empty());
    assert_eq!(h.queue.size(QueueType::Upload).await.unwrap(), 2);
    assert_eq!(h.points.upsert_attempts(), 0);
}

// ============================================================================
// Retry Behavior
// ============================================================================

#[tokio::test]
async fn test_transient_failure_schedules_retry_with_backoff() {
    let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(10));
    let h = harness(QueueType::Upload, policy);
    h.points.add_owner(QueueType::Upload, OwnerId::new(1));
    h.points.fail_next_upserts(1);
    let id = h
        .queue
        .enqueue(QueueType::Upload, points_for(1, 2), None)
        .await
        .unwrap();

    let report = h.worker.run_cycle(10).await.unwrap();

    assert_eq!(
        report.retries,
        vec![ScheduledRetry {
            item_id: id,
            retry_count: 1,
            delay_ms: 100,
        }]
    );
    assert_eq!(h.counters.retried_total(), 1);
    assert_eq!(h.queue.size(QueueType::Upload).await.unwrap(), 1);

    // Not yet due
    let again = h.worker.run_cycle(10).await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn test_retried_item_is_persisted_once_due() {
    let policy = RetryPolicy::new(3, Duration::from_millis(20), Duration::from_secs(1));
    let h = harness(QueueType::Upload, policy);
    h.points.add_owner(QueueType::Upload, OwnerId::new(1));
    h.points.fail_next_upserts(1);
    h.queue
        .enqueue(QueueType::Upload, points_for(1, 2), None)
        .await
        .unwrap();

    h.worker.run_cycle(10).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    let report = h.worker.run_cycle(10).await.unwrap();

    assert_eq!(report.persisted_points, 2);
    assert_eq!(h.points.row_count(QueueType::Upload), 2);
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter_with_retry_count() {
    let h = harness(QueueType::Upload, no_delay_policy(3));
    h.points.add_owner(QueueType::Upload, OwnerId::new(1));
    h.points.fail_next_upserts(100);
    h.queue
        .enqueue(QueueType::Upload, points_for(1, 4), None)
        .await
        .unwrap();

    let mut retries = Vec::new();
    let mut dead = Vec::new();
    for _ in 0..4 {
        let report = h.worker.run_cycle(10).await.unwrap();
        retries.extend(report.retries);
        dead.extend(report.dead_lettered);
    }

    let counts: Vec<u32> = retries.iter().map(|r| r.retry_count).collect();
    assert_eq!(counts, vec![1, 2, 3]);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, DlqReason::MaxRetriesExceeded);

    let dlq = h.queue.peek_dead_letters(QueueType::Upload, 10).await.unwrap();
    assert_eq!(dlq[0].retry_count, 3);
    assert_eq!(dlq[0].count, 4);
    assert_eq!(h.queue.size(QueueType::Upload).await.unwrap(), 0);
    assert_eq!(h.points.upsert_attempts(), 4);
}

#[tokio::test]
async fn test_retry_delays_double() {
    let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_secs(1));
    let h = harness(QueueType::DerivedScore, policy);
    h.points.fail_next_upserts(100);
    h.queue
        .enqueue(QueueType::DerivedScore, points_for(1, 1), None)
        .await
        .unwrap();

    let mut delays = Vec::new();
    for _ in 0..4 {
        let report = h.worker.run_cycle(10).await.unwrap();
        delays.extend(report.retries.iter().map(|r| r.delay_ms));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(delays, vec![1, 2, 4]);
}

#[tokio::test]
async fn test_persistence_timeout_is_retried() {
    let queue_store = MemoryQueueStore::new();
    let queue = IngestQueue::new(Arc::new(queue_store));
    let points = MemoryPointStore::new();
    points.set_upsert_delay(Some(Duration::from_millis(200)));
    let worker = ConsumerWorker::new(
        QueueType::DerivedScore,
        queue.clone(),
        Validator::new(Arc::new(points.clone()), TIMEOUT),
        PersistenceSink::new(Arc::new(points.clone()), Duration::from_millis(20)),
        no_delay_policy(2),
        Arc::new(QueueCounters::new()),
    );
    queue
        .enqueue(QueueType::DerivedScore, points_for(1, 1), None)
        .await
        .unwrap();

    let report = worker.run_cycle(10).await.unwrap();

    assert_eq!(report.retries.len(), 1);
    assert_eq!(report.persisted_points, 0);
}

// ============================================================================
// Structural Failures
// ============================================================================

#[tokio::test]
async fn test_structural_failure_isolates_poison_item() {
    let h = harness(QueueType::Upload, RetryPolicy::default());
    h.points.add_owner(QueueType::Upload, OwnerId::new(1));
    h.points.add_owner(QueueType::Upload, OwnerId::new(66));
    h.points.reject_points_of(OwnerId::new(66));
    h.queue
        .enqueue(QueueType::Upload, points_for(1, 3), None)
        .await
        .unwrap();
    let poison = h
        .queue
        .enqueue(QueueType::Upload, points_for(66, 2), None)
        .await
        .unwrap();

    let report = h.worker.run_cycle(10).await.unwrap();

    assert_eq!(report.persisted_points, 3);
    assert_eq!(report.dead_lettered.len(), 1);
    assert_eq!(report.dead_lettered[0].item_id, poison);
    assert!(matches!(
        report.dead_lettered[0].reason,
        DlqReason::StructuralFailure { .. }
    ));
    assert!(report.retries.is_empty());
    // One combined attempt plus one per item
    assert_eq!(h.points.upsert_attempts(), 3);
}

#[tokio::test]
async fn test_structural_failure_is_not_retried() {
    let h = harness(QueueType::DerivedScore, RetryPolicy::default());
    h.points
        .set_structural_failure(Some("value out of range".to_string()));
    h.queue
        .enqueue(QueueType::DerivedScore, points_for(1, 2), None)
        .await
        .unwrap();

    let report = h.worker.run_cycle(10).await.unwrap();

    assert_eq!(report.dead_lettered.len(), 1);
    assert!(report.retries.is_empty());
    assert_eq!(h.queue.size(QueueType::DerivedScore).await.unwrap(), 0);
    assert_eq!(h.points.upsert_attempts(), 1);
}

// ============================================================================
// Malformed Entries and Store Errors
// ============================================================================

#[tokio::test]
async fn test_malformed_entry_is_dead_lettered_without_aborting_cycle() {
    let h = harness(QueueType::DerivedScore, RetryPolicy::default());
    h.queue_store
        .insert(
            QueueType::DerivedScore,
            StoredEntry {
                score: 0.5,
                enqueued_at: Timestamp::now(),
                payload: "{not json".to_string(),
            },
        )
        .await
        .unwrap();
    h.queue
        .enqueue(QueueType::DerivedScore, points_for(1, 2), None)
        .await
        .unwrap();

    let report = h.worker.run_cycle(10).await.unwrap();

    assert_eq!(report.fetched_items, 2);
    assert_eq!(report.malformed, 1);
    assert_eq!(report.persisted_points, 2);
    assert_eq!(h.counters.failed_total(), 1);

    let dlq = h
        .queue
        .peek_dead_letters(QueueType::DerivedScore, 10)
        .await
        .unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].raw_payload.as_deref(), Some("{not json"));
    assert!(matches!(dlq[0].reason, DlqReason::MalformedPayload { .. }));
}

// ============================================================================
// Dead-Letter Write Failures
// ============================================================================

#[tokio::test]
async fn test_failed_dead_letter_write_returns_item_to_queue() {
    let h = harness(QueueType::Upload, RetryPolicy::default());
    let id = h
        .queue
        .enqueue(QueueType::Upload, points_for(9, 5), None)
        .await
        .unwrap();
    h.queue_store.fail_next_dlq_inserts(1);

    let report = h.worker.run_cycle(10).await.unwrap();

    assert_eq!(report.fetched_items, 1);
    assert!(report.dead_lettered.is_empty());
    assert_eq!(h.queue.size(QueueType::Upload).await.unwrap(), 1);
    assert_eq!(h.queue.dlq_size(QueueType::Upload).await.unwrap(), 0);
    assert_eq!(h.counters.failed_total(), 0);

    // Due again after one poll interval; this time the write succeeds
    tokio::time::sleep(Duration::from_millis(30)).await;
    let report = h.worker.run_cycle(10).await.unwrap();

    assert_eq!(report.dead_lettered.len(), 1);
    assert_eq!(report.dead_lettered[0].item_id, id);
    assert_eq!(report.dead_lettered[0].count, 5);
    assert_eq!(h.queue.size(QueueType::Upload).await.unwrap(), 0);
    assert_eq!(h.queue.dlq_size(QueueType::Upload).await.unwrap(), 1);
}

#[tokio::test]
async fn test_failed_dead_letter_write_keeps_malformed_payload() {
    let h = harness(QueueType::DerivedScore, RetryPolicy::default());
    h.queue_store
        .insert(
            QueueType::DerivedScore,
            StoredEntry {
                score: 0.5,
                enqueued_at: Timestamp::now(),
                payload: "{not json".to_string(),
            },
        )
        .await
        .unwrap();
    h.queue_store.fail_next_dlq_inserts(1);

    let report = h.worker.run_cycle(10).await.unwrap();

    assert_eq!(report.malformed, 1);
    assert!(report.dead_lettered.is_empty());
    assert_eq!(h.queue.size(QueueType::DerivedScore).await.unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(30)).await;
    h.worker.run_cycle(10).await.unwrap();

    let dlq = h
        .queue
        .peek_dead_letters(QueueType::DerivedScore, 10)
        .await
        .unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].raw_payload.as_deref(), Some("{not json"));
}

#[tokio::test]
async fn test_failed_requeue_is_dead_lettered_as_requeue_failure() {
    let h = harness(QueueType::Upload, no_delay_policy(3));
    h.points.add_owner(QueueType::Upload, OwnerId::new(1));
    h.points.fail_next_upserts(1);
    h.queue
        .enqueue(QueueType::Upload, points_for(1, 2), None)
        .await
        .unwrap();
    h.queue_store.fail_next_inserts(1);

    let report = h.worker.run_cycle(10).await.unwrap();

    assert!(report.retries.is_empty());
    assert_eq!(report.dead_lettered.len(), 1);
    assert!(matches!(
        report.dead_lettered[0].reason,
        DlqReason::RequeueFailed { .. }
    ));
}

#[tokio::test]
async fn test_store_error_is_returned() {
    let h = harness(QueueType::Upload, RetryPolicy::default());
    h.queue_store.set_unavailable(true);

    let result = h.worker.run_cycle(10).await;

    assert!(matches!(result, Err(StoreError::Unavailable { .. })));
    assert_eq!(h.worker.state(), WorkerState::Idle);
}

// ============================================================================
// Loop Behavior
// ============================================================================

#[tokio::test]
async fn test_run_drains_queue_and_stops_on_shutdown() {
    let h = harness(QueueType::DerivedScore, RetryPolicy::default());
    for owner in 0..3 {
        h.queue
            .enqueue(QueueType::DerivedScore, points_for(owner, 2), None)
            .await
            .unwrap();
    }

    let shutdown = ShutdownToken::new();
    let worker = h.worker.clone().with_batch_size(1);
    let handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { worker.run(shutdown).await }
    });

    for _ in 0..100 {
        if h.points.row_count(QueueType::DerivedScore) == 6 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(h.points.row_count(QueueType::DerivedScore), 6);
}

#[tokio::test]
async fn test_run_survives_store_errors() {
    let h = harness(QueueType::DerivedScore, RetryPolicy::default());
    h.queue_store.set_unavailable(true);

    let shutdown = ShutdownToken::new();
    let worker = h.worker.clone();
    let handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { worker.run(shutdown).await }
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    h.queue_store.set_unavailable(false);
    h.queue
        .enqueue(QueueType::DerivedScore, points_for(1, 1), None)
        .await
        .unwrap();

    for _ in 0..100 {
        if h.points.row_count(QueueType::DerivedScore) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(h.points.row_count(QueueType::DerivedScore), 1);
}

#[tokio::test]
async fn test_drain_stops_at_max_items() {
    let h = harness(QueueType::DerivedScore, RetryPolicy::default());
    let worker = h.worker.clone().with_batch_size(2);
    for owner in 0..5 {
        h.queue
            .enqueue(QueueType::DerivedScore, points_for(owner, 1), None)
            .await
            .unwrap();
    }

    let report = worker.drain(3).await.unwrap();

    assert_eq!(report.fetched_items, 3);
    assert_eq!(report.persisted_points, 3);
    assert_eq!(h.queue.size(QueueType::DerivedScore).await.unwrap(), 2);
}
