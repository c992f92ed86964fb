//! Consumer worker: drains one queue type through validation and persistence.
//!
//! Each cycle moves through
//! `Idle -> Fetching -> Validating -> Persisting -> {Succeeded | Retrying | DeadLettered} -> Idle`:
//!
//! 1. **Fetching** pops up to `batch_size` due items. Undecodable entries are
//!    quarantined immediately and never abort the cycle.
//! 2. **Validating** checks every point's owner with one lookup. The points
//!    of missing owners are dead-lettered per source item; the rest continue.
//! 3. **Persisting** upserts all remaining points in one call. Retryable
//!    failures reschedule each item with backoff (or dead-letter it once its
//!    retries are exhausted). A structural failure over several items is
//!    retried item by item so only the offending item is quarantined.
//!
//! A failure never takes down the loop: every outcome ends with the cycle's
//! items either persisted, rescheduled or dead-lettered. When the
//! dead-letter write itself fails, the item goes back into the queue one
//! poll interval out.

use crate::error::{PersistenceError, StoreError};
use crate::health::QueueCounters;
use crate::persistence::PersistenceSink;
use crate::queue_store::{DequeuedEntry, IngestQueue, MalformedEntry};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::supervisor::ShutdownToken;
use crate::validator::Validator;
use crate::{DlqItem, DlqReason, OwnerId, PointRecord, QueueItem, QueueItemId, QueueType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

// ============================================================================
// Worker State
// ============================================================================

/// Position of a worker within its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Fetching,
    Validating,
    Persisting,
    Succeeded,
    Retrying,
    DeadLettered,
}

impl WorkerState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Fetching => 1,
            Self::Validating => 2,
            Self::Persisting => 3,
            Self::Succeeded => 4,
            Self::Retrying => 5,
            Self::DeadLettered => 6,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Fetching,
            2 => Self::Validating,
            3 => Self::Persisting,
            4 => Self::Succeeded,
            5 => Self::Retrying,
            6 => Self::DeadLettered,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Validating => "validating",
            Self::Persisting => "persisting",
            Self::Succeeded => "succeeded",
            Self::Retrying => "retrying",
            Self::DeadLettered => "dead_lettered",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Cycle Report
// ============================================================================

/// An item moved to the dead-letter store during a cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterSummary {
    pub item_id: QueueItemId,
    pub reason: DlqReason,
    pub count: usize,
}

/// An item rescheduled during a cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledRetry {
    pub item_id: QueueItemId,

    /// Retry count the item was re-enqueued with
    pub retry_count: u32,

    /// Delay before the item becomes due again
    pub delay_ms: u64,
}

/// What one worker cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Entries popped from the queue, including malformed ones
    pub fetched_items: usize,

    /// Entries that could not be decoded
    pub malformed: usize,

    /// Points handed to the point store successfully
    pub persisted_points: usize,

    pub dead_lettered: Vec<DeadLetterSummary>,

    pub retries: Vec<ScheduledRetry>,
}

impl CycleReport {
    /// True when the cycle found nothing to do
    pub fn is_empty(&self) -> bool {
        self.fetched_items == 0
    }

    fn merge(&mut self, other: CycleReport) {
        self.fetched_items += other.fetched_items;
        self.malformed += other.malformed;
        self.persisted_points += other.persisted_points;
        self.dead_lettered.extend(other.dead_lettered);
        self.retries.extend(other.retries);
    }
}

// ============================================================================
// Consumer Worker
// ============================================================================

/// What to put back into the queue if a dead-letter write fails
enum Restore {
    Item(QueueItem),
    Malformed(MalformedEntry),
}

/// Consumer for a single queue type
///
/// Cheap to clone; clones share counters and state.
#[derive(Debug, Clone)]
pub struct ConsumerWorker {
    queue_type: QueueType,
    queue: IngestQueue,
    validator: Validator,
    sink: PersistenceSink,
    retry_policy: RetryPolicy,
    counters: Arc<QueueCounters>,
    state: Arc<AtomicU8>,
    poll_interval: Duration,
    batch_size: usize,
}

impl ConsumerWorker {
    /// Create a worker with a one second poll interval and a batch size of 200
    pub fn new(
        queue_type: QueueType,
        queue: IngestQueue,
        validator: Validator,
        sink: PersistenceSink,
        retry_policy: RetryPolicy,
        counters: Arc<QueueCounters>,
    ) -> Self {
        Self {
            queue_type,
            queue,
            validator,
            sink,
            retry_policy,
            counters,
            state: Arc::new(AtomicU8::new(WorkerState::Idle.as_u8())),
            poll_interval: Duration::from_secs(1),
            batch_size: 200,
        }
    }

    /// Set the sleep between polls when no work is available
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the number of items fetched per cycle (at least one)
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Current position within the cycle
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, next: WorkerState) {
        let previous = WorkerState::from_u8(self.state.swap(next.as_u8(), Ordering::SeqCst));
        if previous != next {
            debug!(
                queue_type = %self.queue_type,
                from = %previous,
                to = %next,
                "Worker state transition"
            );
        }
    }

    /// Run cycles until `shutdown` is cancelled
    ///
    /// Sleeps one poll interval after an empty cycle or a queue store error;
    /// otherwise fetches again immediately. A cycle that has started always
    /// completes before shutdown is observed.
    pub async fn run(&self, shutdown: ShutdownToken) {
        info!(
            queue_type = %self.queue_type,
            batch_size = self.batch_size,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Consumer worker started"
        );

        while !shutdown.is_cancelled() {
            let idle = match self.run_cycle(self.batch_size).await {
                Ok(report) => report.is_empty(),
                Err(e) => {
                    warn!(
                        queue_type = %self.queue_type,
                        error = %e,
                        transient = e.is_transient(),
                        "Queue store error, backing off"
                    );
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        self.transition(WorkerState::Idle);
        info!(queue_type = %self.queue_type, "Consumer worker stopped");
    }

    /// Process cycles until `max_items` entries have been fetched or the queue has nothing due
    pub async fn drain(&self, max_items: usize) -> Result<CycleReport, StoreError> {
        let mut total = CycleReport::default();

        while total.fetched_items < max_items {
            let remaining = max_items - total.fetched_items;
            let report = self.run_cycle(remaining.min(self.batch_size)).await?;
            if report.is_empty() {
                break;
            }
            total.merge(report);
        }

        Ok(total)
    }

    /// Run a single fetch-validate-persist cycle over up to `batch_size` items
    ///
    /// # Errors
    ///
    /// Only a failure to fetch from the queue store is returned; every other
    /// failure is resolved into a retry or a dead-letter entry and reflected
    /// in the report.
    pub async fn run_cycle(&self, batch_size: usize) -> Result<CycleReport, StoreError> {
        self.transition(WorkerState::Fetching);

        let entries = match self.queue.dequeue_batch(self.queue_type, batch_size).await {
            Ok(entries) => entries,
            Err(e) => {
                self.transition(WorkerState::Idle);
                return Err(e);
            }
        };

        let mut report = CycleReport {
            fetched_items: entries.len(),
            ..CycleReport::default()
        };
        if entries.is_empty() {
            self.transition(WorkerState::Idle);
            return Ok(report);
        }

        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                DequeuedEntry::Item(item) => items.push(item),
                DequeuedEntry::Malformed(malformed) => {
                    error!(
                        queue_type = %self.queue_type,
                        error = %malformed.error,
                        payload = %malformed.payload,
                        "Dropping undecodable queue entry into dead-letter store"
                    );
                    report.malformed += 1;
                    let dlq_item = malformed.clone().into_dlq_item();
                    self.dead_letter(dlq_item, Restore::Malformed(malformed), &mut report)
                        .await;
                }
            }
        }

        let held = items.len() as u64;
        self.counters.begin_in_flight(held);
        self.process_items(items, &mut report).await;
        self.counters.end_in_flight(held);

        info!(
            queue_type = %self.queue_type,
            fetched = report.fetched_items,
            malformed = report.malformed,
            persisted_points = report.persisted_points,
            dead_lettered = report.dead_lettered.len(),
            retried = report.retries.len(),
            "Worker cycle complete"
        );

        self.transition(WorkerState::Idle);
        Ok(report)
    }

    async fn process_items(&self, items: Vec<QueueItem>, report: &mut CycleReport) {
        if items.is_empty() {
            return;
        }

        self.transition(WorkerState::Validating);

        let all_points: Vec<PointRecord> = items
            .iter()
            .flat_map(|item| item.points.iter().cloned())
            .collect();

        let outcome = match self.validator.validate(self.queue_type, all_points).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    queue_type = %self.queue_type,
                    items = items.len(),
                    error = %e,
                    "Owner validation failed, rescheduling batch"
                );
                for item in items {
                    self.retry_or_dead_letter(item, &e, report).await;
                }
                return;
            }
        };

        // Owner existence decides validity, so each item can be split by owner.
        let missing: HashSet<OwnerId> = outcome.invalid.iter().map(|p| p.owner).collect();

        let mut pending = Vec::with_capacity(items.len());
        for mut item in items {
            let (valid, invalid): (Vec<_>, Vec<_>) = std::mem::take(&mut item.points)
                .into_iter()
                .partition(|p| !missing.contains(&p.owner));

            if !invalid.is_empty() {
                warn!(
                    queue_type = %self.queue_type,
                    item_id = %item.id,
                    invalid_points = invalid.len(),
                    "Points reference unknown owners"
                );
                let subset = QueueItem {
                    points: invalid,
                    ..item.clone()
                };
                let dlq_item = DlqItem::from_item(
                    &subset,
                    subset.points.clone(),
                    DlqReason::UnknownParentReference,
                );
                self.dead_letter(dlq_item, Restore::Item(subset), report).await;
            }

            if !valid.is_empty() {
                item.points = valid;
                pending.push(item);
            }
        }

        if pending.is_empty() {
            return;
        }

        self.transition(WorkerState::Persisting);
        let batch: Vec<PointRecord> = pending
            .iter()
            .flat_map(|item| item.points.iter().cloned())
            .collect();

        match self.sink.persist_batch(self.queue_type, &batch).await {
            Ok(_) => {
                self.record_persisted(batch.len(), report);
            }
            Err(e) if e.is_retryable() => {
                for item in pending {
                    self.retry_or_dead_letter(item, &e, report).await;
                }
            }
            Err(e) if pending.len() > 1 => {
                warn!(
                    queue_type = %self.queue_type,
                    items = pending.len(),
                    error = %e,
                    "Batch rejected, persisting items individually"
                );
                for item in pending {
                    self.persist_single(item, report).await;
                }
            }
            Err(e) => {
                for item in pending {
                    self.dead_letter_structural(item, &e, report).await;
                }
            }
        }
    }

    async fn persist_single(&self, item: QueueItem, report: &mut CycleReport) {
        match self.sink.persist_batch(self.queue_type, &item.points).await {
            Ok(_) => self.record_persisted(item.point_count(), report),
            Err(e) if e.is_retryable() => self.retry_or_dead_letter(item, &e, report).await,
            Err(e) => self.dead_letter_structural(item, &e, report).await,
        }
    }

    fn record_persisted(&self, points: usize, report: &mut CycleReport) {
        self.transition(WorkerState::Succeeded);
        self.counters.record_processed(points as u64);
        report.persisted_points += points;
    }

    async fn dead_letter_structural(
        &self,
        item: QueueItem,
        error: &PersistenceError,
        report: &mut CycleReport,
    ) {
        let reason = DlqReason::StructuralFailure {
            message: error.to_string(),
        };
        let dlq_item = DlqItem::from_item(&item, item.points.clone(), reason);
        self.dead_letter(dlq_item, Restore::Item(item), report).await;
    }

    async fn retry_or_dead_letter(
        &self,
        mut item: QueueItem,
        error: &PersistenceError,
        report: &mut CycleReport,
    ) {
        match self.retry_policy.decide(item.retry_count) {
            RetryDecision::Retry {
                next_retry_count,
                delay,
            } => {
                self.transition(WorkerState::Retrying);
                item.retry_count = next_retry_count;
                let item_id = item.id;
                let fallback = item.clone();

                match self.queue.requeue(item, delay).await {
                    Ok(_) => {
                        info!(
                            queue_type = %self.queue_type,
                            item_id = %item_id,
                            retry_count = next_retry_count,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Scheduled retry"
                        );
                        self.counters.record_retried(1);
                        report.retries.push(ScheduledRetry {
                            item_id,
                            retry_count: next_retry_count,
                            delay_ms: delay.as_millis() as u64,
                        });
                    }
                    Err(e) => {
                        error!(
                            queue_type = %self.queue_type,
                            item_id = %item_id,
                            error = %e,
                            "Failed to requeue item, moving it to the dead-letter store"
                        );
                        let reason = DlqReason::RequeueFailed {
                            message: e.to_string(),
                        };
                        let dlq_item =
                            DlqItem::from_item(&fallback, fallback.points.clone(), reason);
                        self.dead_letter(dlq_item, Restore::Item(fallback), report)
                            .await;
                    }
                }
            }
            RetryDecision::DeadLetter => {
                warn!(
                    queue_type = %self.queue_type,
                    item_id = %item.id,
                    retry_count = item.retry_count,
                    error = %error,
                    "Retries exhausted"
                );
                let dlq_item =
                    DlqItem::from_item(&item, item.points.clone(), DlqReason::MaxRetriesExceeded);
                self.dead_letter(dlq_item, Restore::Item(item), report).await;
            }
        }
    }

    async fn dead_letter(&self, item: DlqItem, restore: Restore, report: &mut CycleReport) {
        self.transition(WorkerState::DeadLettered);

        let e = match self.queue.dead_letter(&item).await {
            Ok(()) => {
                warn!(
                    queue_type = %self.queue_type,
                    item_id = %item.id,
                    reason = %item.reason,
                    count = item.count,
                    retry_count = item.retry_count,
                    "Moved item to dead-letter store"
                );
                // Malformed entries carry no points but still count as one failure.
                self.counters.record_failed(item.count.max(1) as u64);
                self.counters.record_dead_lettered(1);
                report.dead_lettered.push(DeadLetterSummary {
                    item_id: item.id,
                    reason: item.reason,
                    count: item.count,
                });
                return;
            }
            Err(e) => e,
        };

        let restored = match restore {
            Restore::Item(queued) => self
                .queue
                .requeue(queued, self.poll_interval)
                .await
                .map(|_| ()),
            Restore::Malformed(entry) => {
                self.queue
                    .restore_malformed(entry, self.poll_interval)
                    .await
            }
        };

        match restored {
            Ok(()) => {
                warn!(
                    queue_type = %self.queue_type,
                    item_id = %item.id,
                    reason = %item.reason,
                    error = %e,
                    delay_ms = self.poll_interval.as_millis() as u64,
                    "Failed to write dead-letter item; returned it to the queue"
                );
            }
            Err(restore_error) => {
                let points = serde_json::to_string(&item.points).unwrap_or_default();
                error!(
                    queue_type = %self.queue_type,
                    item_id = %item.id,
                    reason = %item.reason,
                    error = %e,
                    restore_error = %restore_error,
                    points = %points,
                    raw_payload = item.raw_payload.as_deref().unwrap_or(""),
                    "Failed to write dead-letter item and to return it to the queue; points logged for manual recovery"
                );
            }
        }
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
