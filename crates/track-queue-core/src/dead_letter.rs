//! Dead-letter inspection, replay and age-based cleanup.
//!
//! Replay gives quarantined batches a second chance once the condition that
//! sent them there has been fixed (typically a parent row that finally
//! committed). Items are popped atomically, so two concurrent replays never
//! process the same item. Whatever still fails is pushed back with a
//! refreshed reason; the points that did persist are not kept, so a later
//! replay cannot write them twice.

use crate::config::DeadLetterConfig;
use crate::error::{AdminError, PersistenceError, StoreError};
use crate::health::StatsReporter;
use crate::persistence::PersistenceSink;
use crate::queue_store::{ClearCounts, IngestQueue};
use crate::validator::Validator;
use crate::{DlqItem, DlqReason, PointRecord, QueueItemId, QueueType, Timestamp};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, instrument, warn};

// ============================================================================
// Report Types
// ============================================================================

/// Operator-facing view of one dead-letter item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqSummary {
    pub id: QueueItemId,
    pub reason: DlqReason,
    pub count: usize,
    pub retry_count: u32,
    pub failed_at: Timestamp,
    pub enqueued_at: Timestamp,
    pub malformed: bool,
}

impl From<&DlqItem> for DlqSummary {
    fn from(item: &DlqItem) -> Self {
        Self {
            id: item.id,
            reason: item.reason.clone(),
            count: item.count,
            retry_count: item.retry_count,
            failed_at: item.failed_at,
            enqueued_at: item.enqueued_at,
            malformed: item.raw_payload.is_some(),
        }
    }
}

/// Dead-letter contents of one queue type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqInspection {
    pub queue_type: QueueType,

    /// Items in the dead-letter store
    pub count: usize,

    /// Oldest item, if any
    pub oldest: Option<DlqSummary>,

    /// Up to the requested number of items, oldest first
    pub items: Vec<DlqSummary>,
}

/// Outcome of a replay request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    /// Items taken from the dead-letter store (or examined, for a dry run)
    pub attempted: usize,

    /// Items whose points were all persisted (or would pass validation)
    pub reprocessed: usize,

    /// Items that failed again and went back to the dead-letter store
    pub still_failing: usize,

    /// Points persisted during the replay
    pub persisted_points: usize,

    /// Dead-letter items left after the replay
    pub remaining: usize,

    pub dry_run: bool,
}

/// Entries matched for one queue type during cleanup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCleanup {
    pub queue_type: QueueType,
    pub queue_entries: usize,
    pub dead_letters: usize,
}

/// Outcome of an age-based cleanup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Entries created before this instant were matched
    pub cutoff: Timestamp,
    pub dry_run: bool,
    pub queues: Vec<QueueCleanup>,
}

impl CleanupReport {
    /// Entries removed (or that would be removed) across all queue types
    pub fn total(&self) -> usize {
        self.queues
            .iter()
            .map(|q| q.queue_entries + q.dead_letters)
            .sum()
    }
}

// ============================================================================
// Dead-Letter Manager
// ============================================================================

/// Administrative operations over the dead-letter store
#[derive(Debug, Clone)]
pub struct DeadLetterManager {
    queue: IngestQueue,
    validator: Validator,
    sink: PersistenceSink,
    stats: StatsReporter,
    config: DeadLetterConfig,
}

enum ReplayOutcome {
    Reprocessed { points: usize },
    StillFailing { points: usize },
}

impl DeadLetterManager {
    pub fn new(
        queue: IngestQueue,
        validator: Validator,
        sink: PersistenceSink,
        stats: StatsReporter,
        config: DeadLetterConfig,
    ) -> Self {
        Self {
            queue,
            validator,
            sink,
            stats,
            config,
        }
    }

    /// Summarize the dead-letter store of `queue_type` without modifying it
    pub async fn inspect(
        &self,
        queue_type: QueueType,
        limit: usize,
    ) -> Result<DlqInspection, AdminError> {
        let count = self.queue.dlq_size(queue_type).await?;
        let peeked = self.queue.peek_dead_letters(queue_type, limit.max(1)).await?;
        let oldest = peeked.first().map(DlqSummary::from);
        let items = peeked.iter().take(limit).map(DlqSummary::from).collect();

        Ok(DlqInspection {
            queue_type,
            count,
            oldest,
            items,
        })
    }

    /// Re-run validation and persistence for up to `limit` dead-letter items
    ///
    /// `limit` is clamped to the configured maximum replay batch. A dry run
    /// only reads the oldest items and reports how many would currently pass
    /// validation; nothing is popped or persisted.
    ///
    /// # Errors
    ///
    /// - [`AdminError::InvalidArgument`] when `limit` is zero
    /// - store errors while reading or popping the dead-letter store
    /// - a store error when a still-failing item could not be written back;
    ///   the remaining items are still replayed first
    #[instrument(skip(self))]
    pub async fn replay(
        &self,
        queue_type: QueueType,
        limit: usize,
        dry_run: bool,
    ) -> Result<ReplayReport, AdminError> {
        if limit == 0 {
            return Err(AdminError::InvalidArgument {
                argument: "limit".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        let limit = limit.min(self.config.max_replay_batch);

        if dry_run {
            return self.replay_dry_run(queue_type, limit).await;
        }

        let items = self.queue.pop_dead_letters(queue_type, limit).await?;
        let mut report = ReplayReport {
            attempted: items.len(),
            ..ReplayReport::default()
        };

        let mut write_back_error = None;
        for item in items {
            match self.replay_item(queue_type, item).await {
                Ok(ReplayOutcome::Reprocessed { points }) => {
                    report.reprocessed += 1;
                    report.persisted_points += points;
                }
                Ok(ReplayOutcome::StillFailing { points }) => {
                    report.still_failing += 1;
                    report.persisted_points += points;
                }
                Err(e) => {
                    report.still_failing += 1;
                    write_back_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = write_back_error {
            return Err(AdminError::Store(e));
        }

        report.remaining = self.queue.dlq_size(queue_type).await?;

        info!(
            queue_type = %queue_type,
            attempted = report.attempted,
            reprocessed = report.reprocessed,
            still_failing = report.still_failing,
            remaining = report.remaining,
            "Dead-letter replay complete"
        );

        Ok(report)
    }

    async fn replay_dry_run(
        &self,
        queue_type: QueueType,
        limit: usize,
    ) -> Result<ReplayReport, AdminError> {
        let items = self.queue.peek_dead_letters(queue_type, limit).await?;
        let mut report = ReplayReport {
            attempted: items.len(),
            dry_run: true,
            ..ReplayReport::default()
        };

        for item in items {
            let passes = if item.raw_payload.is_some() || item.points.is_empty() {
                false
            } else {
                self.validator
                    .validate(queue_type, item.points)
                    .await?
                    .invalid
                    .is_empty()
            };

            if passes {
                report.reprocessed += 1;
            } else {
                report.still_failing += 1;
            }
        }

        report.remaining = self.queue.dlq_size(queue_type).await?;
        Ok(report)
    }

    /// Replay one item with a fresh retry budget
    ///
    /// Only fails when a still-failing subset could not be written back.
    async fn replay_item(
        &self,
        queue_type: QueueType,
        mut item: DlqItem,
    ) -> Result<ReplayOutcome, StoreError> {
        item.retry_count = 0;

        if item.raw_payload.is_some() || item.points.is_empty() {
            // Undecodable payloads can never succeed; keep them for operators.
            let reason = item.reason.clone();
            let points = item.points.clone();
            self.push_back(item, points, reason).await?;
            return Ok(ReplayOutcome::StillFailing { points: 0 });
        }

        let outcome = match self.validator.validate(queue_type, item.points.clone()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let reason = reason_for(&e);
                let points = item.points.clone();
                self.push_back(item, points, reason).await?;
                return Ok(ReplayOutcome::StillFailing { points: 0 });
            }
        };

        let mut failed = false;
        let mut write_back = Ok(());
        if !outcome.invalid.is_empty() {
            failed = true;
            write_back = self
                .push_back(
                    item.clone(),
                    outcome.invalid,
                    DlqReason::UnknownParentReference,
                )
                .await;
        }

        let mut persisted = 0;
        if !outcome.valid.is_empty() {
            match self.sink.persist_batch(queue_type, &outcome.valid).await {
                Ok(_) => {
                    persisted = outcome.valid.len();
                    self.stats
                        .counters(queue_type)
                        .record_processed(persisted as u64);
                }
                Err(e) => {
                    failed = true;
                    let reason = reason_for(&e);
                    let result = self.push_back(item, outcome.valid, reason).await;
                    write_back = write_back.and(result);
                }
            }
        }

        write_back?;
        if failed {
            Ok(ReplayOutcome::StillFailing { points: persisted })
        } else {
            Ok(ReplayOutcome::Reprocessed { points: persisted })
        }
    }

    /// Return the failing part of a replayed item to the dead-letter store
    ///
    /// The write is attempted twice. If both attempts fail the points are
    /// logged and the error is returned.
    async fn push_back(
        &self,
        original: DlqItem,
        points: Vec<PointRecord>,
        reason: DlqReason,
    ) -> Result<(), StoreError> {
        let item = DlqItem {
            count: if original.raw_payload.is_some() {
                original.count
            } else {
                points.len()
            },
            points,
            reason,
            failed_at: Timestamp::now(),
            retry_count: 0,
            ..original
        };

        let first = match self.queue.dead_letter(&item).await {
            Ok(()) => {
                warn!(
                    queue_type = %item.original_queue_type,
                    item_id = %item.id,
                    reason = %item.reason,
                    count = item.count,
                    "Replayed item failed again"
                );
                return Ok(());
            }
            Err(e) => e,
        };

        warn!(
            queue_type = %item.original_queue_type,
            item_id = %item.id,
            error = %first,
            "Failed to return item to dead-letter store, retrying once"
        );

        if let Err(e) = self.queue.dead_letter(&item).await {
            let points = serde_json::to_string(&item.points).unwrap_or_default();
            error!(
                queue_type = %item.original_queue_type,
                item_id = %item.id,
                error = %e,
                points = %points,
                raw_payload = item.raw_payload.as_deref().unwrap_or(""),
                "Failed to return item to dead-letter store; points logged for manual recovery"
            );
            return Err(e);
        }
        Ok(())
    }

    /// Purge queue entries and dead-letter items older than `max_age`
    ///
    /// With `dry_run` the matching entries are only counted.
    #[instrument(skip(self))]
    pub async fn cleanup_older_than(
        &self,
        max_age: Duration,
        dry_run: bool,
    ) -> Result<CleanupReport, AdminError> {
        if max_age.is_zero() {
            return Err(AdminError::InvalidArgument {
                argument: "max_age".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let cutoff = Timestamp::now().subtract_duration(max_age);
        let mut queues = Vec::with_capacity(QueueType::ALL.len());

        for queue_type in QueueType::ALL {
            let counts: ClearCounts = if dry_run {
                self.queue.count_older_than(queue_type, cutoff).await?
            } else {
                self.queue.purge_older_than(queue_type, cutoff).await?
            };
            queues.push(QueueCleanup {
                queue_type,
                queue_entries: counts.queue,
                dead_letters: counts.dead_letter,
            });
        }

        let report = CleanupReport {
            cutoff,
            dry_run,
            queues,
        };

        info!(
            cutoff = %cutoff,
            dry_run = dry_run,
            matched = report.total(),
            "Cleanup complete"
        );

        Ok(report)
    }
}

fn reason_for(error: &PersistenceError) -> DlqReason {
    if error.is_retryable() {
        DlqReason::MaxRetriesExceeded
    } else {
        DlqReason::StructuralFailure {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
#[path = "dead_letter_tests.rs"]
mod tests;
