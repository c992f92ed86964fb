//! Service facade bundling the queue, workers and administrative operations.
//!
//! [`IngestService`] is the single handle producers, the HTTP layer and the
//! binary use. It owns nothing exclusively: clones share the queue store,
//! point store and counters.

use crate::config::IngestConfig;
use crate::dead_letter::{CleanupReport, DeadLetterManager, DlqInspection, ReplayReport};
use crate::error::{AdminError, StoreError};
use crate::health::{evaluate_health, HealthReport, QueueStats, StatsReporter};
use crate::persistence::{PersistenceSink, PointStore};
use crate::queue_store::{ClearCounts, IngestQueue, QueueStore};
use crate::retry::RetryPolicy;
use crate::supervisor::{ShutdownToken, WorkerSupervisor};
use crate::validator::Validator;
use crate::worker::{ConsumerWorker, CycleReport};
use crate::{PointRecord, QueueItemId, QueueType};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Handle exposing the whole ingestion interface
///
/// # Examples
///
/// ```rust
/// use track_queue_core::{
///     IngestConfig, IngestService, MemoryPointStore, MemoryQueueStore, OwnerId, PointRecord,
///     Position, QueueType, Timestamp,
/// };
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let points = MemoryPointStore::new();
/// points.add_owner(QueueType::Upload, OwnerId::new(1));
///
/// let service = IngestService::new(
///     Arc::new(MemoryQueueStore::new()),
///     Arc::new(points.clone()),
///     IngestConfig::default(),
/// );
///
/// let point = PointRecord::new(OwnerId::new(1), Timestamp::now(), Position::new(52.0, 4.0));
/// service.enqueue(QueueType::Upload, vec![point], None).await?;
/// service.force_process(QueueType::Upload, 10).await?;
///
/// assert_eq!(points.row_count(QueueType::Upload), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct IngestService {
    queue: IngestQueue,
    validator: Validator,
    sink: PersistenceSink,
    retry_policy: RetryPolicy,
    stats: StatsReporter,
    dead_letters: DeadLetterManager,
    config: Arc<IngestConfig>,
}

impl IngestService {
    /// Wire a service over the given stores
    pub fn new(
        queue_store: Arc<dyn QueueStore>,
        point_store: Arc<dyn PointStore>,
        config: IngestConfig,
    ) -> Self {
        let timeout = config.worker.operation_timeout();
        let queue = IngestQueue::new(queue_store);
        let validator = Validator::new(point_store.clone(), timeout);
        let sink = PersistenceSink::new(point_store, timeout);
        let retry_policy = RetryPolicy::from_settings(&config.retry);
        let stats = StatsReporter::new(queue.clone());
        let dead_letters = DeadLetterManager::new(
            queue.clone(),
            validator.clone(),
            sink.clone(),
            stats.clone(),
            config.dead_letter.clone(),
        );

        Self {
            queue,
            validator,
            sink,
            retry_policy,
            stats,
            dead_letters,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn queue(&self) -> &IngestQueue {
        &self.queue
    }

    pub fn stats_reporter(&self) -> &StatsReporter {
        &self.stats
    }

    // ------------------------------------------------------------------------
    // Producer interface
    // ------------------------------------------------------------------------

    /// Durably queue a batch of points for asynchronous persistence
    ///
    /// Returns as soon as the queue store accepted the batch.
    pub async fn enqueue(
        &self,
        queue_type: QueueType,
        points: Vec<PointRecord>,
        priority: Option<f64>,
    ) -> Result<QueueItemId, StoreError> {
        self.queue.enqueue(queue_type, points, priority).await
    }

    // ------------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------------

    pub async fn stats(&self, queue_type: QueueType) -> Result<QueueStats, StoreError> {
        self.stats.stats(queue_type).await
    }

    pub async fn all_stats(&self) -> Result<Vec<QueueStats>, StoreError> {
        self.stats.all_stats().await
    }

    /// Health verdict across all queue types
    pub async fn health(&self) -> Result<HealthReport, StoreError> {
        let stats = self.stats.all_stats().await?;
        Ok(evaluate_health(&stats, &self.config.health))
    }

    // ------------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------------

    /// Run one worker cycle over up to `batch_size` items right now
    ///
    /// Safe to call while the background worker is running; the atomic pop
    /// keeps the two from handling the same item.
    #[instrument(skip(self))]
    pub async fn force_process(
        &self,
        queue_type: QueueType,
        batch_size: usize,
    ) -> Result<CycleReport, AdminError> {
        if batch_size == 0 {
            return Err(AdminError::InvalidArgument {
                argument: "batch_size".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(self.worker(queue_type).run_cycle(batch_size).await?)
    }

    pub async fn replay_dlq(
        &self,
        queue_type: QueueType,
        limit: usize,
        dry_run: bool,
    ) -> Result<ReplayReport, AdminError> {
        self.dead_letters.replay(queue_type, limit, dry_run).await
    }

    pub async fn inspect_dlq(
        &self,
        queue_type: QueueType,
        limit: usize,
    ) -> Result<DlqInspection, AdminError> {
        self.dead_letters.inspect(queue_type, limit).await
    }

    /// Purge the queue of `queue_type` (and its dead-letter store if `include_dlq`)
    ///
    /// # Errors
    ///
    /// [`AdminError::ConfirmationRequired`] unless `confirm` is set.
    #[instrument(skip(self))]
    pub async fn clear_queue(
        &self,
        queue_type: QueueType,
        include_dlq: bool,
        confirm: bool,
    ) -> Result<ClearCounts, AdminError> {
        if !confirm {
            return Err(AdminError::ConfirmationRequired { queue_type });
        }

        let counts = self.queue.clear(queue_type, include_dlq).await?;
        warn!(
            queue_type = %queue_type,
            include_dlq = include_dlq,
            queue_removed = counts.queue,
            dead_letters_removed = counts.dead_letter,
            "Queue cleared by operator"
        );
        Ok(counts)
    }

    pub async fn cleanup(
        &self,
        max_age: Duration,
        dry_run: bool,
    ) -> Result<CleanupReport, AdminError> {
        self.dead_letters.cleanup_older_than(max_age, dry_run).await
    }

    // ------------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------------

    /// Consumer worker for `queue_type`, sharing this service's counters
    pub fn worker(&self, queue_type: QueueType) -> ConsumerWorker {
        ConsumerWorker::new(
            queue_type,
            self.queue.clone(),
            self.validator.clone(),
            self.sink.clone(),
            self.retry_policy.clone(),
            self.stats.counters(queue_type),
        )
        .with_poll_interval(self.config.worker.poll_interval())
        .with_batch_size(self.config.worker.batch_size)
    }

    /// Start one supervised worker per enabled queue type
    pub fn start_workers(&self, shutdown: ShutdownToken) -> WorkerSupervisor {
        let queues = self.config.worker.queues();
        info!(queues = ?queues, "Starting consumer workers");

        let workers = queues.into_iter().map(|qt| self.worker(qt)).collect();
        WorkerSupervisor::start(workers, self.config.worker.restart_delay(), shutdown)
    }
}

#[cfg(test)]
#[path = "service_tests.rs"]
mod tests;
