//! Counters, per-queue statistics and the health verdict.
//!
//! # Architecture
//!
//! - Workers update lock-free [`QueueCounters`] as batches move through
//!   their cycle
//! - [`StatsReporter`] combines those counters with live queue and DLQ
//!   sizes read from the queue store
//! - [`evaluate_health`] is a pure function from stats and thresholds to a
//!   verdict, so it can be tested without a running system
//!
//! # Examples
//!
//! ```rust
//! use track_queue_core::{evaluate_health, HealthStatus, HealthThresholds, QueueStats, QueueType};
//!
//! let stats = QueueStats {
//!     dlq_size: 11,
//!     ..QueueStats::empty(QueueType::Upload)
//! };
//!
//! let report = evaluate_health(&[stats], &HealthThresholds::default());
//! assert_eq!(report.status, HealthStatus::Degraded);
//! ```

use crate::config::HealthThresholds;
use crate::error::StoreError;
use crate::queue_store::IngestQueue;
use crate::QueueType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// Counters
// ============================================================================

/// Monotonic processing counters for one queue type
///
/// Values only grow, except `in_flight`, which tracks items currently held
/// by a worker cycle.
#[derive(Debug, Default)]
pub struct QueueCounters {
    in_flight: AtomicU64,
    processed_total: AtomicU64,
    failed_total: AtomicU64,
    retried_total: AtomicU64,
    dead_lettered_total: AtomicU64,
}

impl QueueCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_in_flight(&self, items: u64) {
        self.in_flight.fetch_add(items, Ordering::SeqCst);
    }

    /// Lower the in-flight gauge, saturating at zero
    pub fn end_in_flight(&self, items: u64) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(items))
            });
    }

    /// Points successfully persisted
    pub fn record_processed(&self, points: u64) {
        self.processed_total.fetch_add(points, Ordering::SeqCst);
    }

    /// Points (or malformed entries) moved to the dead-letter store
    pub fn record_failed(&self, points: u64) {
        self.failed_total.fetch_add(points, Ordering::SeqCst);
    }

    /// Items rescheduled for retry
    pub fn record_retried(&self, items: u64) {
        self.retried_total.fetch_add(items, Ordering::SeqCst);
    }

    /// Dead-letter items created
    pub fn record_dead_lettered(&self, items: u64) {
        self.dead_lettered_total.fetch_add(items, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn processed_total(&self) -> u64 {
        self.processed_total.load(Ordering::SeqCst)
    }

    pub fn failed_total(&self) -> u64 {
        self.failed_total.load(Ordering::SeqCst)
    }

    pub fn retried_total(&self) -> u64 {
        self.retried_total.load(Ordering::SeqCst)
    }

    pub fn dead_lettered_total(&self) -> u64 {
        self.dead_lettered_total.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Snapshot of one queue type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_type: QueueType,

    /// Items waiting in the queue, including retries not yet due
    pub pending: usize,

    /// Items currently held by a worker cycle
    pub in_flight: u64,

    /// Items in the dead-letter store
    pub dlq_size: usize,

    /// Points persisted since start
    pub processed_total: u64,

    /// Points dead-lettered since start
    pub failed_total: u64,

    /// Items rescheduled for retry since start
    pub retried_total: u64,
}

impl QueueStats {
    /// All-zero stats for `queue_type`
    pub fn empty(queue_type: QueueType) -> Self {
        Self {
            queue_type,
            pending: 0,
            in_flight: 0,
            dlq_size: 0,
            processed_total: 0,
            failed_total: 0,
            retried_total: 0,
        }
    }
}

/// Reads per-queue statistics from the queue and the shared counters
#[derive(Debug, Clone)]
pub struct StatsReporter {
    queue: IngestQueue,
    counters: Arc<HashMap<QueueType, Arc<QueueCounters>>>,
}

impl StatsReporter {
    /// Create a reporter with one fresh counter set per queue type
    pub fn new(queue: IngestQueue) -> Self {
        let counters = QueueType::ALL
            .iter()
            .map(|qt| (*qt, Arc::new(QueueCounters::new())))
            .collect();

        Self {
            queue,
            counters: Arc::new(counters),
        }
    }

    /// Counters shared with the worker of `queue_type`
    pub fn counters(&self, queue_type: QueueType) -> Arc<QueueCounters> {
        self.counters
            .get(&queue_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Current statistics for `queue_type`
    pub async fn stats(&self, queue_type: QueueType) -> Result<QueueStats, StoreError> {
        let counters = self.counters(queue_type);
        Ok(QueueStats {
            queue_type,
            pending: self.queue.size(queue_type).await?,
            in_flight: counters.in_flight(),
            dlq_size: self.queue.dlq_size(queue_type).await?,
            processed_total: counters.processed_total(),
            failed_total: counters.failed_total(),
            retried_total: counters.retried_total(),
        })
    }

    /// Statistics for every queue type, in [`QueueType::ALL`] order
    pub async fn all_stats(&self) -> Result<Vec<QueueStats>, StoreError> {
        let mut all = Vec::with_capacity(QueueType::ALL.len());
        for queue_type in QueueType::ALL {
            all.push(self.stats(queue_type).await?);
        }
        Ok(all)
    }
}

// ============================================================================
// Health Verdict
// ============================================================================

/// Overall or per-queue health
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Verdict for one queue, with the reasons that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueHealth {
    pub queue_type: QueueType,
    pub status: HealthStatus,
    pub pending: usize,
    pub dlq_size: usize,

    /// Human-readable threshold breaches; empty when healthy
    pub reasons: Vec<String>,
}

/// Overall verdict plus the per-queue breakdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub queues: Vec<QueueHealth>,
}

fn classify(value: usize, warn: usize, critical: usize) -> HealthStatus {
    if value > critical {
        HealthStatus::Critical
    } else if value > warn {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Derive the health verdict from queue statistics
///
/// A queue is critical when its pending count or DLQ size exceeds the
/// matching critical threshold, degraded when either exceeds the warn
/// threshold, and healthy otherwise. Values equal to a threshold do not
/// breach it. The overall status is the worst queue status; no queues means
/// healthy.
pub fn evaluate_health(stats: &[QueueStats], thresholds: &HealthThresholds) -> HealthReport {
    let queues: Vec<QueueHealth> = stats
        .iter()
        .map(|s| {
            let pending_status =
                classify(s.pending, thresholds.pending_warn, thresholds.pending_critical);
            let dlq_status = classify(s.dlq_size, thresholds.dlq_warn, thresholds.dlq_critical);

            let mut reasons = Vec::new();
            match pending_status {
                HealthStatus::Critical => reasons.push(format!(
                    "pending {} exceeds critical threshold {}",
                    s.pending, thresholds.pending_critical
                )),
                HealthStatus::Degraded => reasons.push(format!(
                    "pending {} exceeds warn threshold {}",
                    s.pending, thresholds.pending_warn
                )),
                HealthStatus::Healthy => {}
            }
            match dlq_status {
                HealthStatus::Critical => reasons.push(format!(
                    "dead-letter size {} exceeds critical threshold {}",
                    s.dlq_size, thresholds.dlq_critical
                )),
                HealthStatus::Degraded => reasons.push(format!(
                    "dead-letter size {} exceeds warn threshold {}",
                    s.dlq_size, thresholds.dlq_warn
                )),
                HealthStatus::Healthy => {}
            }

            QueueHealth {
                queue_type: s.queue_type,
                status: pending_status.max(dlq_status),
                pending: s.pending,
                dlq_size: s.dlq_size,
                reasons,
            }
        })
        .collect();

    let status = queues
        .iter()
        .map(|q| q.status)
        .max()
        .unwrap_or(HealthStatus::Healthy);

    HealthReport { status, queues }
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod tests;
