//! Persistence layer abstraction and the time-bounded persistence sink.
//!
//! The durable point store is an external collaborator; this module defines
//! the two calls the queue makes against it (owner existence lookup and
//! conflict-ignoring bulk upsert) and wraps them with the configured timeout.

use crate::error::PersistenceError;
use crate::{OwnerId, PointRecord, QueueType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Rows written and rows skipped by an upsert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    /// Rows newly written
    pub inserted: usize,

    /// Rows skipped because their identity already existed
    pub skipped: usize,
}

/// Durable point storage
///
/// # Contract
///
/// - `upsert_batch` must silently skip points whose
///   `(owner, position, recorded_at)` identity already exists; a conflict on
///   that key is never an error
/// - connectivity problems map to [`PersistenceError::Unavailable`]
/// - rejections unrelated to the identity key (bad data, other constraints)
///   map to [`PersistenceError::Structural`]
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PointStore: Send + Sync {
    /// Return the subset of `owners` that currently exist in the parent table
    /// of `queue_type`
    async fn exists_batch(
        &self,
        queue_type: QueueType,
        owners: &[OwnerId],
    ) -> Result<HashSet<OwnerId>, PersistenceError>;

    /// Insert `points` into the target table of `queue_type`, ignoring
    /// identity conflicts
    async fn upsert_batch(
        &self,
        queue_type: QueueType,
        points: &[PointRecord],
    ) -> Result<UpsertOutcome, PersistenceError>;
}

/// Run `operation`, turning an elapsed `timeout` into [`PersistenceError::Timeout`]
pub(crate) async fn with_timeout<T, F>(timeout: Duration, operation: F) -> Result<T, PersistenceError>
where
    F: Future<Output = Result<T, PersistenceError>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(PersistenceError::Timeout { duration: timeout }),
    }
}

/// Time-bounded, idempotent batch writer
#[derive(Clone)]
pub struct PersistenceSink {
    store: Arc<dyn PointStore>,
    timeout: Duration,
}

impl std::fmt::Debug for PersistenceSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceSink")
            .field("store", &"<PointStore>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl PersistenceSink {
    pub fn new(store: Arc<dyn PointStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Persist `points` with one conflict-tolerant bulk upsert
    ///
    /// An empty batch succeeds without touching the store. A call that does
    /// not finish within the configured timeout fails with
    /// [`PersistenceError::Timeout`], which is retryable.
    pub async fn persist_batch(
        &self,
        queue_type: QueueType,
        points: &[PointRecord],
    ) -> Result<UpsertOutcome, PersistenceError> {
        if points.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        let result = with_timeout(self.timeout, self.store.upsert_batch(queue_type, points)).await;

        match &result {
            Ok(outcome) => debug!(
                queue_type = %queue_type,
                table = queue_type.target_table(),
                inserted = outcome.inserted,
                skipped = outcome.skipped,
                "Persisted point batch"
            ),
            Err(e) => warn!(
                queue_type = %queue_type,
                table = queue_type.target_table(),
                points = points.len(),
                retryable = e.is_retryable(),
                error = %e,
                "Point batch persistence failed"
            ),
        }

        result
    }
}

#[cfg(test)]
#[path = "persistence_tests.rs"]
mod tests;
