//! Owner-reference validation gate.
//!
//! Points can arrive before the parent row they reference has committed.
//! Instead of failing a whole batch, the validator isolates the points whose
//! owner is missing so the rest can be persisted.

use crate::error::PersistenceError;
use crate::persistence::{with_timeout, PointStore};
use crate::{OwnerId, PointRecord, QueueType};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Points split by whether their owner currently exists
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationOutcome {
    pub valid: Vec<PointRecord>,
    pub invalid: Vec<PointRecord>,
}

/// Partitions point batches by owner existence
#[derive(Clone)]
pub struct Validator {
    store: Arc<dyn PointStore>,
    timeout: Duration,
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("store", &"<PointStore>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Validator {
    pub fn new(store: Arc<dyn PointStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Split `points` into those whose owner exists and those whose owner does not
    ///
    /// Queue types without a parent table accept every point without a
    /// lookup. Otherwise the distinct owner ids are checked with a single
    /// `exists_batch` call. Input order is preserved within each half.
    ///
    /// # Errors
    ///
    /// Propagates lookup failures (including timeouts); the caller treats
    /// them like any other retryable persistence failure.
    pub async fn validate(
        &self,
        queue_type: QueueType,
        points: Vec<PointRecord>,
    ) -> Result<ValidationOutcome, PersistenceError> {
        if points.is_empty() || !queue_type.requires_owner_check() {
            return Ok(ValidationOutcome {
                valid: points,
                invalid: Vec::new(),
            });
        }

        let owners: Vec<OwnerId> = points
            .iter()
            .map(|p| p.owner)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let existing = with_timeout(
            self.timeout,
            self.store.exists_batch(queue_type, &owners),
        )
        .await?;

        let (valid, invalid): (Vec<_>, Vec<_>) = points
            .into_iter()
            .partition(|p| existing.contains(&p.owner));

        debug!(
            queue_type = %queue_type,
            owners = owners.len(),
            valid = valid.len(),
            invalid = invalid.len(),
            "Validated owner references"
        );

        Ok(ValidationOutcome { valid, invalid })
    }
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod tests;
