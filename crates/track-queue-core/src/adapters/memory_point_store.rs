//! # In-Memory Point Store
//!
//! Point store for tests and local development. Tracks a registry of
//! existing owners per parent table and the persisted rows per target
//! table, keyed by point identity so repeated upserts are no-ops.
//!
//! Faults can be injected to exercise the retry and dead-letter paths.

use crate::error::PersistenceError;
use crate::persistence::{PointStore, UpsertOutcome};
use crate::{OwnerId, PointIdentity, PointRecord, QueueType};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct State {
    owners: HashMap<&'static str, HashSet<OwnerId>>,
    rows: HashMap<&'static str, HashMap<PointIdentity, PointRecord>>,
    unavailable: bool,
    fail_next_upserts: u32,
    structural_failure: Option<String>,
    rejected_owners: HashSet<OwnerId>,
    upsert_delay: Option<Duration>,
    upsert_attempts: u64,
    exists_calls: u64,
}

/// In-memory point store with fault injection
///
/// Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryPointStore {
    state: Arc<Mutex<State>>,
}

impl MemoryPointStore {
    /// Create an empty store with no owners and no rows
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, PersistenceError> {
        self.state.lock().map_err(|_| PersistenceError::Unavailable {
            message: "point store state lock poisoned".to_string(),
        })
    }

    // Setup and inspection helpers ignore poisoning.
    fn state_for_setup(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `owner` in the parent table referenced by `queue_type`
    ///
    /// No-op for queue types without a parent table.
    pub fn add_owner(&self, queue_type: QueueType, owner: OwnerId) {
        if let Some(table) = queue_type.parent_table() {
            self.state_for_setup()
                .owners
                .entry(table)
                .or_default()
                .insert(owner);
        }
    }

    /// Remove `owner` from the parent table referenced by `queue_type`
    pub fn remove_owner(&self, queue_type: QueueType, owner: OwnerId) {
        if let Some(table) = queue_type.parent_table() {
            if let Some(owners) = self.state_for_setup().owners.get_mut(table) {
                owners.remove(&owner);
            }
        }
    }

    /// Fail every call with [`PersistenceError::Unavailable`] while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state_for_setup().unavailable = unavailable;
    }

    /// Fail the next `count` upserts with [`PersistenceError::Unavailable`]
    pub fn fail_next_upserts(&self, count: u32) {
        self.state_for_setup().fail_next_upserts = count;
    }

    /// Reject every upsert with [`PersistenceError::Structural`] while set
    pub fn set_structural_failure(&self, message: Option<String>) {
        self.state_for_setup().structural_failure = message;
    }

    /// Reject any upsert containing a point of `owner` as structurally invalid
    pub fn reject_points_of(&self, owner: OwnerId) {
        self.state_for_setup().rejected_owners.insert(owner);
    }

    /// Delay every upsert by `delay` (used to trigger timeouts)
    pub fn set_upsert_delay(&self, delay: Option<Duration>) {
        self.state_for_setup().upsert_delay = delay;
    }

    /// Number of `upsert_batch` calls received, including failed ones
    pub fn upsert_attempts(&self) -> u64 {
        self.state_for_setup().upsert_attempts
    }

    /// Number of `exists_batch` calls received
    pub fn exists_calls(&self) -> u64 {
        self.state_for_setup().exists_calls
    }

    /// Number of rows persisted into the target table of `queue_type`
    pub fn row_count(&self, queue_type: QueueType) -> usize {
        self.state_for_setup()
            .rows
            .get(queue_type.target_table())
            .map_or(0, HashMap::len)
    }

    /// Rows persisted into the target table of `queue_type`, in no particular order
    pub fn rows(&self, queue_type: QueueType) -> Vec<PointRecord> {
        self.state_for_setup()
            .rows
            .get(queue_type.target_table())
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PointStore for MemoryPointStore {
    async fn exists_batch(
        &self,
        queue_type: QueueType,
        owners: &[OwnerId],
    ) -> Result<HashSet<OwnerId>, PersistenceError> {
        let mut state = self.state()?;
        state.exists_calls += 1;

        if state.unavailable {
            return Err(PersistenceError::Unavailable {
                message: "point store marked unavailable".to_string(),
            });
        }

        let Some(table) = queue_type.parent_table() else {
            return Ok(owners.iter().copied().collect());
        };

        let existing = state.owners.get(table);
        Ok(owners
            .iter()
            .copied()
            .filter(|owner| existing.is_some_and(|set| set.contains(owner)))
            .collect())
    }

    async fn upsert_batch(
        &self,
        queue_type: QueueType,
        points: &[PointRecord],
    ) -> Result<UpsertOutcome, PersistenceError> {
        let delay = {
            let mut state = self.state()?;
            state.upsert_attempts += 1;
            state.upsert_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state()?;

        if state.unavailable {
            return Err(PersistenceError::Unavailable {
                message: "point store marked unavailable".to_string(),
            });
        }
        if state.fail_next_upserts > 0 {
            state.fail_next_upserts -= 1;
            return Err(PersistenceError::Unavailable {
                message: "injected upsert failure".to_string(),
            });
        }
        if let Some(message) = &state.structural_failure {
            return Err(PersistenceError::Structural {
                message: message.clone(),
            });
        }
        if let Some(point) = points
            .iter()
            .find(|p| state.rejected_owners.contains(&p.owner))
        {
            return Err(PersistenceError::Structural {
                message: format!("row for owner {} violates a table constraint", point.owner),
            });
        }

        let table = state.rows.entry(queue_type.target_table()).or_default();
        let mut outcome = UpsertOutcome::default();
        for point in points {
            let identity = point.identity();
            if table.contains_key(&identity) {
                outcome.skipped += 1;
            } else {
                table.insert(identity, point.clone());
                outcome.inserted += 1;
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
#[path = "memory_point_store_tests.rs"]
mod tests;
