//! # In-Memory Queue Store
//!
//! Thread-safe queue store for tests, development and single-process
//! deployments. Each queue type owns one partition behind its own lock, so
//! every trait operation is a single critical section and `pop_due` can
//! never hand the same entry to two consumers.

use crate::error::StoreError;
use crate::queue_store::{ClearCounts, QueueStore, StoredDeadLetter, StoredEntry};
use crate::{QueueType, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Ordering key: score first, insertion sequence as tie-breaker
#[derive(Debug, Clone, Copy)]
struct ScoreKey {
    score: f64,
    seq: u64,
}

impl PartialEq for ScoreKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for ScoreKey {}

impl PartialOrd for ScoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoreKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.score
            .total_cmp(&other.score)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Default)]
struct Partition {
    queue: BTreeMap<ScoreKey, StoredEntry>,
    dead_letter: VecDeque<StoredDeadLetter>,
    next_seq: u64,
}

impl Partition {
    fn insert(&mut self, entry: StoredEntry) {
        let key = ScoreKey {
            score: entry.score,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.queue.insert(key, entry);
    }

    fn count_older_than(&self, cutoff: Timestamp) -> ClearCounts {
        ClearCounts {
            queue: self
                .queue
                .values()
                .filter(|e| e.enqueued_at < cutoff)
                .count(),
            dead_letter: self
                .dead_letter
                .iter()
                .filter(|e| e.failed_at < cutoff)
                .count(),
        }
    }
}

/// Serializable image of every partition, oldest entries first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct StoreSnapshot {
    pub partitions: Vec<PartitionSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PartitionSnapshot {
    pub queue_type: QueueType,
    pub queue: Vec<StoredEntry>,
    pub dead_letter: Vec<StoredDeadLetter>,
}

impl StoreSnapshot {
    fn partition_mut(&mut self, queue_type: QueueType) -> &mut PartitionSnapshot {
        let index = match self
            .partitions
            .iter()
            .position(|p| p.queue_type == queue_type)
        {
            Some(index) => index,
            None => {
                self.partitions.push(PartitionSnapshot {
                    queue_type,
                    queue: Vec::new(),
                    dead_letter: Vec::new(),
                });
                self.partitions.len() - 1
            }
        };
        &mut self.partitions[index]
    }

    /// Add a queue entry to the image without touching the live store
    pub fn with_entry(mut self, queue_type: QueueType, entry: StoredEntry) -> Self {
        self.partition_mut(queue_type).queue.push(entry);
        self
    }

    /// Add a dead-letter entry to the image without touching the live store
    pub fn with_dead_letter(mut self, queue_type: QueueType, entry: StoredDeadLetter) -> Self {
        self.partition_mut(queue_type).dead_letter.push(entry);
        self
    }
}

/// In-memory queue store
///
/// Cheap to clone; clones share the same partitions.
///
/// # Examples
///
/// ```rust
/// use track_queue_core::adapters::MemoryQueueStore;
/// use track_queue_core::{IngestQueue, QueueType};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), track_queue_core::StoreError> {
/// let queue = IngestQueue::new(Arc::new(MemoryQueueStore::new()));
/// assert_eq!(queue.size(QueueType::Upload).await?, 0);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MemoryQueueStore {
    partitions: Arc<HashMap<QueueType, Mutex<Partition>>>,
    unavailable: Arc<AtomicBool>,
    failing_inserts: Arc<AtomicU32>,
    failing_dlq_inserts: Arc<AtomicU32>,
}

impl std::fmt::Debug for MemoryQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryQueueStore")
            .field("partitions", &self.partitions.len())
            .field("unavailable", &self.unavailable.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueueStore {
    /// Create an empty store with one partition per queue type
    pub fn new() -> Self {
        let partitions = QueueType::ALL
            .iter()
            .map(|qt| (*qt, Mutex::new(Partition::default())))
            .collect();

        Self {
            partitions: Arc::new(partitions),
            unavailable: Arc::new(AtomicBool::new(false)),
            failing_inserts: Arc::new(AtomicU32::new(0)),
            failing_dlq_inserts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Simulate loss of connectivity: every operation fails with
    /// [`StoreError::Unavailable`] until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `count` queue inserts with [`StoreError::Unavailable`]
    pub fn fail_next_inserts(&self, count: u32) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` dead-letter inserts with [`StoreError::Unavailable`]
    pub fn fail_next_dlq_inserts(&self, count: u32) {
        self.failing_dlq_inserts.store(count, Ordering::SeqCst);
    }

    fn injected_failure(counter: &AtomicU32, operation: &str) -> Result<(), StoreError> {
        let failing = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable {
                message: format!("injected {} failure", operation),
            });
        }
        Ok(())
    }

    fn lock(&self, queue_type: QueueType) -> Result<MutexGuard<'_, Partition>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                message: "memory queue store marked unavailable".to_string(),
            });
        }

        let partition = self
            .partitions
            .get(&queue_type)
            .ok_or_else(|| StoreError::Unavailable {
                message: format!("no partition for {}", queue_type),
            })?;

        partition.lock().map_err(|_| StoreError::Unavailable {
            message: format!("partition lock for {} poisoned", queue_type),
        })
    }

    /// Copy every partition into a serializable image
    pub(crate) fn snapshot(&self) -> Result<StoreSnapshot, StoreError> {
        let mut partitions = Vec::with_capacity(QueueType::ALL.len());
        for queue_type in QueueType::ALL {
            let partition = self.lock(queue_type)?;
            partitions.push(PartitionSnapshot {
                queue_type,
                queue: partition.queue.values().cloned().collect(),
                dead_letter: partition.dead_letter.iter().cloned().collect(),
            });
        }
        Ok(StoreSnapshot { partitions })
    }

    /// Replace the contents of the store with `snapshot`
    pub(crate) fn restore(&self, snapshot: StoreSnapshot) -> Result<(), StoreError> {
        for queue_type in QueueType::ALL {
            let mut partition = self.lock(queue_type)?;
            *partition = Partition::default();
        }

        for image in snapshot.partitions {
            let mut partition = self.lock(image.queue_type)?;
            for entry in image.queue {
                partition.insert(entry);
            }
            partition.dead_letter.extend(image.dead_letter);
        }
        Ok(())
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn insert(&self, queue_type: QueueType, entry: StoredEntry) -> Result<(), StoreError> {
        Self::injected_failure(&self.failing_inserts, "insert")?;
        self.lock(queue_type)?.insert(entry);
        Ok(())
    }

    async fn pop_due(
        &self,
        queue_type: QueueType,
        max_items: usize,
        due_at: f64,
    ) -> Result<Vec<StoredEntry>, StoreError> {
        let mut partition = self.lock(queue_type)?;
        let mut popped = Vec::new();

        while popped.len() < max_items {
            let is_due = partition
                .queue
                .first_key_value()
                .is_some_and(|(key, _)| key.score <= due_at);
            if !is_due {
                break;
            }
            if let Some((_, entry)) = partition.queue.pop_first() {
                popped.push(entry);
            }
        }

        Ok(popped)
    }

    async fn pending_count(&self, queue_type: QueueType) -> Result<usize, StoreError> {
        Ok(self.lock(queue_type)?.queue.len())
    }

    async fn dlq_insert(
        &self,
        queue_type: QueueType,
        entry: StoredDeadLetter,
    ) -> Result<(), StoreError> {
        Self::injected_failure(&self.failing_dlq_inserts, "dead-letter insert")?;
        self.lock(queue_type)?.dead_letter.push_back(entry);
        Ok(())
    }

    async fn dlq_pop(
        &self,
        queue_type: QueueType,
        limit: usize,
    ) -> Result<Vec<StoredDeadLetter>, StoreError> {
        let mut partition = self.lock(queue_type)?;
        let take = limit.min(partition.dead_letter.len());
        Ok(partition.dead_letter.drain(..take).collect())
    }

    async fn dlq_peek(
        &self,
        queue_type: QueueType,
        limit: usize,
    ) -> Result<Vec<StoredDeadLetter>, StoreError> {
        let partition = self.lock(queue_type)?;
        Ok(partition.dead_letter.iter().take(limit).cloned().collect())
    }

    async fn dlq_count(&self, queue_type: QueueType) -> Result<usize, StoreError> {
        Ok(self.lock(queue_type)?.dead_letter.len())
    }

    async fn clear(
        &self,
        queue_type: QueueType,
        include_dlq: bool,
    ) -> Result<ClearCounts, StoreError> {
        let mut partition = self.lock(queue_type)?;
        let mut counts = ClearCounts {
            queue: partition.queue.len(),
            dead_letter: 0,
        };
        partition.queue.clear();

        if include_dlq {
            counts.dead_letter = partition.dead_letter.len();
            partition.dead_letter.clear();
        }

        Ok(counts)
    }

    async fn count_older_than(
        &self,
        queue_type: QueueType,
        cutoff: Timestamp,
    ) -> Result<ClearCounts, StoreError> {
        Ok(self.lock(queue_type)?.count_older_than(cutoff))
    }

    async fn purge_older_than(
        &self,
        queue_type: QueueType,
        cutoff: Timestamp,
    ) -> Result<ClearCounts, StoreError> {
        let mut partition = self.lock(queue_type)?;
        let counts = partition.count_older_than(cutoff);
        partition.queue.retain(|_, e| e.enqueued_at >= cutoff);
        partition.dead_letter.retain(|e| e.failed_at >= cutoff);
        Ok(counts)
    }
}

#[cfg(test)]
#[path = "memory_queue_store_tests.rs"]
mod tests;
