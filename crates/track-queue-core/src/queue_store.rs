//! Queue store abstraction and the typed queue facade built on top of it.
//!
//! [`QueueStore`] is the storage primitive: one ordered partition of encoded
//! entries per [`QueueType`], plus a parallel dead-letter partition. Its
//! [`QueueStore::pop_due`] operation must remove and return entries in a
//! single atomic step; two consumers can never receive the same entry.
//!
//! [`IngestQueue`] wraps a store with the enqueue/dequeue contract used by
//! producers and workers: it assigns priority scores, encodes items as JSON
//! and turns undecodable payloads into [`MalformedEntry`] values instead of
//! failing the whole batch.
//!
//! # Priority scores
//!
//! Fresh items receive a small, monotonically increasing arrival counter.
//! Retried items receive the epoch milliseconds at which they become due.
//! Dequeue only considers entries whose score is at or below the current
//! epoch milliseconds, so a retried item genuinely waits out its delay while
//! fresh items (whose counters are always far below the current time) are
//! served immediately, in arrival order.

use crate::error::StoreError;
use crate::{DlqItem, PointRecord, QueueItem, QueueItemId, QueueType, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

// ============================================================================
// Stored Entry Types
// ============================================================================

/// An encoded queue item as held by a [`QueueStore`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    /// Ordering key; lowest is served first
    pub score: f64,

    /// When the batch was first created (used for age-based cleanup)
    pub enqueued_at: Timestamp,

    /// JSON-encoded [`QueueItem`]
    pub payload: String,
}

/// An encoded dead-letter item as held by a [`QueueStore`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDeadLetter {
    /// When the batch was quarantined (used for age-based cleanup)
    pub failed_at: Timestamp,

    /// JSON-encoded [`DlqItem`]
    pub payload: String,
}

/// Number of entries removed (or matched) in the queue and dead-letter partitions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearCounts {
    pub queue: usize,
    pub dead_letter: usize,
}

impl ClearCounts {
    pub fn total(&self) -> usize {
        self.queue + self.dead_letter
    }
}

// ============================================================================
// Queue Store Trait
// ============================================================================

/// Ordered storage for pending and dead-lettered batches
///
/// Implementations must make every method atomic with respect to the others
/// for the same queue type. In particular `pop_due` must select and remove
/// entries in one step.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert an entry into the queue partition
    async fn insert(&self, queue_type: QueueType, entry: StoredEntry) -> Result<(), StoreError>;

    /// Atomically remove up to `max_items` lowest-score entries with `score <= due_at`
    ///
    /// Returns an empty vector without waiting when nothing is due.
    async fn pop_due(
        &self,
        queue_type: QueueType,
        max_items: usize,
        due_at: f64,
    ) -> Result<Vec<StoredEntry>, StoreError>;

    /// Number of entries in the queue partition (due or not)
    async fn pending_count(&self, queue_type: QueueType) -> Result<usize, StoreError>;

    /// Append an entry to the dead-letter partition
    async fn dlq_insert(
        &self,
        queue_type: QueueType,
        entry: StoredDeadLetter,
    ) -> Result<(), StoreError>;

    /// Atomically remove up to `limit` of the oldest dead-letter entries
    async fn dlq_pop(
        &self,
        queue_type: QueueType,
        limit: usize,
    ) -> Result<Vec<StoredDeadLetter>, StoreError>;

    /// Read up to `limit` of the oldest dead-letter entries without removing them
    async fn dlq_peek(
        &self,
        queue_type: QueueType,
        limit: usize,
    ) -> Result<Vec<StoredDeadLetter>, StoreError>;

    /// Number of entries in the dead-letter partition
    async fn dlq_count(&self, queue_type: QueueType) -> Result<usize, StoreError>;

    /// Remove every queue entry, and every dead-letter entry if `include_dlq`
    async fn clear(&self, queue_type: QueueType, include_dlq: bool)
        -> Result<ClearCounts, StoreError>;

    /// Count entries created before `cutoff`
    async fn count_older_than(
        &self,
        queue_type: QueueType,
        cutoff: Timestamp,
    ) -> Result<ClearCounts, StoreError>;

    /// Remove entries created before `cutoff`
    async fn purge_older_than(
        &self,
        queue_type: QueueType,
        cutoff: Timestamp,
    ) -> Result<ClearCounts, StoreError>;
}

// ============================================================================
// Dequeued Entries
// ============================================================================

/// A queue entry whose payload could not be decoded
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedEntry {
    pub queue_type: QueueType,
    pub payload: String,
    pub enqueued_at: Timestamp,
    pub error: String,
}

impl MalformedEntry {
    /// Convert into a single-entry dead-letter item
    pub fn into_dlq_item(self) -> DlqItem {
        DlqItem::malformed(self.queue_type, self.payload, self.enqueued_at, self.error)
    }
}

/// Result of decoding one popped entry
#[derive(Debug, Clone, PartialEq)]
pub enum DequeuedEntry {
    Item(QueueItem),
    Malformed(MalformedEntry),
}

// ============================================================================
// Typed Queue Facade
// ============================================================================

/// Typed enqueue/dequeue interface over a [`QueueStore`]
///
/// Cheap to clone; clones share the store and the arrival counter.
#[derive(Clone)]
pub struct IngestQueue {
    store: Arc<dyn QueueStore>,
    sequence: Arc<AtomicU64>,
}

impl std::fmt::Debug for IngestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestQueue")
            .field("store", &"<QueueStore>")
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .finish()
    }
}

impl IngestQueue {
    /// Create a queue facade over the given store
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    fn next_arrival_score(&self) -> f64 {
        (self.sequence.fetch_add(1, Ordering::SeqCst) + 1) as f64
    }

    /// Wrap `points` in a fresh queue item and insert it
    ///
    /// Without an explicit `priority` the item is ordered by arrival. Returns
    /// once the store has accepted the entry; persistence happens later.
    ///
    /// # Errors
    ///
    /// - [`StoreError::EmptyBatch`] when `points` is empty
    /// - [`StoreError::InvalidPriority`] for negative or non-finite priorities
    /// - transient store errors, which the caller may retry
    pub async fn enqueue(
        &self,
        queue_type: QueueType,
        points: Vec<PointRecord>,
        priority: Option<f64>,
    ) -> Result<QueueItemId, StoreError> {
        if points.is_empty() {
            return Err(StoreError::EmptyBatch { queue_type });
        }

        let score = match priority {
            Some(p) if !p.is_finite() || p < 0.0 => {
                return Err(StoreError::InvalidPriority { priority: p })
            }
            Some(p) => p,
            None => self.next_arrival_score(),
        };

        let item = QueueItem::new(queue_type, points, score);
        self.insert_item(&item).await?;

        debug!(
            queue_type = %queue_type,
            item_id = %item.id,
            points = item.point_count(),
            score = score,
            "Enqueued batch"
        );

        Ok(item.id)
    }

    /// Re-insert an item so it becomes due after `delay`
    ///
    /// Returns the score the item was stored with.
    pub async fn requeue(&self, mut item: QueueItem, delay: Duration) -> Result<f64, StoreError> {
        let due_at = Timestamp::now().add_duration(delay);
        item.priority_score = due_at.as_millis() as f64;
        self.insert_item(&item).await?;
        Ok(item.priority_score)
    }

    /// Put an undecodable entry back so it becomes due after `delay`
    ///
    /// Used when the entry could not be quarantined; the payload is stored
    /// verbatim.
    pub async fn restore_malformed(
        &self,
        entry: MalformedEntry,
        delay: Duration,
    ) -> Result<(), StoreError> {
        let due_at = Timestamp::now().add_duration(delay);
        self.store
            .insert(
                entry.queue_type,
                StoredEntry {
                    score: due_at.as_millis() as f64,
                    enqueued_at: entry.enqueued_at,
                    payload: entry.payload,
                },
            )
            .await
    }

    async fn insert_item(&self, item: &QueueItem) -> Result<(), StoreError> {
        let payload = serde_json::to_string(item)?;
        self.store
            .insert(
                item.queue_type,
                StoredEntry {
                    score: item.priority_score,
                    enqueued_at: item.enqueued_at,
                    payload,
                },
            )
            .await
    }

    /// Atomically remove up to `max_items` due items
    ///
    /// Never blocks: returns an empty vector when nothing is due. Entries
    /// that fail to decode (or decode to a different queue type) come back as
    /// [`DequeuedEntry::Malformed`] so the caller can quarantine them.
    pub async fn dequeue_batch(
        &self,
        queue_type: QueueType,
        max_items: usize,
    ) -> Result<Vec<DequeuedEntry>, StoreError> {
        if max_items == 0 {
            return Ok(Vec::new());
        }

        let due_at = Timestamp::now().as_millis() as f64;
        let entries = self.store.pop_due(queue_type, max_items, due_at).await?;

        Ok(entries
            .into_iter()
            .map(|entry| decode_entry(queue_type, entry))
            .collect())
    }

    /// Number of pending items (including retries that are not yet due)
    pub async fn size(&self, queue_type: QueueType) -> Result<usize, StoreError> {
        self.store.pending_count(queue_type).await
    }

    /// Number of dead-lettered items
    pub async fn dlq_size(&self, queue_type: QueueType) -> Result<usize, StoreError> {
        self.store.dlq_count(queue_type).await
    }

    /// Administrative purge
    pub async fn clear(
        &self,
        queue_type: QueueType,
        include_dlq: bool,
    ) -> Result<ClearCounts, StoreError> {
        self.store.clear(queue_type, include_dlq).await
    }

    /// Move an item into the dead-letter store
    pub async fn dead_letter(&self, item: &DlqItem) -> Result<(), StoreError> {
        let payload = serde_json::to_string(item)?;
        self.store
            .dlq_insert(
                item.original_queue_type,
                StoredDeadLetter {
                    failed_at: item.failed_at,
                    payload,
                },
            )
            .await
    }

    /// Atomically remove up to `limit` of the oldest dead-letter items
    pub async fn pop_dead_letters(
        &self,
        queue_type: QueueType,
        limit: usize,
    ) -> Result<Vec<DlqItem>, StoreError> {
        let entries = self.store.dlq_pop(queue_type, limit).await?;
        Ok(entries
            .into_iter()
            .map(|entry| decode_dead_letter(queue_type, entry))
            .collect())
    }

    /// Read up to `limit` of the oldest dead-letter items
    pub async fn peek_dead_letters(
        &self,
        queue_type: QueueType,
        limit: usize,
    ) -> Result<Vec<DlqItem>, StoreError> {
        let entries = self.store.dlq_peek(queue_type, limit).await?;
        Ok(entries
            .into_iter()
            .map(|entry| decode_dead_letter(queue_type, entry))
            .collect())
    }

    pub async fn count_older_than(
        &self,
        queue_type: QueueType,
        cutoff: Timestamp,
    ) -> Result<ClearCounts, StoreError> {
        self.store.count_older_than(queue_type, cutoff).await
    }

    pub async fn purge_older_than(
        &self,
        queue_type: QueueType,
        cutoff: Timestamp,
    ) -> Result<ClearCounts, StoreError> {
        self.store.purge_older_than(queue_type, cutoff).await
    }
}

fn decode_entry(queue_type: QueueType, entry: StoredEntry) -> DequeuedEntry {
    match serde_json::from_str::<QueueItem>(&entry.payload) {
        Ok(item) if item.queue_type == queue_type => DequeuedEntry::Item(item),
        Ok(item) => {
            warn!(
                queue_type = %queue_type,
                item_id = %item.id,
                found_type = %item.queue_type,
                "Queue entry belongs to a different queue type"
            );
            DequeuedEntry::Malformed(MalformedEntry {
                queue_type,
                payload: entry.payload,
                enqueued_at: entry.enqueued_at,
                error: format!("entry carries queue type {}", item.queue_type),
            })
        }
        Err(e) => DequeuedEntry::Malformed(MalformedEntry {
            queue_type,
            payload: entry.payload,
            enqueued_at: entry.enqueued_at,
            error: e.to_string(),
        }),
    }
}

// A corrupt dead-letter entry stays quarantined as a malformed item rather
// than disappearing.
fn decode_dead_letter(queue_type: QueueType, entry: StoredDeadLetter) -> DlqItem {
    match serde_json::from_str::<DlqItem>(&entry.payload) {
        Ok(item) => item,
        Err(e) => {
            warn!(
                queue_type = %queue_type,
                error = %e,
                "Dead-letter entry could not be decoded"
            );
            let mut item =
                DlqItem::malformed(queue_type, entry.payload, entry.failed_at, e.to_string());
            item.failed_at = entry.failed_at;
            item
        }
    }
}

#[cfg(test)]
#[path = "queue_store_tests.rs"]
mod tests;
