//! # Filesystem Queue Store
//!
//! Single-node durable queue store. Entries live in a [`MemoryQueueStore`];
//! every mutation rewrites a JSON snapshot of the whole store using the
//! temp-file-then-rename pattern, and the snapshot is loaded again on start.
//!
//! Inserts are written to disk before they become visible in memory, so a
//! caller that receives `Ok` knows the entry survives a restart. Removals
//! are applied in memory first; if the snapshot rewrite then fails the
//! error is logged and the removed entries are still handed out.

use super::memory_queue_store::{MemoryQueueStore, StoreSnapshot};
use crate::error::StoreError;
use crate::queue_store::{ClearCounts, QueueStore, StoredDeadLetter, StoredEntry};
use crate::{QueueType, Timestamp};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info};

const SNAPSHOT_FILE: &str = "queue-store.json";

/// Snapshot-backed queue store
///
/// # Examples
///
/// ```no_run
/// use track_queue_core::adapters::FilesystemQueueStore;
/// use std::path::PathBuf;
/// # async fn example() -> Result<(), track_queue_core::StoreError> {
/// let store = FilesystemQueueStore::new(PathBuf::from("./data/queue")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct FilesystemQueueStore {
    inner: MemoryQueueStore,
    snapshot_path: PathBuf,
    write_lock: Mutex<()>,
}

impl FilesystemQueueStore {
    /// Open (or create) a store under `data_dir`
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be created or the
    /// snapshot cannot be read, and [`StoreError::Serialization`] if the
    /// snapshot is corrupt.
    pub async fn new(data_dir: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&data_dir).await?;

        let snapshot_path = data_dir.join(SNAPSHOT_FILE);
        let inner = MemoryQueueStore::new();

        if fs::try_exists(&snapshot_path).await? {
            let contents = fs::read_to_string(&snapshot_path).await?;
            let snapshot: StoreSnapshot = serde_json::from_str(&contents)?;
            let (pending, dead) = snapshot.partitions.iter().fold((0, 0), |(q, d), p| {
                (q + p.queue.len(), d + p.dead_letter.len())
            });
            inner.restore(snapshot)?;
            info!(
                path = %snapshot_path.display(),
                pending = pending,
                dead_lettered = dead,
                "Restored queue store snapshot"
            );
        }

        Ok(Self {
            inner,
            snapshot_path,
            write_lock: Mutex::new(()),
        })
    }

    /// Location of the snapshot file
    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    async fn write_snapshot(&self, snapshot: &StoreSnapshot) -> Result<(), StoreError> {
        let json = serde_json::to_vec(snapshot)?;

        // Write to temporary file first (atomic write pattern)
        let temp_path = self.snapshot_path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&json).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.snapshot_path).await?;
        Ok(())
    }

    async fn persist_current(&self, operation: &'static str) {
        let result = match self.inner.snapshot() {
            Ok(snapshot) => self.write_snapshot(&snapshot).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            error!(
                path = %self.snapshot_path.display(),
                operation = operation,
                error = %e,
                "Failed to write queue store snapshot"
            );
        }
    }
}

#[async_trait]
impl QueueStore for FilesystemQueueStore {
    async fn insert(&self, queue_type: QueueType, entry: StoredEntry) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.inner.snapshot()?.with_entry(queue_type, entry.clone());
        self.write_snapshot(&snapshot).await?;
        self.inner.insert(queue_type, entry).await
    }

    async fn pop_due(
        &self,
        queue_type: QueueType,
        max_items: usize,
        due_at: f64,
    ) -> Result<Vec<StoredEntry>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let popped = self.inner.pop_due(queue_type, max_items, due_at).await?;
        if !popped.is_empty() {
            self.persist_current("pop_due").await;
        }
        Ok(popped)
    }

    async fn pending_count(&self, queue_type: QueueType) -> Result<usize, StoreError> {
        self.inner.pending_count(queue_type).await
    }

    async fn dlq_insert(
        &self,
        queue_type: QueueType,
        entry: StoredDeadLetter,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self
            .inner
            .snapshot()?
            .with_dead_letter(queue_type, entry.clone());
        self.write_snapshot(&snapshot).await?;
        self.inner.dlq_insert(queue_type, entry).await
    }

    async fn dlq_pop(
        &self,
        queue_type: QueueType,
        limit: usize,
    ) -> Result<Vec<StoredDeadLetter>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let popped = self.inner.dlq_pop(queue_type, limit).await?;
        if !popped.is_empty() {
            self.persist_current("dlq_pop").await;
        }
        Ok(popped)
    }

    async fn dlq_peek(
        &self,
        queue_type: QueueType,
        limit: usize,
    ) -> Result<Vec<StoredDeadLetter>, StoreError> {
        self.inner.dlq_peek(queue_type, limit).await
    }

    async fn dlq_count(&self, queue_type: QueueType) -> Result<usize, StoreError> {
        self.inner.dlq_count(queue_type).await
    }

    async fn clear(
        &self,
        queue_type: QueueType,
        include_dlq: bool,
    ) -> Result<ClearCounts, StoreError> {
        let _guard = self.write_lock.lock().await;
        let counts = self.inner.clear(queue_type, include_dlq).await?;
        if counts.total() > 0 {
            self.persist_current("clear").await;
        }
        Ok(counts)
    }

    async fn count_older_than(
        &self,
        queue_type: QueueType,
        cutoff: Timestamp,
    ) -> Result<ClearCounts, StoreError> {
        self.inner.count_older_than(queue_type, cutoff).await
    }

    async fn purge_older_than(
        &self,
        queue_type: QueueType,
        cutoff: Timestamp,
    ) -> Result<ClearCounts, StoreError> {
        let _guard = self.write_lock.lock().await;
        let counts = self.inner.purge_older_than(queue_type, cutoff).await?;
        if counts.total() > 0 {
            self.persist_current("purge_older_than").await;
        }
        Ok(counts)
    }
}

#[cfg(test)]
#[path = "filesystem_queue_store_tests.rs"]
mod tests;
