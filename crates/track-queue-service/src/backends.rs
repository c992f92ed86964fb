//! Construction of the queue store and point store selected by configuration.

use std::sync::Arc;
use std::time::Duration;
use track_queue_api::{PointBackend, QueueBackend, ServiceError, StorageConfig};
use track_queue_core::{
    ConfigError, FilesystemQueueStore, MemoryPointStore, MemoryQueueStore, PointStore, QueueStore,
};
use tracing::{info, warn};

/// Build the configured queue store
///
/// The filesystem backend restores its snapshot before returning.
pub async fn build_queue_store(
    storage: &StorageConfig,
) -> Result<Arc<dyn QueueStore>, ServiceError> {
    match storage.queue_backend {
        QueueBackend::Memory => {
            warn!("Using in-memory queue store; queued batches are lost on restart");
            Ok(Arc::new(MemoryQueueStore::new()))
        }
        QueueBackend::Filesystem => {
            let data_dir = storage
                .data_dir
                .clone()
                .ok_or_else(|| ConfigError::Missing {
                    key: "storage.data_dir".to_string(),
                })?;

            let store = FilesystemQueueStore::new(data_dir)
                .await
                .map_err(|e| ServiceError::Storage {
                    message: e.to_string(),
                })?;

            info!(snapshot = %store.snapshot_path().display(), "Using filesystem queue store");
            Ok(Arc::new(store))
        }
    }
}

/// Build the configured point store
///
/// `acquire_timeout` bounds how long a postgres connection may take to check out.
pub async fn build_point_store(
    storage: &StorageConfig,
    acquire_timeout: Duration,
) -> Result<Arc<dyn PointStore>, ServiceError> {
    match storage.point_backend {
        PointBackend::Memory => {
            warn!("Using in-memory point store; persisted points are not durable");
            Ok(Arc::new(MemoryPointStore::new()))
        }
        PointBackend::Postgres => connect_postgres(storage, acquire_timeout).await,
    }
}

#[cfg(feature = "postgres")]
async fn connect_postgres(
    storage: &StorageConfig,
    acquire_timeout: Duration,
) -> Result<Arc<dyn PointStore>, ServiceError> {
    use track_queue_core::adapters::PostgresPointStore;

    let url = storage
        .database_url
        .as_deref()
        .ok_or_else(|| ConfigError::Missing {
            key: "storage.database_url".to_string(),
        })?;

    let store = PostgresPointStore::connect(url, storage.max_connections, acquire_timeout)
        .await
        .map_err(|e| ServiceError::Storage {
            message: e.to_string(),
        })?;

    info!(
        max_connections = storage.max_connections,
        "Connected to postgres point store"
    );
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn connect_postgres(
    _storage: &StorageConfig,
    _acquire_timeout: Duration,
) -> Result<Arc<dyn PointStore>, ServiceError> {
    Err(ServiceError::Storage {
        message: "this build does not include the postgres point backend".to_string(),
    })
}

#[cfg(test)]
#[path = "backends_tests.rs"]
mod tests;
