//! Common test utilities for track queue integration tests
//!
//! This module provides:
//! - A service harness wired to in-memory stores the tests can steer
//! - Point batch builders
//! - Polling helpers for tests that run background workers

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use track_queue_core::{
    IngestConfig, IngestService, MemoryPointStore, MemoryQueueStore, OwnerId, PointRecord,
    Position, QueueStore, Timestamp,
};

// ============================================================================
// Service Harness
// ============================================================================

/// A service plus handles on the stores behind it
pub struct Harness {
    pub service: IngestService,
    pub queue_store: MemoryQueueStore,
    pub points: MemoryPointStore,
}

impl Harness {
    pub fn new(config: IngestConfig) -> Self {
        let queue_store = MemoryQueueStore::new();
        let points = MemoryPointStore::new();
        let service = IngestService::new(
            Arc::new(queue_store.clone()),
            Arc::new(points.clone()),
            config,
        );
        Self {
            service,
            queue_store,
            points,
        }
    }

    /// Build a harness over an externally constructed queue store
    pub fn with_queue_store(
        queue_store: Arc<dyn QueueStore>,
        config: IngestConfig,
    ) -> (IngestService, MemoryPointStore) {
        let points = MemoryPointStore::new();
        let service = IngestService::new(queue_store, Arc::new(points.clone()), config);
        (service, points)
    }
}

/// Configuration with short delays so retry paths finish quickly
pub fn fast_config() -> IngestConfig {
    let mut config = IngestConfig::default();
    config.worker.poll_interval_ms = 10;
    config.worker.batch_size = 50;
    config.worker.operation_timeout_ms = 1000;
    config.worker.restart_delay_ms = 10;
    config.retry.base_delay_ms = 20;
    config.retry.max_delay_ms = 200;
    config.retry.max_retries = 3;
    config
}

// ============================================================================
// Test Data Builders
// ============================================================================

/// `count` distinct points of `owner`, one second apart
pub fn points_for(owner: i64, count: usize) -> Vec<PointRecord> {
    (0..count)
        .map(|i| {
            PointRecord::new(
                OwnerId::new(owner),
                Timestamp::from_millis(1_700_000_000_000 + (i as i64) * 1000),
                Position::new(47.0 + i as f64 * 0.001, 8.0),
            )
        })
        .collect()
}

// ============================================================================
// Polling
// ============================================================================

/// Poll `check` every 10ms until it returns true or `timeout` passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
