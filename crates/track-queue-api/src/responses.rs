//! Request bodies, query parameters and response types for the API.

use serde::{Deserialize, Serialize};
use track_queue_core::{
    ClearCounts, HealthReport, PointRecord, QueueItemId, QueueStats, QueueType, Timestamp,
};

// ============================================================================
// Request Types
// ============================================================================

/// Body of `POST /queues/{queue_type}/points`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub points: Vec<PointRecord>,

    /// Explicit priority score; arrival order when absent
    #[serde(default)]
    pub priority: Option<f64>,
}

/// Body of `POST /admin/queues/{queue_type}/process`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessRequest {
    /// Items to process; the configured worker batch size when absent
    pub batch_size: Option<usize>,
}

/// Body of `POST /admin/dlq/{queue_type}/replay`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayRequest {
    pub limit: usize,
    pub dry_run: bool,
}

impl Default for ReplayRequest {
    fn default() -> Self {
        Self {
            limit: 100,
            dry_run: false,
        }
    }
}

/// Body of `POST /admin/queues/{queue_type}/clear`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClearRequest {
    pub include_dlq: bool,

    /// Must be `true`; guards against accidental purges
    pub confirm: bool,
}

/// Body of `POST /admin/cleanup`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupRequest {
    pub max_age_seconds: u64,

    #[serde(default)]
    pub dry_run: bool,
}

/// Query parameters of `GET /admin/dlq/{queue_type}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectParams {
    pub limit: usize,
}

impl Default for InspectParams {
    fn default() -> Self {
        Self { limit: 20 }
    }
}

// ============================================================================
// Response Types
// ============================================================================

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    #[serde(flatten)]
    pub report: HealthReport,
    pub timestamp: Timestamp,
    pub version: String,
}

/// Stats across all queue types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub queues: Vec<QueueStats>,
    pub timestamp: Timestamp,
}

/// Accepted enqueue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub item_id: QueueItemId,
    pub queue_type: QueueType,
    pub points: usize,
}

/// Result of a confirmed clear
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearResponse {
    pub queue_type: QueueType,
    pub removed: ClearCounts,
}
