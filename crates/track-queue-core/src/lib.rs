//! # Track Queue Core
//!
//! Reliable ingestion queue for GPS position batches.
//!
//! Producers hand batches of [`PointRecord`]s to the queue; one consumer
//! worker per [`QueueType`] pops them, checks that every point's owner
//! exists, persists the valid points with a conflict-tolerant upsert, and
//! either retries failed batches with exponential backoff or quarantines
//! them in the dead-letter store.
//!
//! ## Architecture
//!
//! - Business logic depends only on the [`QueueStore`] and [`PointStore`]
//!   trait abstractions
//! - Store implementations live in [`adapters`] and are injected at runtime
//! - Correctness of concurrent consumers rests on the atomic pop primitive
//!   of the queue store, not on in-process locks
//!
//! ## Usage
//!
//! ```rust
//! use track_queue_core::{OwnerId, PointRecord, Position, QueueType, Timestamp};
//!
//! let point = PointRecord::new(
//!     OwnerId::new(42),
//!     Timestamp::now(),
//!     Position::new(52.37, 4.89),
//! );
//! assert_eq!(QueueType::LivePosition.parent_table(), Some("tracks"));
//! assert_eq!(point.owner.as_i64(), 42);
//! ```

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use ulid::Ulid;

// ============================================================================
// Domain Identifier Types
// ============================================================================

/// Unique identifier for queue items and dead-letter items
///
/// Uses ULID so identifiers sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueItemId(Ulid);

impl QueueItemId {
    /// Generate a new unique item ID
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Get string representation of the item ID
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for QueueItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueueItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueItemId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ulid = s.parse::<Ulid>().map_err(|_| ParseError::InvalidFormat {
            expected: "ULID format".to_string(),
            actual: s.to_string(),
        })?;
        Ok(Self(ulid))
    }
}

/// Reference to the parent entity (track, device) a point belongs to
///
/// The parent row may not exist yet when the point is enqueued; producers and
/// parent creation are not transactionally coupled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(i64);

impl OwnerId {
    /// Create new owner ID
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get numeric value
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OwnerId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s.parse::<i64>().map_err(|_| ParseError::InvalidFormat {
            expected: "integer".to_string(),
            actual: s.to_string(),
        })?;
        Ok(Self::new(id))
    }
}

// ============================================================================
// Queue Types
// ============================================================================

/// Closed set of ingestion streams
///
/// Each variant is bound to the table its points are persisted into and,
/// where applicable, to the parent table its owner references point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueType {
    /// Real-time positions streamed by tracking clients
    LivePosition,
    /// Points from bulk track uploads
    Upload,
    /// Points pushed by hardware trackers
    DeviceFeed,
    /// Derived per-point scores computed downstream
    DerivedScore,
}

impl QueueType {
    /// All queue types, in a stable order
    pub const ALL: [QueueType; 4] = [
        QueueType::LivePosition,
        QueueType::Upload,
        QueueType::DeviceFeed,
        QueueType::DerivedScore,
    ];

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LivePosition => "live-position",
            Self::Upload => "upload",
            Self::DeviceFeed => "device-feed",
            Self::DerivedScore => "derived-score",
        }
    }

    /// Table that successfully validated points are upserted into
    pub fn target_table(&self) -> &'static str {
        match self {
            Self::LivePosition => "live_positions",
            Self::Upload => "track_points",
            Self::DeviceFeed => "device_points",
            Self::DerivedScore => "point_scores",
        }
    }

    /// Parent table referenced by [`PointRecord::owner`], if the stream has one
    pub fn parent_table(&self) -> Option<&'static str> {
        match self {
            Self::LivePosition | Self::Upload => Some("tracks"),
            Self::DeviceFeed => Some("devices"),
            Self::DerivedScore => None,
        }
    }

    /// Whether points of this type must pass the owner existence check
    pub fn requires_owner_check(&self) -> bool {
        self.parent_table().is_some()
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "live-position" | "live" => Ok(Self::LivePosition),
            "upload" => Ok(Self::Upload),
            "device-feed" | "device" => Ok(Self::DeviceFeed),
            "derived-score" | "score" => Ok(Self::DerivedScore),
            _ => Err(ParseError::InvalidFormat {
                expected: "live-position, upload, device-feed, or derived-score".to_string(),
                actual: s.to_string(),
            }),
        }
    }
}

// ============================================================================
// Time Types
// ============================================================================

/// UTC timestamp with microsecond precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current moment
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Wrap an existing `DateTime`
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Create timestamp from milliseconds since the Unix epoch
    pub fn from_millis(millis: i64) -> Self {
        Self(Utc.timestamp_millis_opt(millis).single().unwrap_or_default())
    }

    /// Parse timestamp from RFC3339 string
    pub fn from_rfc3339(s: &str) -> Result<Self, ParseError> {
        let dt = DateTime::parse_from_rfc3339(s)
            .map_err(|_| ParseError::InvalidFormat {
                expected: "RFC3339 datetime".to_string(),
                actual: s.to_string(),
            })?
            .with_timezone(&Utc);
        Ok(Self(dt))
    }

    /// Convert to RFC3339 string
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Milliseconds since the Unix epoch
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Add duration to timestamp
    pub fn add_duration(&self, duration: Duration) -> Self {
        let chrono_duration = chrono::Duration::from_std(duration).unwrap_or_default();
        Self(self.0 + chrono_duration)
    }

    /// Subtract duration from timestamp
    pub fn subtract_duration(&self, duration: Duration) -> Self {
        let chrono_duration = chrono::Duration::from_std(duration).unwrap_or_default();
        Self(self.0 - chrono_duration)
    }

    /// Get duration since another timestamp (zero if `other` is later)
    pub fn duration_since(&self, other: Self) -> Duration {
        let chrono_duration = self.0.signed_duration_since(other.0);
        chrono_duration.to_std().unwrap_or_default()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

// ============================================================================
// Point Records
// ============================================================================

/// Geographic position in WGS84 degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

impl Position {
    /// Create new position
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Natural identity of a point: `(owner, position, timestamp)`
///
/// Coordinates are compared bit-for-bit so the key is hashable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PointIdentity {
    pub owner: OwnerId,
    pub latitude_bits: u64,
    pub longitude_bits: u64,
    pub recorded_at: Timestamp,
}

/// A single GPS observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointRecord {
    /// Parent entity the point belongs to
    pub owner: OwnerId,

    /// When the observation was taken
    pub recorded_at: Timestamp,

    /// Where the observation was taken
    pub position: Position,

    /// Elevation in metres, when the device reports one
    #[serde(default)]
    pub elevation: Option<f64>,

    /// Free-form tag identifying the reporting device
    #[serde(default)]
    pub device_tag: Option<String>,
}

impl PointRecord {
    /// Create a point without elevation or device tag
    pub fn new(owner: OwnerId, recorded_at: Timestamp, position: Position) -> Self {
        Self {
            owner,
            recorded_at,
            position,
            elevation: None,
            device_tag: None,
        }
    }

    /// Set elevation
    pub fn with_elevation(mut self, elevation: f64) -> Self {
        self.elevation = Some(elevation);
        self
    }

    /// Set device tag
    pub fn with_device_tag(mut self, tag: impl Into<String>) -> Self {
        self.device_tag = Some(tag.into());
        self
    }

    /// Idempotency key used by point stores to skip duplicates
    pub fn identity(&self) -> PointIdentity {
        PointIdentity {
            owner: self.owner,
            latitude_bits: self.position.latitude.to_bits(),
            longitude_bits: self.position.longitude.to_bits(),
            recorded_at: self.recorded_at,
        }
    }
}

// ============================================================================
// Queue Items
// ============================================================================

/// A batch of points of one queue type, as held by the queue store
///
/// The queue type lives on the item rather than on each point, so a batch
/// can never mix types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub queue_type: QueueType,
    pub points: Vec<PointRecord>,
    pub enqueued_at: Timestamp,
    pub retry_count: u32,
    pub priority_score: f64,
}

impl QueueItem {
    /// Create a fresh item with zero retries
    pub fn new(queue_type: QueueType, points: Vec<PointRecord>, priority_score: f64) -> Self {
        Self {
            id: QueueItemId::new(),
            queue_type,
            points,
            enqueued_at: Timestamp::now(),
            retry_count: 0,
            priority_score,
        }
    }

    /// Number of points in the batch
    pub fn point_count(&self) -> usize {
        self.points.len()
    }
}

/// Why a batch ended up in the dead-letter store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DlqReason {
    /// The point's owner does not exist in the parent table
    UnknownParentReference,

    /// Transient persistence failures exhausted all retries
    MaxRetriesExceeded,

    /// The store rejected the data for a reason other than a key conflict
    StructuralFailure { message: String },

    /// The queued payload could not be decoded
    MalformedPayload { message: String },

    /// A retry was due but the queue store refused the requeue
    RequeueFailed { message: String },
}

impl DlqReason {
    /// Short category label used in logs and summaries
    pub fn category(&self) -> &'static str {
        match self {
            Self::UnknownParentReference => "unknown parent reference",
            Self::MaxRetriesExceeded => "max retries exceeded",
            Self::StructuralFailure { .. } => "structural failure",
            Self::MalformedPayload { .. } => "malformed payload",
            Self::RequeueFailed { .. } => "requeue failed",
        }
    }
}

impl fmt::Display for DlqReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StructuralFailure { message }
            | Self::MalformedPayload { message }
            | Self::RequeueFailed { message } => {
                write!(f, "{}: {}", self.category(), message)
            }
            _ => f.write_str(self.category()),
        }
    }
}

/// A terminally quarantined batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqItem {
    pub id: QueueItemId,
    pub points: Vec<PointRecord>,
    pub original_queue_type: QueueType,
    pub reason: DlqReason,
    pub failed_at: Timestamp,
    pub count: usize,
    pub retry_count: u32,
    pub enqueued_at: Timestamp,

    /// Undecodable payload, kept verbatim for operators
    #[serde(default)]
    pub raw_payload: Option<String>,
}

impl DlqItem {
    /// Quarantine (a subset of) a queue item's points
    pub fn from_item(item: &QueueItem, points: Vec<PointRecord>, reason: DlqReason) -> Self {
        Self {
            id: item.id,
            count: points.len(),
            points,
            original_queue_type: item.queue_type,
            reason,
            failed_at: Timestamp::now(),
            retry_count: item.retry_count,
            enqueued_at: item.enqueued_at,
            raw_payload: None,
        }
    }

    /// Quarantine a payload that could not be decoded
    pub fn malformed(
        queue_type: QueueType,
        raw_payload: String,
        enqueued_at: Timestamp,
        message: String,
    ) -> Self {
        Self {
            id: QueueItemId::new(),
            points: Vec::new(),
            original_queue_type: queue_type,
            reason: DlqReason::MalformedPayload { message },
            failed_at: Timestamp::now(),
            count: 0,
            retry_count: 0,
            enqueued_at,
            raw_payload: Some(raw_payload),
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Error type for string parsing failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Invalid format: expected {expected}, got '{actual}'")]
    InvalidFormat { expected: String, actual: String },
}

// ============================================================================
// Module declarations
// ============================================================================

/// Store, persistence and admin error types
pub mod error;

/// Worker, retry, health and dead-letter configuration
pub mod config;

/// Queue store abstraction and typed queue facade
pub mod queue_store;

/// Point store abstraction and persistence sink
pub mod persistence;

/// Owner-reference validation gate
pub mod validator;

/// Exponential backoff retry policy
pub mod retry;

/// Consumer worker state machine
pub mod worker;

/// Worker supervision and shutdown
pub mod supervisor;

/// Dead-letter inspection, replay and cleanup
pub mod dead_letter;

/// Counters, stats and health verdicts
pub mod health;

/// Service facade exposing the external interface
pub mod service;

/// Store implementations
pub mod adapters;

// Re-export key types for convenience
pub use adapters::{FilesystemQueueStore, MemoryPointStore, MemoryQueueStore};
pub use config::{DeadLetterConfig, HealthThresholds, IngestConfig, RetrySettings, WorkerConfig};
pub use dead_letter::{
    CleanupReport, DeadLetterManager, DlqInspection, DlqSummary, QueueCleanup, ReplayReport,
};
pub use error::{AdminError, ConfigError, PersistenceError, StoreError};
pub use health::{
    evaluate_health, HealthReport, HealthStatus, QueueCounters, QueueHealth, QueueStats,
    StatsReporter,
};
pub use persistence::{PersistenceSink, PointStore, UpsertOutcome};
pub use queue_store::{
    ClearCounts, DequeuedEntry, IngestQueue, MalformedEntry, QueueStore, StoredDeadLetter,
    StoredEntry,
};
pub use retry::{RetryDecision, RetryPolicy};
pub use service::IngestService;
pub use supervisor::{ShutdownToken, WorkerSupervisor};
pub use validator::{ValidationOutcome, Validator};
pub use worker::{ConsumerWorker, CycleReport, DeadLetterSummary, ScheduledRetry, WorkerState};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
