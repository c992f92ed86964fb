//! Error types for queue, persistence and administrative operations.

use crate::QueueType;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the queue store and the typed queue facade
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Queue store unavailable: {message}")]
    Unavailable { message: String },

    #[error("Queue entry serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Refusing to enqueue an empty batch for {queue_type}")]
    EmptyBatch { queue_type: QueueType },

    #[error("Priority must be a finite, non-negative number (got {priority})")]
    InvalidPriority { priority: f64 },
}

impl StoreError {
    /// Check if error is transient and the caller should retry
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable { .. } => true,
            Self::Io(_) => true,
            Self::Serialization(_) => false,
            Self::EmptyBatch { .. } => false,
            Self::InvalidPriority { .. } => false,
        }
    }
}

/// Errors raised by the persistence layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("Point store unavailable: {message}")]
    Unavailable { message: String },

    #[error("Point store call timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Point store rejected the batch: {message}")]
    Structural { message: String },
}

impl PersistenceError {
    /// Connectivity problems and timeouts are retried; structural rejections are not
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable { .. } => true,
            Self::Timeout { .. } => true,
            Self::Structural { .. } => false,
        }
    }
}

/// Errors raised by administrative operations
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("Clearing {queue_type} requires explicit confirmation")]
    ConfirmationRequired { queue_type: QueueType },

    #[error("Invalid argument '{argument}': {message}")]
    InvalidArgument { argument: String, message: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl AdminError {
    /// Check if error is transient and the operator should retry
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConfirmationRequired { .. } => false,
            Self::InvalidArgument { .. } => false,
            Self::Store(e) => e.is_transient(),
            Self::Persistence(e) => e.is_retryable(),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid configuration for '{key}': {message}")]
    Invalid { key: String, message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
