//! Configuration for consumer workers, retries, health thresholds and DLQ replay.
//!
//! Every struct carries serde defaults so a partially specified (or absent)
//! configuration file still produces a usable configuration.

use crate::error::ConfigError;
use crate::QueueType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level ingestion configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Consumer worker settings
    pub worker: WorkerConfig,

    /// Retry and backoff settings
    pub retry: RetrySettings,

    /// Health verdict thresholds
    pub health: HealthThresholds,

    /// Dead-letter replay settings
    pub dead_letter: DeadLetterConfig,
}

impl IngestConfig {
    /// Check the configuration for values the workers cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.worker.validate()?;
        self.retry.validate()?;
        self.health.validate()?;
        self.dead_letter.validate()?;
        Ok(())
    }
}

/// Consumer worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Sleep between polls when no work is available, in milliseconds
    pub poll_interval_ms: u64,

    /// Maximum queue items fetched per cycle
    pub batch_size: usize,

    /// Upper bound for every validator and persistence call, in milliseconds
    pub operation_timeout_ms: u64,

    /// Delay before a crashed worker loop is restarted, in milliseconds
    pub restart_delay_ms: u64,

    /// Queue types that get a worker (empty = all)
    pub enabled_queues: Vec<QueueType>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            batch_size: 200,
            operation_timeout_ms: 5000,
            restart_delay_ms: 1000,
            enabled_queues: Vec::new(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// Queue types that should run a worker
    pub fn queues(&self) -> Vec<QueueType> {
        if self.enabled_queues.is_empty() {
            QueueType::ALL.to_vec()
        } else {
            let mut queues = self.enabled_queues.clone();
            queues.sort();
            queues.dedup();
            queues
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "worker.poll_interval_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "worker.batch_size".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.operation_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "worker.operation_timeout_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Retry and backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries allowed before a batch is dead-lettered
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,

    /// Cap on the retry delay, in milliseconds
    pub max_delay_ms: u64,

    /// Randomize delays by +/- 25%
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter: false,
        }
    }
}

impl RetrySettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Invalid {
                key: "retry.base_delay_ms".to_string(),
                message: format!(
                    "base delay {}ms exceeds max delay {}ms",
                    self.base_delay_ms, self.max_delay_ms
                ),
            });
        }
        Ok(())
    }
}

/// Thresholds for the health verdict
///
/// A queue is degraded when its pending or DLQ size exceeds the warn level
/// and critical when it exceeds the critical level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub pending_warn: usize,
    pub pending_critical: usize,
    pub dlq_warn: usize,
    pub dlq_critical: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            pending_warn: 1000,
            pending_critical: 10_000,
            dlq_warn: 10,
            dlq_critical: 100,
        }
    }
}

impl HealthThresholds {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.pending_warn > self.pending_critical {
            return Err(ConfigError::Invalid {
                key: "health.pending_warn".to_string(),
                message: "warn threshold exceeds critical threshold".to_string(),
            });
        }
        if self.dlq_warn > self.dlq_critical {
            return Err(ConfigError::Invalid {
                key: "health.dlq_warn".to_string(),
                message: "warn threshold exceeds critical threshold".to_string(),
            });
        }
        Ok(())
    }
}

/// Dead-letter replay configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// Upper bound on items replayed by a single replay request
    pub max_replay_batch: usize,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            max_replay_batch: 100,
        }
    }
}

impl DeadLetterConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_replay_batch == 0 {
            return Err(ConfigError::Invalid {
                key: "dead_letter.max_replay_batch".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
