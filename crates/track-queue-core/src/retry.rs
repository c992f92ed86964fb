//! # Retry Policy Module
//!
//! Exponential backoff for batches whose persistence failed transiently.
//!
//! A batch that has been retried `retry_count` times is rescheduled after
//! `min(base_delay * 2^retry_count, max_delay)` until `max_retries` is
//! reached, after which it is dead-lettered.

use crate::config::RetrySettings;
use rand::Rng;
use std::time::Duration;

/// Outcome of consulting the policy after a transient failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue with the incremented retry count after `delay`
    Retry { next_retry_count: u32, delay: Duration },

    /// Retries are exhausted
    DeadLetter,
}

/// Retry policy configuration for exponential backoff
///
/// # Examples
///
/// ```rust
/// use track_queue_core::retry::{RetryDecision, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(60));
///
/// assert_eq!(policy.delay_for(2), Duration::from_secs(4));
/// assert_eq!(policy.decide(3), RetryDecision::DeadLetter);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries before dead-lettering
    pub max_retries: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Whether to randomize delays
    pub use_jitter: bool,

    /// Jitter range as a fraction of the delay (0.25 = +/- 25%)
    pub jitter_percent: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    /// Create a policy without jitter
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            use_jitter: false,
            jitter_percent: 0.25,
        }
    }

    /// Build a policy from configuration
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            use_jitter: settings.jitter,
            ..Self::new(
                settings.max_retries,
                Duration::from_millis(settings.base_delay_ms),
                Duration::from_millis(settings.max_delay_ms),
            )
        }
    }

    /// Enable jitter with the given fraction (clamped to 0.0..=1.0)
    pub fn with_jitter(mut self, percent: f64) -> Self {
        self.use_jitter = true;
        self.jitter_percent = percent.clamp(0.0, 1.0);
        self
    }

    /// Delay before the retry that follows `retry_count` earlier retries
    ///
    /// Without jitter this is exactly `min(base_delay * 2^retry_count, max_delay)`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        // Saturate the exponent; anything past 2^32 is capped anyway.
        let exponent = retry_count.min(32) as i32;
        let base_ms = self.base_delay.as_millis() as f64 * 2f64.powi(exponent);
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64);

        let final_ms = if self.use_jitter {
            Self::add_jitter(capped_ms, self.jitter_percent)
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms.round() as u64)
    }

    /// Whether an item that has been retried `retry_count` times may retry again
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Decide what happens to an item after a transient failure
    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        if self.should_retry(retry_count) {
            RetryDecision::Retry {
                next_retry_count: retry_count + 1,
                delay: self.delay_for(retry_count),
            }
        } else {
            RetryDecision::DeadLetter
        }
    }

    fn add_jitter(delay_ms: f64, jitter_percent: f64) -> f64 {
        let jitter_range = delay_ms * jitter_percent;
        if jitter_range <= 0.0 {
            return delay_ms;
        }

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(-jitter_range..=jitter_range);
        (delay_ms + jitter).max(0.0)
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
