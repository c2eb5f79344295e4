//! Rollout controller settings.

use std::time::Duration;

use crate::error::{RolloutError, RolloutResult};

/// Thresholds, retry policy and timeouts applied to every rollout.
#[derive(Debug, Clone)]
pub struct RolloutConfig {
    /// Maximum tolerated ratio of terminally failed agents (0.0–1.0).
    /// A rollout fails once the ratio exceeds this at a wave boundary.
    pub failure_threshold: f64,
    /// Update attempts per agent before it is marked failed.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles with each further attempt.
    pub retry_backoff: Duration,
    /// Upper bound on the retry delay.
    pub max_retry_backoff: Duration,
    /// How long an issued update may go unconfirmed before the attempt fails.
    pub update_timeout: Duration,
    /// Deadline for a single registry call.
    pub command_timeout: Duration,
    /// Maximum concurrent registry calls per tick.
    pub max_concurrency: usize,
    /// Batch size for manual rollouts that do not name one.
    pub manual_batch_size: u32,
    /// Run the late-joiner catch-up pass after the last planned wave.
    pub catch_up: bool,
    /// How long an operator action waits for a running tick.
    pub lock_timeout: Duration,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.1,
            max_attempts: 3,
            retry_backoff: Duration::from_secs(5),
            max_retry_backoff: Duration::from_secs(60),
            update_timeout: Duration::from_secs(300),
            command_timeout: Duration::from_secs(10),
            max_concurrency: 16,
            manual_batch_size: 1,
            catch_up: true,
            lock_timeout: Duration::from_secs(2),
        }
    }
}

impl RolloutConfig {
    /// Reject settings the controller cannot run with.
    pub fn validate(&self) -> RolloutResult<()> {
        if !(0.0..=1.0).contains(&self.failure_threshold) {
            return Err(RolloutError::InvalidConfig(format!(
                "failure_threshold must be within 0.0..=1.0, got {}",
                self.failure_threshold
            )));
        }
        if self.max_attempts == 0 {
            return Err(RolloutError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(RolloutError::InvalidConfig(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.manual_batch_size == 0 {
            return Err(RolloutError::InvalidConfig(
                "manual_batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before retrying after `attempts` failed attempts.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let doublings = attempts.saturating_sub(1).min(16);
        self.retry_backoff
            .saturating_mul(1u32 << doublings)
            .min(self.max_retry_backoff)
    }
}
