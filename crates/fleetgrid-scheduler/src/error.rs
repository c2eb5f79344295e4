//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur while driving rollouts.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("rollout error: {0}")]
    Rollout(#[from] fleetgrid_rollout::RolloutError),

    #[error("invalid tick interval: {0:?}")]
    InvalidInterval(std::time::Duration),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
