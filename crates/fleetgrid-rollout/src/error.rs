//! Rollout error types.

use fleetgrid_state::{ReleaseStatus, StateError};
use thiserror::Error;

use crate::registry::RegistryError;

/// Errors returned by the rollout controller.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("release not found: {0}")]
    ReleaseNotFound(String),

    #[error("release {id} is {status:?}; only available releases can be rolled out")]
    ReleaseNotEligible { id: String, status: ReleaseStatus },

    #[error("invalid strategy: {0}")]
    InvalidStrategy(String),

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("rollout not found: {0}")]
    NotFound(String),

    #[error("agent {agent_id} is not part of rollout {rollout_id}")]
    AgentNotFound { rollout_id: String, agent_id: String },

    #[error("rollout {id}: {reason}")]
    Conflict { id: String, reason: String },

    #[error("rollout {0} is already advancing; retry shortly")]
    Busy(String),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl RolloutError {
    pub(crate) fn conflict(id: &str, reason: impl Into<String>) -> Self {
        Self::Conflict {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

pub type RolloutResult<T> = Result<T, RolloutError>;
