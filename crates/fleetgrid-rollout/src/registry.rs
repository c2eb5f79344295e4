//! Seams to the external agent registry and release catalog.
//!
//! Both collaborators are async and injected as trait objects, so the
//! controller can run against a real transport, the in-process fleet used by
//! the standalone daemon, or a test double.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use fleetgrid_state::{AgentSnapshot, Release};
use thiserror::Error;

/// Result type alias for registry and catalog calls.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Boxed future returned by registry and catalog calls.
pub type RegistryFuture<'a, T> = Pin<Box<dyn Future<Output = RegistryResult<T>> + Send + 'a>>;

/// Errors surfaced by the agent registry or release catalog.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}

/// What the registry currently knows about one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentObservation {
    /// Version the agent last reported running.
    pub current_version: String,
    /// Error reported for the most recent update command, if it failed.
    ///
    /// Registries must clear this when a new command is accepted.
    pub last_error: Option<String>,
}

/// Authoritative source of agents and their reported versions.
pub trait AgentRegistry: Send + Sync {
    /// Point-in-time list of every agent in the fleet.
    fn fleet_snapshot(&self) -> RegistryFuture<'_, Vec<AgentSnapshot>>;

    /// Ask an agent to move to `version`.
    ///
    /// Resolves once the command is accepted; the outcome is observed later
    /// through [`AgentRegistry::observe`].
    fn command_update<'a>(&'a self, agent_id: &'a str, version: &'a str)
    -> RegistryFuture<'a, ()>;

    /// Read back an agent's reported state.
    fn observe<'a>(&'a self, agent_id: &'a str) -> RegistryFuture<'a, AgentObservation>;
}

/// Read-only catalog of releases.
pub trait ReleaseCatalog: Send + Sync {
    /// Look up a release by ID.
    fn get_release<'a>(&'a self, release_id: &'a str) -> RegistryFuture<'a, Option<Release>>;
}
