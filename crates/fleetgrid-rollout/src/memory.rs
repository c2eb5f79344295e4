//! In-process fleet: an [`AgentRegistry`] and [`ReleaseCatalog`] held in memory.
//!
//! Used by the standalone daemon (seeded from a JSON fleet file) and by
//! tests. Agents either apply commands immediately (`auto_apply`) or hold
//! them until [`InMemoryFleet::complete_update`] is called. Faults can be
//! injected per agent.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fleetgrid_state::{AgentId, AgentSnapshot, Release, ReleaseId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::registry::{
    AgentObservation, AgentRegistry, RegistryError, RegistryFuture, ReleaseCatalog,
};

/// Seed data for an in-memory fleet, as read from a fleet file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetSeed {
    #[serde(default)]
    pub agents: Vec<AgentSnapshot>,
    #[serde(default)]
    pub releases: Vec<Release>,
}

/// Fault injected into a simulated agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentFault {
    /// Commands fail with a transport error.
    Unreachable,
    /// Commands are accepted but the install fails with this message.
    InstallFails(String),
    /// Commands never return.
    Hang,
}

#[derive(Debug)]
struct SimAgent {
    snapshot: AgentSnapshot,
    /// Version commanded but not yet applied.
    target: Option<String>,
    last_error: Option<String>,
    fault: Option<AgentFault>,
    commands: Vec<String>,
}

#[derive(Debug, Default)]
struct FleetInner {
    agents: BTreeMap<AgentId, SimAgent>,
    releases: HashMap<ReleaseId, Release>,
    auto_apply: bool,
}

/// Shared in-memory fleet. Clones share the same agents.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFleet {
    inner: Arc<Mutex<FleetInner>>,
}

impl InMemoryFleet {
    /// An empty fleet whose agents hold commands until completed.
    pub fn new() -> Self {
        Self::default()
    }

    /// A fleet populated from seed data.
    pub fn from_seed(seed: FleetSeed) -> Self {
        let fleet = Self::new();
        for agent in seed.agents {
            fleet.add_agent(agent);
        }
        for release in seed.releases {
            fleet.add_release(release);
        }
        fleet
    }

    /// Apply accepted commands immediately instead of holding them.
    pub fn with_auto_apply(self, auto_apply: bool) -> Self {
        self.lock().auto_apply = auto_apply;
        self
    }

    fn lock(&self) -> MutexGuard<'_, FleetInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace an agent.
    pub fn add_agent(&self, snapshot: AgentSnapshot) {
        let id = snapshot.id.clone();
        self.lock().agents.insert(
            id,
            SimAgent {
                snapshot,
                target: None,
                last_error: None,
                fault: None,
                commands: Vec::new(),
            },
        );
    }

    /// Add or replace a release.
    pub fn add_release(&self, release: Release) {
        self.lock().releases.insert(release.id.clone(), release);
    }

    /// Set or clear the fault for an agent. Returns false for unknown agents.
    pub fn set_fault(&self, agent_id: &str, fault: Option<AgentFault>) -> bool {
        match self.lock().agents.get_mut(agent_id) {
            Some(agent) => {
                agent.fault = fault;
                true
            }
            None => false,
        }
    }

    /// Apply the pending command of an agent. Returns false if none was pending.
    pub fn complete_update(&self, agent_id: &str) -> bool {
        let mut inner = self.lock();
        let Some(agent) = inner.agents.get_mut(agent_id) else {
            return false;
        };
        match agent.target.take() {
            Some(version) => {
                agent.snapshot.current_version = version;
                true
            }
            None => false,
        }
    }

    /// Fail the pending command of an agent with `error`.
    pub fn fail_update(&self, agent_id: &str, error: &str) -> bool {
        let mut inner = self.lock();
        let Some(agent) = inner.agents.get_mut(agent_id) else {
            return false;
        };
        if agent.target.take().is_none() {
            return false;
        }
        agent.last_error = Some(error.to_string());
        true
    }

    /// The version an agent currently reports.
    pub fn version_of(&self, agent_id: &str) -> Option<String> {
        self.lock()
            .agents
            .get(agent_id)
            .map(|a| a.snapshot.current_version.clone())
    }

    /// Versions commanded to an agent so far, oldest first.
    pub fn commands_for(&self, agent_id: &str) -> Vec<String> {
        self.lock()
            .agents
            .get(agent_id)
            .map(|a| a.commands.clone())
            .unwrap_or_default()
    }

    /// Agents with a command accepted but not yet applied.
    pub fn pending_agents(&self) -> Vec<AgentId> {
        self.lock()
            .agents
            .values()
            .filter(|a| a.target.is_some())
            .map(|a| a.snapshot.id.clone())
            .collect()
    }

    /// Record a command; `Err` carries the fault to surface, if any.
    fn accept_command(&self, agent_id: &str, version: &str) -> Result<(), Option<RegistryError>> {
        let mut inner = self.lock();
        let auto_apply = inner.auto_apply;
        let agent = inner
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| Some(RegistryError::UnknownAgent(agent_id.to_string())))?;

        match agent.fault.clone() {
            Some(AgentFault::Unreachable) => {
                return Err(Some(RegistryError::Transport(format!(
                    "agent {agent_id} unreachable"
                ))));
            }
            Some(AgentFault::Hang) => return Err(None),
            Some(AgentFault::InstallFails(message)) => {
                agent.commands.push(version.to_string());
                agent.target = None;
                agent.last_error = Some(message);
                return Ok(());
            }
            None => {}
        }

        agent.commands.push(version.to_string());
        agent.last_error = None;
        if auto_apply {
            agent.snapshot.current_version = version.to_string();
            agent.target = None;
        } else {
            agent.target = Some(version.to_string());
        }
        debug!(agent = %agent_id, %version, "command accepted");
        Ok(())
    }
}

impl AgentRegistry for InMemoryFleet {
    fn fleet_snapshot(&self) -> RegistryFuture<'_, Vec<AgentSnapshot>> {
        let agents: Vec<AgentSnapshot> = self
            .lock()
            .agents
            .values()
            .map(|a| a.snapshot.clone())
            .collect();
        Box::pin(async move { Ok::<_, RegistryError>(agents) })
    }

    fn command_update<'a>(
        &'a self,
        agent_id: &'a str,
        version: &'a str,
    ) -> RegistryFuture<'a, ()> {
        let accepted = self.accept_command(agent_id, version);
        Box::pin(async move {
            match accepted {
                Ok(()) => Ok(()),
                Err(Some(err)) => Err(err),
                Err(None) => std::future::pending().await,
            }
        })
    }

    fn observe<'a>(&'a self, agent_id: &'a str) -> RegistryFuture<'a, AgentObservation> {
        let observation = self
            .lock()
            .agents
            .get(agent_id)
            .map(|a| AgentObservation {
                current_version: a.snapshot.current_version.clone(),
                last_error: a.last_error.clone(),
            })
            .ok_or_else(|| RegistryError::UnknownAgent(agent_id.to_string()));
        Box::pin(async move { observation })
    }
}

impl ReleaseCatalog for InMemoryFleet {
    fn get_release<'a>(&'a self, release_id: &'a str) -> RegistryFuture<'a, Option<Release>> {
        let release = self.lock().releases.get(release_id).cloned();
        Box::pin(async move { Ok::<_, RegistryError>(release) })
    }
}
