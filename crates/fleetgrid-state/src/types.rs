//! Domain types for the FleetGrid state store.
//!
//! These types represent releases, fleet agents, rollouts and their
//! per-agent update rows. All types are serializable to/from JSON for
//! storage in redb tables. Timestamps are unix milliseconds.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a rollout.
pub type RolloutId = String;

/// Unique identifier for an agent in the fleet.
pub type AgentId = String;

/// Unique identifier for a release in the catalog.
pub type ReleaseId = String;

// ── Release ───────────────────────────────────────────────────────

/// An immutable, versioned release record owned by the release catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Release {
    pub id: ReleaseId,
    pub version: String,
    pub status: ReleaseStatus,
    pub created_at: u64,
}

/// Catalog status of a release. Only `Available` releases can be rolled out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Draft,
    Available,
    Deprecated,
}

// ── Fleet ─────────────────────────────────────────────────────────

/// One agent as reported by the agent registry at snapshot time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub name: String,
    pub current_version: String,
    pub region: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Filter restricting a rollout to part of the fleet.
///
/// Empty lists match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentSelector {
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl AgentSelector {
    /// True when the agent is in one of the regions and carries every tag.
    pub fn matches(&self, agent: &AgentSnapshot) -> bool {
        let region_ok = self.regions.is_empty() || self.regions.contains(&agent.region);
        let tags_ok = self.tags.iter().all(|t| agent.tags.contains(t));
        region_ok && tags_ok
    }
}

// ── Strategy ──────────────────────────────────────────────────────

/// Policy deciding how the eligible agents are split into waves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Strategy {
    /// Cumulative 10%, 25%, 50%, 100% of the fleet.
    #[default]
    Staged,
    /// 5% canary wave (at least one agent), then the staged curve.
    Canary,
    /// Everything in one wave.
    Immediate,
    /// Fixed-size waves, each started by an operator `advance`.
    Manual {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        batch_size: Option<u32>,
    },
}

impl Strategy {
    pub fn is_manual(&self) -> bool {
        matches!(self, Self::Manual { .. })
    }
}

// ── Rollout ───────────────────────────────────────────────────────

/// Lifecycle status of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
    RolledBack,
}

impl RolloutStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked campaign moving part of the fleet to one release version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rollout {
    pub id: RolloutId,
    pub release_id: ReleaseId,
    /// Target version, copied from the release at creation.
    pub version: String,
    pub strategy: Strategy,
    #[serde(default)]
    pub selector: AgentSelector,
    pub status: RolloutStatus,
    /// 1-based index of the active wave; 0 before the rollout starts.
    pub current_wave: u32,
    pub total_waves: u32,
    pub agents_total: u32,
    pub agents_updated: u32,
    pub agents_updating: u32,
    pub agents_pending: u32,
    pub agents_failed: u32,
    /// Highest wave an operator has released (manual strategy only).
    #[serde(default)]
    pub approved_wave: u32,
    /// Whether the late-joiner catch-up pass already ran.
    #[serde(default)]
    pub catch_up_done: bool,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub updated_at: u64,
    pub finished_at: Option<u64>,
    pub last_error: Option<String>,
}

impl Rollout {
    /// Build the key for the rollouts table.
    pub fn table_key(&self) -> &str {
        &self.id
    }

    /// Whether the scheduler still has work to do for this rollout.
    ///
    /// Rolled-back rollouts stay active until their downgrades settle.
    pub fn needs_tick(&self) -> bool {
        match self.status {
            RolloutStatus::Pending | RolloutStatus::InProgress | RolloutStatus::Paused => true,
            RolloutStatus::RolledBack => self.agents_updating > 0,
            RolloutStatus::Completed | RolloutStatus::Failed => false,
        }
    }

    /// Recompute the per-status counters from the agent rows.
    pub fn recount(&mut self, agents: &[AgentUpdateState]) {
        let (mut pending, mut updating, mut updated, mut failed) = (0u32, 0u32, 0u32, 0u32);
        for agent in agents {
            match agent.status {
                AgentUpdateStatus::Pending => pending += 1,
                AgentUpdateStatus::Updating => updating += 1,
                AgentUpdateStatus::Updated => updated += 1,
                AgentUpdateStatus::Failed => failed += 1,
            }
        }
        self.agents_pending = pending;
        self.agents_updating = updating;
        self.agents_updated = updated;
        self.agents_failed = failed;
        self.agents_total = pending + updating + updated + failed;
    }

    /// `agents_updated + agents_updating + agents_pending + agents_failed == agents_total`.
    pub fn counters_consistent(&self) -> bool {
        self.agents_updated + self.agents_updating + self.agents_pending + self.agents_failed
            == self.agents_total
    }

    /// Fraction of all agents that ended terminally failed.
    pub fn failure_ratio(&self) -> f64 {
        if self.agents_total == 0 {
            return 0.0;
        }
        f64::from(self.agents_failed) / f64::from(self.agents_total)
    }
}

// ── Agent update rows ─────────────────────────────────────────────

/// Per-agent status within one rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentUpdateStatus {
    Pending,
    Updating,
    Updated,
    Failed,
}

impl AgentUpdateStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Updated | Self::Failed)
    }
}

/// Progress of one agent in one rollout.
///
/// While `status == Updating` the row is in one of two sub-states:
/// a command is due (`next_attempt_at` is set) or a command was issued and
/// the result is awaited (`next_attempt_at` is `None`, `attempts > 0`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentUpdateState {
    pub rollout_id: RolloutId,
    pub agent_id: AgentId,
    pub agent_name: String,
    pub from_version: String,
    pub to_version: String,
    /// 1-based wave this agent was planned into.
    pub wave: u32,
    pub status: AgentUpdateStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<u64>,
    pub next_attempt_at: Option<u64>,
    pub last_error: Option<String>,
    /// Set once the row has been reassigned to a downgrade.
    #[serde(default)]
    pub rollback: bool,
}

impl AgentUpdateState {
    /// Build the composite key for the agent_updates table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.rollout_id, self.agent_id)
    }

    /// A new `Pending` row for an agent planned into `wave`.
    pub fn planned(rollout_id: &str, agent: &AgentSnapshot, to_version: &str, wave: u32) -> Self {
        Self {
            rollout_id: rollout_id.to_string(),
            agent_id: agent.id.clone(),
            agent_name: agent.name.clone(),
            from_version: agent.current_version.clone(),
            to_version: to_version.to_string(),
            wave,
            status: AgentUpdateStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            next_attempt_at: None,
            last_error: None,
            rollback: false,
        }
    }

    /// A command should be (re)issued at or before `now`.
    pub fn is_due(&self, now: u64) -> bool {
        self.status == AgentUpdateStatus::Updating
            && self.next_attempt_at.is_some_and(|at| at <= now)
    }

    /// A command was issued and its result has not been observed yet.
    pub fn awaiting_result(&self) -> bool {
        self.status == AgentUpdateStatus::Updating
            && self.next_attempt_at.is_none()
            && self.attempts > 0
    }
}
