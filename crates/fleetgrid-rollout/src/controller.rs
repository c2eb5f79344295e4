//! Rollout controller: drives the rollout state machine.
//!
//! The controller is the only writer of rollouts and agent rows. Each tick
//! loads a rollout, observes in-flight agent updates, advances waves,
//! issues due commands, and commits everything back in one transaction.
//! Operator actions (pause, resume, advance, rollback, status reports) run
//! under the same per-rollout lock as ticks.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fleetgrid_state::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RolloutConfig;
use crate::error::{RolloutError, RolloutResult};
use crate::fanout::run_bounded;
use crate::lifecycle::{can_transition, transition};
use crate::locks::RolloutLocks;
use crate::planner::plan_waves;
use crate::registry::{
    AgentObservation, AgentRegistry, RegistryError, RegistryResult, ReleaseCatalog,
};

/// Operator request to start moving the fleet to a release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRollout {
    pub release_id: ReleaseId,
    pub strategy: Strategy,
    #[serde(default)]
    pub selector: AgentSelector,
}

/// Result pushed by an agent (or its transport) instead of being polled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentReport {
    /// Version the agent now runs.
    pub version: String,
    /// Set when the update attempt failed.
    #[serde(default)]
    pub error: Option<String>,
}

/// Point-in-time view of a rollout and its per-agent progress.
#[derive(Debug, Clone, Serialize)]
pub struct RolloutDetail {
    pub rollout: Rollout,
    pub agents: Vec<AgentUpdateState>,
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub status: RolloutStatus,
    pub current_wave: u32,
    /// Wave started during this tick, if any.
    pub wave_started: Option<u32>,
    /// Update commands accepted by the registry.
    pub issued: usize,
    /// Agents that reached `updated` or terminal `failed`.
    pub settled: usize,
    /// Attempts that failed and were scheduled for retry.
    pub retries_scheduled: usize,
    /// The next manual wave is waiting for an operator `advance`.
    pub awaiting_approval: bool,
    /// Whether anything was written to the store.
    pub persisted: bool,
}

impl TickReport {
    fn new(rollout: &Rollout) -> Self {
        Self {
            status: rollout.status,
            current_wave: rollout.current_wave,
            wave_started: None,
            issued: 0,
            settled: 0,
            retries_scheduled: 0,
            awaiting_approval: false,
            persisted: false,
        }
    }

    fn finish(mut self, rollout: &Rollout, persisted: bool) -> Self {
        self.status = rollout.status;
        self.current_wave = rollout.current_wave;
        self.persisted = persisted;
        self
    }
}

/// Outcome of asking the controller to tick a rollout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick or operator action holds the rollout; nothing was done.
    Busy,
    Ticked(TickReport),
}

impl TickOutcome {
    pub fn into_report(self) -> Option<TickReport> {
        match self {
            Self::Busy => None,
            Self::Ticked(report) => Some(report),
        }
    }
}

/// How an observed agent stands after an update command.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Settle {
    Updated,
    Failed(String),
    Waiting,
}

/// A rollout loaded for mutation, with the indexes of rows touched so far.
struct Working {
    rollout: Rollout,
    agents: Vec<AgentUpdateState>,
    changed: BTreeSet<usize>,
    before: Rollout,
}

/// Drives rollouts through their lifecycle. Cheap to clone.
#[derive(Clone)]
pub struct RolloutController {
    store: StateStore,
    registry: Arc<dyn AgentRegistry>,
    catalog: Arc<dyn ReleaseCatalog>,
    config: Arc<RolloutConfig>,
    locks: RolloutLocks,
}

impl RolloutController {
    /// Create a controller over a store and the external collaborators.
    pub fn new(
        store: StateStore,
        registry: Arc<dyn AgentRegistry>,
        catalog: Arc<dyn ReleaseCatalog>,
        config: RolloutConfig,
    ) -> RolloutResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            registry,
            catalog,
            config: Arc::new(config),
            locks: RolloutLocks::new(),
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &RolloutConfig {
        &self.config
    }

    pub fn locks(&self) -> &RolloutLocks {
        &self.locks
    }

    // ── Queries ────────────────────────────────────────────────────

    /// All rollouts, including terminal ones.
    pub fn list(&self) -> RolloutResult<Vec<Rollout>> {
        Ok(self.store.list_rollouts()?)
    }

    /// A rollout and its agent rows, read from one snapshot.
    pub fn get(&self, rollout_id: &str) -> RolloutResult<RolloutDetail> {
        let (rollout, agents) = self
            .store
            .load_rollout(rollout_id)?
            .ok_or_else(|| RolloutError::NotFound(rollout_id.to_string()))?;
        Ok(RolloutDetail { rollout, agents })
    }

    /// IDs of the rollouts the scheduler should tick.
    pub fn active_rollout_ids(&self) -> RolloutResult<Vec<RolloutId>> {
        Ok(self.store.list_active_rollout_ids()?)
    }

    // ── Creation ───────────────────────────────────────────────────

    /// Plan and persist a new rollout.
    pub async fn create(&self, request: CreateRollout) -> RolloutResult<Rollout> {
        self.create_at(request, epoch_millis()).await
    }

    /// [`Self::create`] with an explicit clock reading.
    pub async fn create_at(&self, request: CreateRollout, now: u64) -> RolloutResult<Rollout> {
        let strategy = self.resolve_strategy(request.strategy)?;

        let release = self
            .call(self.catalog.get_release(&request.release_id))
            .await?
            .ok_or_else(|| RolloutError::ReleaseNotFound(request.release_id.clone()))?;
        if release.status != ReleaseStatus::Available {
            return Err(RolloutError::ReleaseNotEligible {
                id: release.id,
                status: release.status,
            });
        }

        let fleet = self.call(self.registry.fleet_snapshot()).await?;
        let fleet_size = fleet.len();
        let eligible: HashMap<AgentId, AgentSnapshot> = fleet
            .into_iter()
            .filter(|a| is_eligible(a, &request.selector, &release.version))
            .map(|a| (a.id.clone(), a))
            .collect();
        let ids: Vec<AgentId> = eligible.keys().cloned().collect();
        let waves = plan_waves(&strategy, &ids);

        let id = Uuid::new_v4().to_string();
        let mut rows = Vec::with_capacity(ids.len());
        for (index, wave) in waves.iter().enumerate() {
            let wave_no = index as u32 + 1;
            rows.extend(
                wave.iter()
                    .filter_map(|agent_id| eligible.get(agent_id))
                    .map(|agent| AgentUpdateState::planned(&id, agent, &release.version, wave_no)),
            );
        }

        let mut rollout = Rollout {
            id: id.clone(),
            release_id: release.id.clone(),
            version: release.version.clone(),
            strategy,
            selector: request.selector,
            status: RolloutStatus::Pending,
            current_wave: 0,
            total_waves: waves.len() as u32,
            agents_total: 0,
            agents_updated: 0,
            agents_updating: 0,
            agents_pending: 0,
            agents_failed: 0,
            approved_wave: 0,
            catch_up_done: false,
            created_at: now,
            started_at: None,
            updated_at: now,
            finished_at: None,
            last_error: None,
        };
        rollout.recount(&rows);

        if rollout.total_waves == 0 {
            transition(&mut rollout, RolloutStatus::InProgress, "start", now)?;
            rollout.started_at = Some(now);
            transition(&mut rollout, RolloutStatus::Completed, "complete", now)?;
        }

        self.store.insert_rollout(&rollout, &rows)?;
        info!(
            rollout = %id,
            release = %rollout.release_id,
            version = %rollout.version,
            strategy = ?rollout.strategy,
            fleet_size,
            agents = rollout.agents_total,
            waves = rollout.total_waves,
            "rollout created"
        );
        Ok(rollout)
    }

    fn resolve_strategy(&self, strategy: Strategy) -> RolloutResult<Strategy> {
        match strategy {
            Strategy::Manual { batch_size: Some(0) } => Err(RolloutError::InvalidStrategy(
                "manual batch_size must be at least 1".to_string(),
            )),
            Strategy::Manual { batch_size: None } => Ok(Strategy::Manual {
                batch_size: Some(self.config.manual_batch_size),
            }),
            other => Ok(other),
        }
    }

    // ── Operator actions ───────────────────────────────────────────

    /// Stop starting new waves. In-flight updates still resolve.
    pub async fn pause(&self, rollout_id: &str) -> RolloutResult<Rollout> {
        self.operator_transition(rollout_id, RolloutStatus::Paused, "pause")
            .await
    }

    /// Continue a paused rollout from its current wave.
    pub async fn resume(&self, rollout_id: &str) -> RolloutResult<Rollout> {
        self.operator_transition(rollout_id, RolloutStatus::InProgress, "resume")
            .await
    }

    async fn operator_transition(
        &self,
        rollout_id: &str,
        to: RolloutStatus,
        action: &str,
    ) -> RolloutResult<Rollout> {
        let _guard = self.locks.acquire(rollout_id, self.config.lock_timeout).await?;
        let now = epoch_millis();
        let mut work = self.load(rollout_id)?;
        transition(&mut work.rollout, to, action, now)?;
        self.persist(&mut work, now)?;
        Ok(work.rollout)
    }

    /// Approve the next wave of a manual rollout.
    pub async fn advance(&self, rollout_id: &str) -> RolloutResult<Rollout> {
        let _guard = self.locks.acquire(rollout_id, self.config.lock_timeout).await?;
        let now = epoch_millis();
        let mut work = self.load(rollout_id)?;
        let rollout = &mut work.rollout;

        if !rollout.strategy.is_manual() {
            return Err(RolloutError::InvalidAction(format!(
                "rollout {rollout_id} is not manual; waves advance automatically"
            )));
        }
        if rollout.status != RolloutStatus::InProgress {
            return Err(RolloutError::conflict(
                rollout_id,
                format!("cannot advance while {}", rollout.status),
            ));
        }
        let next = rollout.current_wave + 1;
        if next > rollout.total_waves {
            return Err(RolloutError::conflict(rollout_id, "no waves remaining"));
        }
        if rollout.approved_wave >= next {
            return Err(RolloutError::conflict(
                rollout_id,
                format!("wave {next} is already approved"),
            ));
        }

        rollout.approved_wave = next;
        info!(rollout = %rollout_id, wave = next, "manual wave approved");
        self.persist(&mut work, now)?;
        Ok(work.rollout)
    }

    /// Send every updated or updating agent back to its previous version.
    pub async fn rollback(&self, rollout_id: &str, reason: &str) -> RolloutResult<Rollout> {
        self.rollback_at(rollout_id, reason, epoch_millis()).await
    }

    /// [`Self::rollback`] with an explicit clock reading.
    ///
    /// The rollout turns `rolled_back` as soon as the downgrade commands are
    /// issued; the scheduler keeps tracking the downgrades afterwards.
    pub async fn rollback_at(
        &self,
        rollout_id: &str,
        reason: &str,
        now: u64,
    ) -> RolloutResult<Rollout> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(RolloutError::InvalidAction(
                "rollback requires a reason".to_string(),
            ));
        }

        let _guard = self.locks.acquire(rollout_id, self.config.lock_timeout).await?;
        let mut work = self.load(rollout_id)?;
        let status = work.rollout.status;
        if !can_transition(status, RolloutStatus::RolledBack) {
            return Err(RolloutError::conflict(
                rollout_id,
                format!("cannot roll back while {status}"),
            ));
        }

        let mut reassigned = 0;
        for (index, row) in work.agents.iter_mut().enumerate() {
            if matches!(
                row.status,
                AgentUpdateStatus::Updated | AgentUpdateStatus::Updating
            ) {
                row.to_version = row.from_version.clone();
                row.status = AgentUpdateStatus::Updating;
                row.attempts = 0;
                row.last_attempt_at = None;
                row.next_attempt_at = Some(now);
                row.last_error = None;
                row.rollback = true;
                work.changed.insert(index);
                reassigned += 1;
            }
        }

        let mut report = TickReport::new(&work.rollout);
        self.dispatch(&mut work, now, &mut report).await;

        transition(&mut work.rollout, RolloutStatus::RolledBack, "roll back", now)?;
        work.rollout.last_error = Some(format!("rolled back: {reason}"));
        self.persist(&mut work, now)?;

        warn!(
            rollout = %rollout_id,
            reassigned,
            issued = report.issued,
            %reason,
            "rollout rolled back"
        );
        Ok(work.rollout)
    }

    /// Apply a result pushed for one agent.
    pub async fn report(
        &self,
        rollout_id: &str,
        agent_id: &str,
        report: AgentReport,
    ) -> RolloutResult<AgentUpdateState> {
        self.report_at(rollout_id, agent_id, report, epoch_millis())
            .await
    }

    /// [`Self::report`] with an explicit clock reading.
    ///
    /// Reports only count while a command is in flight for the agent; late
    /// or duplicate reports leave the row unchanged.
    pub async fn report_at(
        &self,
        rollout_id: &str,
        agent_id: &str,
        report: AgentReport,
        now: u64,
    ) -> RolloutResult<AgentUpdateState> {
        let _guard = self.locks.acquire(rollout_id, self.config.lock_timeout).await?;
        let mut work = self.load(rollout_id)?;
        let index = work
            .agents
            .iter()
            .position(|a| a.agent_id == agent_id)
            .ok_or_else(|| RolloutError::AgentNotFound {
                rollout_id: rollout_id.to_string(),
                agent_id: agent_id.to_string(),
            })?;

        if work.agents[index].awaiting_result() {
            let observation = AgentObservation {
                current_version: report.version,
                last_error: report.error,
            };
            let mut tick = TickReport::new(&work.rollout);
            self.apply_observation(&mut work, index, Some(Ok(observation)), now, &mut tick);
            self.persist(&mut work, now)?;
        } else {
            debug!(rollout = %rollout_id, agent = %agent_id, "report ignored, no update in flight");
        }
        Ok(work.agents[index].clone())
    }

    // ── Tick ───────────────────────────────────────────────────────

    /// Advance a rollout by one step.
    pub async fn tick(&self, rollout_id: &str) -> RolloutResult<TickOutcome> {
        self.tick_at(rollout_id, epoch_millis()).await
    }

    /// [`Self::tick`] with an explicit clock reading.
    ///
    /// Returns `Busy` without waiting if the rollout is locked.
    pub async fn tick_at(&self, rollout_id: &str, now: u64) -> RolloutResult<TickOutcome> {
        let Some(_guard) = self.locks.try_acquire(rollout_id) else {
            debug!(rollout = %rollout_id, "tick skipped, rollout busy");
            return Ok(TickOutcome::Busy);
        };

        let mut work = self.load(rollout_id)?;
        let mut report = TickReport::new(&work.rollout);
        if !work.rollout.needs_tick() {
            return Ok(TickOutcome::Ticked(report.finish(&work.rollout, false)));
        }

        if work.rollout.status == RolloutStatus::Pending {
            self.start(&mut work, now, &mut report)?;
        }

        self.observe(&mut work, now, &mut report).await;

        if work.rollout.status == RolloutStatus::InProgress {
            self.evaluate(&mut work, now, &mut report).await?;
        }

        self.dispatch(&mut work, now, &mut report).await;

        let persisted = self.persist(&mut work, now)?;
        if persisted {
            debug!(
                rollout = %rollout_id,
                status = %work.rollout.status,
                wave = work.rollout.current_wave,
                issued = report.issued,
                settled = report.settled,
                "tick applied"
            );
        }
        Ok(TickOutcome::Ticked(report.finish(&work.rollout, persisted)))
    }

    fn start(&self, work: &mut Working, now: u64, report: &mut TickReport) -> RolloutResult<()> {
        transition(&mut work.rollout, RolloutStatus::InProgress, "start", now)?;
        work.rollout.started_at = Some(now);
        if work.rollout.strategy.is_manual() {
            work.rollout.approved_wave = 1;
        }
        self.activate_wave(work, 1, now, report);
        Ok(())
    }

    /// Move the pending rows of `wave` to updating and make their commands due.
    fn activate_wave(&self, work: &mut Working, wave: u32, now: u64, report: &mut TickReport) {
        work.rollout.current_wave = wave;
        let mut count = 0;
        for (index, row) in work.agents.iter_mut().enumerate() {
            if row.wave == wave && row.status == AgentUpdateStatus::Pending {
                row.status = AgentUpdateStatus::Updating;
                row.attempts = 0;
                row.next_attempt_at = Some(now);
                row.last_error = None;
                work.changed.insert(index);
                count += 1;
            }
        }
        report.wave_started = Some(wave);
        info!(
            rollout = %work.rollout.id,
            wave,
            total_waves = work.rollout.total_waves,
            agents = count,
            "wave started"
        );
    }

    /// Poll the registry for every agent with a command in flight.
    async fn observe(&self, work: &mut Working, now: u64, report: &mut TickReport) {
        let awaiting: Vec<usize> = work
            .agents
            .iter()
            .enumerate()
            .filter(|(_, a)| a.awaiting_result())
            .map(|(i, _)| i)
            .collect();
        if awaiting.is_empty() {
            return;
        }

        let jobs = awaiting
            .iter()
            .map(|&index| {
                let registry = Arc::clone(&self.registry);
                let agent_id = work.agents[index].agent_id.clone();
                (index, async move { registry.observe(&agent_id).await })
            })
            .collect();
        let mut results: HashMap<usize, RegistryResult<AgentObservation>> = run_bounded(
            self.config.max_concurrency,
            self.config.command_timeout,
            jobs,
        )
        .await
        .into_iter()
        .collect();

        for index in awaiting {
            let observation = results.remove(&index);
            self.apply_observation(work, index, observation, now, report);
        }
    }

    fn apply_observation(
        &self,
        work: &mut Working,
        index: usize,
        observation: Option<RegistryResult<AgentObservation>>,
        now: u64,
        report: &mut TickReport,
    ) {
        let row = &mut work.agents[index];
        match settle(row, observation, now, self.config.update_timeout) {
            Settle::Waiting => return,
            Settle::Updated => {
                row.status = AgentUpdateStatus::Updated;
                row.last_error = None;
                row.next_attempt_at = None;
                report.settled += 1;
                debug!(
                    rollout = %row.rollout_id,
                    agent = %row.agent_id,
                    version = %row.to_version,
                    "agent updated"
                );
            }
            Settle::Failed(error) => {
                if self.fail_attempt(row, error, now) {
                    report.settled += 1;
                } else {
                    report.retries_scheduled += 1;
                }
            }
        }
        work.changed.insert(index);
    }

    /// Record a failed attempt. Returns true if the agent is now terminally failed.
    fn fail_attempt(&self, row: &mut AgentUpdateState, error: String, now: u64) -> bool {
        if row.attempts >= self.config.max_attempts {
            row.status = AgentUpdateStatus::Failed;
            row.next_attempt_at = None;
            warn!(
                rollout = %row.rollout_id,
                agent = %row.agent_id,
                attempts = row.attempts,
                %error,
                "agent update failed"
            );
            row.last_error = Some(error);
            return true;
        }

        let delay = self.config.backoff_for(row.attempts);
        row.next_attempt_at = Some(now.saturating_add(millis(delay)));
        warn!(
            rollout = %row.rollout_id,
            agent = %row.agent_id,
            attempt = row.attempts,
            retry_in_ms = millis(delay),
            %error,
            "agent update attempt failed, retrying"
        );
        row.last_error = Some(error);
        false
    }

    /// Decide whether the current wave is finished and what comes next.
    async fn evaluate(
        &self,
        work: &mut Working,
        now: u64,
        report: &mut TickReport,
    ) -> RolloutResult<()> {
        work.rollout.recount(&work.agents);
        let wave = work.rollout.current_wave;
        let wave_done = work
            .agents
            .iter()
            .filter(|a| a.wave == wave)
            .all(|a| a.status.is_terminal());
        if !wave_done {
            return Ok(());
        }

        let ratio = work.rollout.failure_ratio();
        if ratio > self.config.failure_threshold {
            let summary = format!(
                "failure threshold exceeded after wave {}/{}: {} of {} agents failed ({:.1}% > {:.1}%)",
                wave,
                work.rollout.total_waves,
                work.rollout.agents_failed,
                work.rollout.agents_total,
                ratio * 100.0,
                self.config.failure_threshold * 100.0,
            );
            warn!(rollout = %work.rollout.id, "{summary}");
            transition(&mut work.rollout, RolloutStatus::Failed, "fail", now)?;
            work.rollout.last_error = Some(summary);
            return Ok(());
        }

        if wave < work.rollout.total_waves {
            if work.rollout.strategy.is_manual() && work.rollout.approved_wave <= wave {
                report.awaiting_approval = true;
                debug!(rollout = %work.rollout.id, wave, "waiting for operator to advance");
                return Ok(());
            }
            self.activate_wave(work, wave + 1, now, report);
            return Ok(());
        }

        if self.config.catch_up && !work.rollout.catch_up_done && !work.rollout.strategy.is_manual()
        {
            match self.catch_up(work).await {
                Ok(0) => {}
                Ok(_) => {
                    let wave = work.rollout.total_waves;
                    self.activate_wave(work, wave, now, report);
                    return Ok(());
                }
                Err(e) => {
                    warn!(rollout = %work.rollout.id, error = %e, "catch-up snapshot failed, will retry");
                    return Ok(());
                }
            }
        }

        transition(&mut work.rollout, RolloutStatus::Completed, "complete", now)?;
        info!(
            rollout = %work.rollout.id,
            updated = work.rollout.agents_updated,
            failed = work.rollout.agents_failed,
            "rollout completed"
        );
        Ok(())
    }

    /// Append agents that joined the fleet after planning as one final wave.
    async fn catch_up(&self, work: &mut Working) -> RolloutResult<usize> {
        let fleet = self.call(self.registry.fleet_snapshot()).await?;
        let known: HashSet<&str> = work.agents.iter().map(|a| a.agent_id.as_str()).collect();
        let mut newcomers: Vec<AgentSnapshot> = fleet
            .into_iter()
            .filter(|a| !known.contains(a.id.as_str()))
            .filter(|a| is_eligible(a, &work.rollout.selector, &work.rollout.version))
            .collect();
        newcomers.sort_by(|a, b| a.id.cmp(&b.id));
        newcomers.dedup_by(|a, b| a.id == b.id);

        work.rollout.catch_up_done = true;
        if newcomers.is_empty() {
            debug!(rollout = %work.rollout.id, "catch-up found no new agents");
            return Ok(0);
        }

        let wave = work.rollout.total_waves + 1;
        work.rollout.total_waves = wave;
        for agent in &newcomers {
            work.agents.push(AgentUpdateState::planned(
                &work.rollout.id,
                agent,
                &work.rollout.version,
                wave,
            ));
            work.changed.insert(work.agents.len() - 1);
        }
        info!(
            rollout = %work.rollout.id,
            wave,
            agents = newcomers.len(),
            "catch-up wave planned"
        );
        Ok(newcomers.len())
    }

    /// Issue commands for every row that is due, concurrently.
    async fn dispatch(&self, work: &mut Working, now: u64, report: &mut TickReport) {
        let due: Vec<usize> = work
            .agents
            .iter()
            .enumerate()
            .filter(|(_, a)| a.is_due(now))
            .map(|(i, _)| i)
            .collect();
        if due.is_empty() {
            return;
        }

        let jobs = due
            .iter()
            .map(|&index| {
                let registry = Arc::clone(&self.registry);
                let agent_id = work.agents[index].agent_id.clone();
                let version = work.agents[index].to_version.clone();
                (index, async move {
                    registry.command_update(&agent_id, &version).await
                })
            })
            .collect();
        let mut results: HashMap<usize, RegistryResult<()>> = run_bounded(
            self.config.max_concurrency,
            self.config.command_timeout,
            jobs,
        )
        .await
        .into_iter()
        .collect();

        for index in due {
            // A lost result leaves the row due for the next tick.
            let Some(result) = results.remove(&index) else {
                continue;
            };
            let row = &mut work.agents[index];
            row.attempts += 1;
            row.last_attempt_at = Some(now);
            row.next_attempt_at = None;
            match result {
                Ok(()) => {
                    row.last_error = None;
                    report.issued += 1;
                    debug!(
                        rollout = %row.rollout_id,
                        agent = %row.agent_id,
                        version = %row.to_version,
                        attempt = row.attempts,
                        "update command issued"
                    );
                }
                Err(e) => {
                    if self.fail_attempt(row, format!("command failed: {e}"), now) {
                        report.settled += 1;
                    } else {
                        report.retries_scheduled += 1;
                    }
                }
            }
            work.changed.insert(index);
        }
    }

    // ── Persistence ────────────────────────────────────────────────

    fn load(&self, rollout_id: &str) -> RolloutResult<Working> {
        let (rollout, agents) = self
            .store
            .load_rollout(rollout_id)?
            .ok_or_else(|| RolloutError::NotFound(rollout_id.to_string()))?;
        Ok(Working {
            before: rollout.clone(),
            rollout,
            agents,
            changed: BTreeSet::new(),
        })
    }

    /// Recount and commit if anything changed. Returns whether it wrote.
    fn persist(&self, work: &mut Working, now: u64) -> RolloutResult<bool> {
        work.rollout.recount(&work.agents);
        if work.changed.is_empty() && work.rollout == work.before {
            return Ok(false);
        }
        work.rollout.updated_at = now;
        let rows: Vec<AgentUpdateState> = work
            .changed
            .iter()
            .filter_map(|&i| work.agents.get(i).cloned())
            .collect();
        self.store.commit_rollout(&work.rollout, &rows)?;
        work.before = work.rollout.clone();
        work.changed.clear();
        Ok(true)
    }

    /// Run a registry or catalog call under the command timeout.
    async fn call<T>(&self, fut: impl Future<Output = RegistryResult<T>>) -> RegistryResult<T> {
        let limit = self.config.command_timeout;
        tokio::time::timeout(limit, fut)
            .await
            .unwrap_or_else(|_| Err(RegistryError::Timeout(limit)))
    }
}

fn is_eligible(agent: &AgentSnapshot, selector: &AgentSelector, version: &str) -> bool {
    selector.matches(agent) && agent.current_version != version
}

/// Classify an in-flight row from what the registry reported.
fn settle(
    row: &AgentUpdateState,
    observation: Option<RegistryResult<AgentObservation>>,
    now: u64,
    update_timeout: Duration,
) -> Settle {
    let verdict = match observation {
        Some(Ok(obs)) if obs.current_version == row.to_version => Settle::Updated,
        Some(Ok(AgentObservation {
            last_error: Some(error),
            ..
        })) => Settle::Failed(error),
        Some(Ok(_)) | None => Settle::Waiting,
        Some(Err(e)) => {
            debug!(agent = %row.agent_id, error = %e, "agent poll failed");
            Settle::Waiting
        }
    };

    let issued_at = row.last_attempt_at.unwrap_or(now);
    if verdict == Settle::Waiting && now.saturating_sub(issued_at) >= millis(update_timeout) {
        return Settle::Failed(format!(
            "update not confirmed within {}s",
            update_timeout.as_secs()
        ));
    }
    verdict
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Current unix time in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(millis)
        .unwrap_or_default()
}
