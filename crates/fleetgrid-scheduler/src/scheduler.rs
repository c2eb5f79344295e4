//! Rollout scheduler: the periodic driver.
//!
//! Every pass reaps finished ticks, lists the rollouts that still need work
//! and spawns a tick for each one that has no tick in flight. A rollout
//! stuck on a slow agent only delays itself; the controller bounds each
//! registry call by its command timeout.

use std::collections::HashMap;
use std::time::Duration;

use fleetgrid_rollout::{RolloutController, RolloutResult, TickOutcome};
use fleetgrid_state::RolloutId;
use tokio::sync::watch;
use tokio::task::{self, JoinError, JoinSet};
use tracing::{debug, error, info};

use crate::error::{SchedulerError, SchedulerResult};

/// What one scheduling pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Ticks started in this pass.
    pub spawned: usize,
    /// Active rollouts skipped because their previous tick is still running.
    pub skipped: usize,
    /// Finished ticks collected at the start of the pass.
    pub reaped: usize,
}

/// Drives every active rollout through the controller on a fixed cadence.
pub struct RolloutScheduler {
    controller: RolloutController,
    interval: Duration,
    in_flight: JoinSet<RolloutResult<TickOutcome>>,
    /// Task → rollout, for every tick in `in_flight`.
    running: HashMap<task::Id, RolloutId>,
}

impl RolloutScheduler {
    /// Create a scheduler that runs a pass every `interval`.
    pub fn new(controller: RolloutController, interval: Duration) -> SchedulerResult<Self> {
        if interval.is_zero() {
            return Err(SchedulerError::InvalidInterval(interval));
        }
        Ok(Self {
            controller,
            interval,
            in_flight: JoinSet::new(),
            running: HashMap::new(),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of ticks currently in flight.
    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    fn is_running(&self, rollout_id: &str) -> bool {
        self.running.values().any(|id| id == rollout_id)
    }

    /// Run one scheduling pass without waiting for the ticks it starts.
    pub fn poll_once(&mut self) -> SchedulerResult<PassReport> {
        let mut pass = PassReport {
            reaped: self.reap(),
            ..PassReport::default()
        };

        for rollout_id in self.controller.active_rollout_ids()? {
            if self.is_running(&rollout_id) {
                debug!(rollout = %rollout_id, "previous tick still running");
                pass.skipped += 1;
                continue;
            }

            let controller = self.controller.clone();
            let id = rollout_id.clone();
            let handle = self
                .in_flight
                .spawn(async move { controller.tick(&id).await });
            self.running.insert(handle.id(), rollout_id);
            pass.spawned += 1;
        }
        Ok(pass)
    }

    fn reap(&mut self) -> usize {
        let mut reaped = 0;
        while let Some(joined) = self.in_flight.try_join_next_with_id() {
            self.finish(joined);
            reaped += 1;
        }
        reaped
    }

    fn finish(&mut self, joined: Result<(task::Id, RolloutResult<TickOutcome>), JoinError>) {
        let (task_id, result) = match joined {
            Ok(done) => done,
            Err(e) => {
                let rollout = self.running.remove(&e.id()).unwrap_or_default();
                error!(rollout = %rollout, error = %e, "rollout tick task failed");
                return;
            }
        };
        let rollout = self.running.remove(&task_id).unwrap_or_default();

        match result {
            Ok(TickOutcome::Busy) => {
                debug!(rollout = %rollout, "rollout busy, tick skipped");
            }
            Ok(TickOutcome::Ticked(report)) if report.persisted => {
                debug!(
                    rollout = %rollout,
                    status = %report.status,
                    wave = report.current_wave,
                    issued = report.issued,
                    settled = report.settled,
                    "tick finished"
                );
            }
            Ok(TickOutcome::Ticked(_)) => {}
            Err(e) => {
                error!(rollout = %rollout, error = %e, "rollout tick failed");
            }
        }
    }

    /// Wait for every in-flight tick to finish.
    pub async fn drain(&mut self) {
        while let Some(joined) = self.in_flight.join_next_with_id().await {
            self.finish(joined);
        }
    }

    /// Run passes until `shutdown` changes, then drain in-flight ticks.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "rollout scheduler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    match self.poll_once() {
                        Ok(pass) if pass.spawned > 0 || pass.skipped > 0 => {
                            debug!(
                                spawned = pass.spawned,
                                skipped = pass.skipped,
                                reaped = pass.reaped,
                                "scheduler pass"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "scheduler pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("rollout scheduler shutting down");
                    break;
                }
            }
        }

        self.drain().await;
    }
}
