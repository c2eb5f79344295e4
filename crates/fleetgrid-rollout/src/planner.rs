//! Wave planner: splits the eligible agents into ordered waves.
//!
//! Planning is a pure function of the strategy and the agent IDs. Agents are
//! sorted by ID first, so planning the same fleet twice yields the same
//! waves regardless of the order the registry returned them in.

use fleetgrid_state::{AgentId, Strategy};

/// Cumulative percentages of the fleet covered after each staged wave.
pub const STAGED_CURVE: [usize; 4] = [10, 25, 50, 100];

/// Size of the canary wave as a percentage of the fleet.
pub const CANARY_PERCENT: usize = 5;

/// Batch size used by manual rollouts that do not name one.
pub const DEFAULT_MANUAL_BATCH: u32 = 1;

/// An ordered batch of agents updated together.
pub type Wave = Vec<AgentId>;

/// Plan the waves for `strategy` over the eligible agents.
///
/// The returned waves are disjoint, never empty, and together contain every
/// distinct eligible agent exactly once. An empty fleet yields no waves.
pub fn plan_waves(strategy: &Strategy, eligible: &[AgentId]) -> Vec<Wave> {
    let mut agents = eligible.to_vec();
    agents.sort();
    agents.dedup();

    if agents.is_empty() {
        return Vec::new();
    }

    match strategy {
        Strategy::Staged => split_cumulative(&agents, &STAGED_CURVE),
        Strategy::Canary => {
            let canary = (agents.len() * CANARY_PERCENT / 100).clamp(1, agents.len());
            let (head, rest) = agents.split_at(canary);
            let mut waves = vec![head.to_vec()];
            waves.extend(split_cumulative(rest, &STAGED_CURVE));
            waves
        }
        Strategy::Immediate => vec![agents],
        Strategy::Manual { batch_size } => {
            let size = batch_size.unwrap_or(DEFAULT_MANUAL_BATCH).max(1) as usize;
            agents.chunks(size).map(<[AgentId]>::to_vec).collect()
        }
    }
}

/// Cut `agents` at the cumulative percentage boundaries of `curve`.
///
/// Boundaries round down; the last step always ends at the full population
/// so it absorbs the remainder. Steps that add no agents are skipped.
fn split_cumulative(agents: &[AgentId], curve: &[usize]) -> Vec<Wave> {
    let n = agents.len();
    let mut waves = Vec::new();
    let mut assigned = 0;

    for (step, pct) in curve.iter().enumerate() {
        let target = if step + 1 == curve.len() {
            n
        } else {
            (n * pct / 100).min(n)
        };
        if target > assigned {
            waves.push(agents[assigned..target].to_vec());
            assigned = target;
        }
    }
    waves
}
