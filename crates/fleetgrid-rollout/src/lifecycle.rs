//! Rollout status transitions.
//!
//! Every status change goes through [`transition`], so the allowed edges
//! live in one table:
//!
//! ```text
//! pending ──▶ in_progress ⇄ paused
//!             in_progress ──▶ completed
//!   in_progress | paused ──▶ failed
//!   in_progress | paused ──▶ rolled_back
//! ```

use fleetgrid_state::{Rollout, RolloutStatus};
use tracing::info;

use crate::error::{RolloutError, RolloutResult};

/// Whether a rollout may move from `from` to `to`.
pub fn can_transition(from: RolloutStatus, to: RolloutStatus) -> bool {
    use fleetgrid_state::RolloutStatus::*;
    matches!(
        (from, to),
        (Pending, InProgress)
            | (InProgress, Paused)
            | (Paused, InProgress)
            | (InProgress, Completed)
            | (InProgress | Paused, Failed)
            | (InProgress | Paused, RolledBack)
    )
}

/// Move `rollout` to `to`, or return a conflict naming `action`.
pub fn transition(
    rollout: &mut Rollout,
    to: RolloutStatus,
    action: &str,
    now: u64,
) -> RolloutResult<()> {
    let from = rollout.status;
    if !can_transition(from, to) {
        return Err(RolloutError::conflict(
            &rollout.id,
            format!("cannot {action} while {from}"),
        ));
    }
    rollout.status = to;
    rollout.updated_at = now;
    if to.is_terminal() {
        rollout.finished_at = Some(now);
    }
    info!(rollout = %rollout.id, %from, %to, action, "rollout status changed");
    Ok(())
}
