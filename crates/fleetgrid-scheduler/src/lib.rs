//! fleetgrid-scheduler: the background driver for rollouts.
//!
//! On a fixed cadence the scheduler lists every rollout that still needs
//! work and spawns one controller tick per rollout. Ticks for different
//! rollouts run concurrently; a rollout whose previous tick is still in
//! flight is skipped until that tick finishes.
//!
//! ```text
//! RolloutScheduler
//!   ├── RolloutController (tick, active_rollout_ids)
//!   └── JoinSet of in-flight ticks, one per rollout at most
//! ```

pub mod error;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{PassReport, RolloutScheduler};
