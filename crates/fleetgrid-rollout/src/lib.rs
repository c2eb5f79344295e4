//! FleetGrid rollouts: progressive agent upgrades across a fleet.
//!
//! This crate drives a new agent version through the fleet wave by wave.
//! A rollout is planned once against a fleet snapshot, then advanced by
//! repeated controller ticks that issue update commands, observe results,
//! retry failed attempts, and stop at a failure threshold. Operators can
//! pause, resume, approve manual waves, or roll back.
//!
//! # Components
//!
//! - **`planner`**: Pure wave planner (staged, canary, immediate, manual)
//! - **`controller`**: Rollout state machine and tick logic
//! - **`lifecycle`**: The allowed rollout status transitions
//! - **`locks`**: Per-rollout serialization of ticks and operator actions
//! - **`registry`**: Agent registry and release catalog seams
//! - **`memory`**: In-process registry/catalog for standalone mode and tests
//! - **`config`**: Thresholds, retry and timeout settings

pub mod config;
pub mod controller;
pub mod error;
mod fanout;
pub mod lifecycle;
pub mod locks;
pub mod memory;
pub mod planner;
pub mod registry;

pub use config::RolloutConfig;
pub use controller::{
    AgentReport, CreateRollout, RolloutController, RolloutDetail, TickOutcome, TickReport,
};
pub use error::{RolloutError, RolloutResult};
pub use memory::{AgentFault, FleetSeed, InMemoryFleet};
pub use planner::{Wave, plan_waves};
pub use registry::{AgentObservation, AgentRegistry, RegistryError, ReleaseCatalog};
