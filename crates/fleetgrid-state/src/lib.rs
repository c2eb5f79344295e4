//! fleetgrid-state: durable rollout state for FleetGrid.
//!
//! Backed by [redb](https://docs.rs/redb), persists the two record kinds the
//! orchestrator owns: `Rollout` aggregates and their `AgentUpdateState` rows.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Agent rows use the composite key `{rollout_id}:{agent_id}` so a rollout's
//! rows can be read with a prefix scan.
//!
//! A rollout and its changed rows are always written in a single write
//! transaction, so the counter invariant survives a crash.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
