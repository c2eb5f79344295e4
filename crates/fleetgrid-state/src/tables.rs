//! redb table definitions for the FleetGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Rollout aggregates keyed by `{rollout_id}`.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");

/// Per-agent update rows keyed by `{rollout_id}:{agent_id}`.
pub const AGENT_UPDATES: TableDefinition<&str, &[u8]> = TableDefinition::new("agent_updates");
