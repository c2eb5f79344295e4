//! StateStore: redb-backed persistence for rollouts.
//!
//! Provides typed operations over rollouts and their agent update rows.
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.open_table(AGENT_UPDATES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Persist a new rollout together with its planned agent rows.
    ///
    /// Fails with `AlreadyExists` if a rollout with the same ID is stored.
    pub fn insert_rollout(
        &self,
        rollout: &Rollout,
        agents: &[AgentUpdateState],
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            if table.get(rollout.table_key()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(rollout.id.clone()));
            }
        }
        write_rollout(&txn, rollout, agents)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(rollout = %rollout.id, agents = agents.len(), "rollout inserted");
        Ok(())
    }

    /// Atomically write a rollout and the agent rows that changed with it.
    ///
    /// Rows not passed in are left untouched.
    pub fn commit_rollout(
        &self,
        rollout: &Rollout,
        changed: &[AgentUpdateState],
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        write_rollout(&txn, rollout, changed)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            rollout = %rollout.id,
            status = %rollout.status,
            changed = changed.len(),
            "rollout committed"
        );
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Get a rollout by ID.
    pub fn get_rollout(&self, rollout_id: &str) -> StateResult<Option<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        match table.get(rollout_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let rollout: Rollout =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(rollout))
            }
            None => Ok(None),
        }
    }

    /// Read a rollout and all of its agent rows from one snapshot.
    pub fn load_rollout(
        &self,
        rollout_id: &str,
    ) -> StateResult<Option<(Rollout, Vec<AgentUpdateState>)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let rollouts = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let rollout: Rollout = match rollouts.get(rollout_id).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            None => return Ok(None),
        };
        let updates = txn.open_table(AGENT_UPDATES).map_err(map_err!(Table))?;
        let agents = scan_agent_rows(&updates, rollout_id)?;
        Ok(Some((rollout, agents)))
    }

    /// List all rollouts, in ID order.
    pub fn list_rollouts(&self) -> StateResult<Vec<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let rollout: Rollout =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(rollout);
        }
        Ok(results)
    }

    /// List the IDs of rollouts the scheduler still has to drive.
    pub fn list_active_rollout_ids(&self) -> StateResult<Vec<RolloutId>> {
        Ok(self
            .list_rollouts()?
            .into_iter()
            .filter(Rollout::needs_tick)
            .map(|r| r.id)
            .collect())
    }

    /// List all agent rows for a rollout, ordered by agent ID.
    pub fn list_agent_updates(&self, rollout_id: &str) -> StateResult<Vec<AgentUpdateState>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(AGENT_UPDATES).map_err(map_err!(Table))?;
        scan_agent_rows(&table, rollout_id)
    }

    /// Get one agent row by rollout and agent ID.
    pub fn get_agent_update(
        &self,
        rollout_id: &str,
        agent_id: &str,
    ) -> StateResult<Option<AgentUpdateState>> {
        let key = format!("{rollout_id}:{agent_id}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(AGENT_UPDATES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let row: AgentUpdateState =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }
}

/// Write a rollout and some of its rows inside an open write transaction.
fn write_rollout(
    txn: &redb::WriteTransaction,
    rollout: &Rollout,
    agents: &[AgentUpdateState],
) -> StateResult<()> {
    let value = serde_json::to_vec(rollout).map_err(map_err!(Serialize))?;
    {
        let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        table
            .insert(rollout.table_key(), value.as_slice())
            .map_err(map_err!(Write))?;
    }
    let mut table = txn.open_table(AGENT_UPDATES).map_err(map_err!(Table))?;
    for row in agents {
        if row.rollout_id != rollout.id {
            return Err(StateError::ForeignRow {
                rollout_id: rollout.id.clone(),
                agent_id: row.agent_id.clone(),
            });
        }
        let key = row.table_key();
        let value = serde_json::to_vec(row).map_err(map_err!(Serialize))?;
        table
            .insert(key.as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
    }
    Ok(())
}

/// Collect the rows keyed under `{rollout_id}:` with a range scan.
fn scan_agent_rows(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    rollout_id: &str,
) -> StateResult<Vec<AgentUpdateState>> {
    let prefix = format!("{rollout_id}:");
    let mut results = Vec::new();
    for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if !key.value().starts_with(&prefix) {
            break;
        }
        let row: AgentUpdateState =
            serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        results.push(row);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_rollout(id: &str) -> Rollout {
        Rollout {
            id: id.to_string(),
            release_id: "rel-2".to_string(),
            version: "2.0.0".to_string(),
            strategy: Strategy::Staged,
            selector: AgentSelector::default(),
            status: RolloutStatus::Pending,
            current_wave: 0,
            total_waves: 2,
            agents_total: 0,
            agents_updated: 0,
            agents_updating: 0,
            agents_pending: 0,
            agents_failed: 0,
            approved_wave: 0,
            catch_up_done: false,
            created_at: 1000,
            started_at: None,
            updated_at: 1000,
            finished_at: None,
            last_error: None,
        }
    }

    fn test_row(rollout_id: &str, agent_id: &str, wave: u32) -> AgentUpdateState {
        let agent = AgentSnapshot {
            id: agent_id.to_string(),
            name: format!("{agent_id}.fleet"),
            current_version: "1.0.0".to_string(),
            region: "eu-west".to_string(),
            tags: Vec::new(),
        };
        AgentUpdateState::planned(rollout_id, &agent, "2.0.0", wave)
    }

    fn planned(id: &str, agent_ids: &[&str]) -> (Rollout, Vec<AgentUpdateState>) {
        let rows: Vec<_> = agent_ids
            .iter()
            .enumerate()
            .map(|(i, a)| test_row(id, a, i as u32 + 1))
            .collect();
        let mut rollout = test_rollout(id);
        rollout.recount(&rows);
        (rollout, rows)
    }

    // ── Rollout records ────────────────────────────────────────────

    #[test]
    fn insert_and_load_rollout() {
        let store = StateStore::open_in_memory().unwrap();
        let (rollout, rows) = planned("ro-1", &["agent-b", "agent-a"]);

        store.insert_rollout(&rollout, &rows).unwrap();
        let (loaded, agents) = store.load_rollout("ro-1").unwrap().unwrap();

        assert_eq!(loaded, rollout);
        assert_eq!(loaded.agents_pending, 2);
        let ids: Vec<_> = agents.iter().map(|a| a.agent_id.as_str()).collect();
        assert_eq!(ids, vec!["agent-a", "agent-b"]);
    }

    #[test]
    fn insert_duplicate_rollout_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let (rollout, rows) = planned("ro-1", &["a"]);
        store.insert_rollout(&rollout, &rows).unwrap();

        let err = store.insert_rollout(&rollout, &rows).unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(id) if id == "ro-1"));
    }

    #[test]
    fn get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_rollout("nope").unwrap().is_none());
        assert!(store.load_rollout("nope").unwrap().is_none());
        assert!(store.get_agent_update("nope", "a").unwrap().is_none());
    }

    #[test]
    fn commit_updates_only_changed_rows() {
        let store = StateStore::open_in_memory().unwrap();
        let (mut rollout, mut rows) = planned("ro-1", &["a", "b"]);
        store.insert_rollout(&rollout, &rows).unwrap();

        rows[0].status = AgentUpdateStatus::Updating;
        rows[0].attempts = 1;
        rollout.status = RolloutStatus::InProgress;
        rollout.current_wave = 1;
        rollout.recount(&rows);
        store.commit_rollout(&rollout, &rows[..1]).unwrap();

        let (loaded, agents) = store.load_rollout("ro-1").unwrap().unwrap();
        assert_eq!(loaded.status, RolloutStatus::InProgress);
        assert_eq!(loaded.agents_updating, 1);
        assert_eq!(agents[0].status, AgentUpdateStatus::Updating);
        assert_eq!(agents[1].status, AgentUpdateStatus::Pending);
        assert!(loaded.counters_consistent());
    }

    #[test]
    fn commit_rejects_rows_of_other_rollouts() {
        let store = StateStore::open_in_memory().unwrap();
        let (rollout, rows) = planned("ro-1", &["a"]);
        store.insert_rollout(&rollout, &rows).unwrap();

        let stray = test_row("ro-2", "x", 1);
        let err = store.commit_rollout(&rollout, &[stray]).unwrap_err();
        assert!(matches!(err, StateError::ForeignRow { .. }));
        // Nothing from the failed transaction is visible.
        assert!(store.get_agent_update("ro-2", "x").unwrap().is_none());
    }

    #[test]
    fn agent_rows_are_scoped_by_rollout() {
        let store = StateStore::open_in_memory().unwrap();
        let (r1, rows1) = planned("ro-1", &["a", "b"]);
        let (r10, rows10) = planned("ro-10", &["c"]);
        store.insert_rollout(&r1, &rows1).unwrap();
        store.insert_rollout(&r10, &rows10).unwrap();

        assert_eq!(store.list_agent_updates("ro-1").unwrap().len(), 2);
        assert_eq!(store.list_agent_updates("ro-10").unwrap().len(), 1);
        assert_eq!(store.get_agent_update("ro-10", "c").unwrap().unwrap().wave, 1);
    }

    #[test]
    fn active_ids_skip_finished_rollouts() {
        let store = StateStore::open_in_memory().unwrap();
        let (live, rows) = planned("ro-live", &["a"]);
        store.insert_rollout(&live, &rows).unwrap();

        let (mut done, rows) = planned("ro-done", &["b"]);
        done.status = RolloutStatus::Completed;
        store.insert_rollout(&done, &rows).unwrap();

        let (mut rolled, mut rows) = planned("ro-rb", &["c"]);
        rolled.status = RolloutStatus::RolledBack;
        rows[0].status = AgentUpdateStatus::Updating;
        rolled.recount(&rows);
        store.insert_rollout(&rolled, &rows).unwrap();

        let active = store.list_active_rollout_ids().unwrap();
        assert_eq!(active, vec!["ro-live".to_string(), "ro-rb".to_string()]);
        assert_eq!(store.list_rollouts().unwrap().len(), 3);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            let (mut rollout, mut rows) = planned("ro-1", &["a", "b"]);
            rows[1].status = AgentUpdateStatus::Updated;
            rollout.current_wave = 2;
            rollout.status = RolloutStatus::InProgress;
            rollout.recount(&rows);
            store.insert_rollout(&rollout, &rows).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let (rollout, agents) = store.load_rollout("ro-1").unwrap().unwrap();
        assert_eq!(rollout.current_wave, 2);
        assert_eq!(rollout.agents_updated, 1);
        assert_eq!(agents[1].status, AgentUpdateStatus::Updated);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_rollouts().unwrap().is_empty());
        assert!(store.list_active_rollout_ids().unwrap().is_empty());
        assert!(store.list_agent_updates("any").unwrap().is_empty());
    }
}
