//! RegistrySnapshot — redb-backed persistence for the machine table.
//!
//! The broker rewrites the snapshot after every cycle and the daemon
//! loads it before the first one, so a restart resumes from the last
//! committed world view instead of re-provisioning from scratch. The
//! in-memory backend exists for tests.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{SnapshotError, SnapshotResult};
use crate::machine::Machine;
use crate::tables::MACHINES;

/// Convert any `Display` error into a `SnapshotError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| SnapshotError::$variant(e.to_string())
    };
}

/// Thread-safe snapshot store backed by redb.
#[derive(Clone)]
pub struct RegistrySnapshot {
    db: Arc<Database>,
}

impl RegistrySnapshot {
    /// Open (or create) a persistent snapshot at the given path.
    pub fn open(path: &Path) -> SnapshotResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "registry snapshot opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory snapshot (for testing).
    pub fn open_in_memory() -> SnapshotResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory registry snapshot opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> SnapshotResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(MACHINES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Replace the stored table with the given machines, atomically.
    pub fn save<'a>(&self, machines: impl Iterator<Item = &'a Machine>) -> SnapshotResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Full rewrite: drop rows for machines removed since last save.
        txn.delete_table(MACHINES).map_err(map_err!(Table))?;
        {
            let mut table = txn.open_table(MACHINES).map_err(map_err!(Table))?;
            for machine in machines {
                let value = serde_json::to_vec(machine).map_err(map_err!(Serialize))?;
                table
                    .insert(machine.id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Load all stored machines.
    pub fn load(&self) -> SnapshotResult<Vec<Machine>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MACHINES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let machine: Machine =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(machine);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineState;
    use std::collections::HashMap;

    fn test_machine(n: u64, state: MachineState) -> Machine {
        Machine {
            id: format!("m-{n}"),
            machine_type: "cloud-small".to_string(),
            state,
            site_id: Some(format!("vm-{n}")),
            site: "site-a".to_string(),
            integration: "condor".to_string(),
            backend_attributes: HashMap::from([(
                "node_name".to_string(),
                format!("worker{n}.example.org"),
            )]),
            state_changed_at: 1000 + n,
        }
    }

    #[test]
    fn save_and_load_round_trips() {
        let snapshot = RegistrySnapshot::open_in_memory().unwrap();
        let machines = vec![
            test_machine(1, MachineState::Working),
            test_machine(2, MachineState::Booting),
        ];

        snapshot.save(machines.iter()).unwrap();
        let mut loaded = snapshot.load().unwrap();
        loaded.sort_by(|a, b| a.id.cmp(&b.id));

        assert_eq!(loaded, machines);
    }

    #[test]
    fn save_drops_removed_machines() {
        let snapshot = RegistrySnapshot::open_in_memory().unwrap();
        let first = vec![
            test_machine(1, MachineState::Working),
            test_machine(2, MachineState::Failed),
        ];
        snapshot.save(first.iter()).unwrap();

        // Machine 2 was removed from the registry; the next save must
        // not resurrect it.
        let second = vec![test_machine(1, MachineState::Working)];
        snapshot.save(second.iter()).unwrap();

        let loaded = snapshot.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "m-1");
    }

    #[test]
    fn empty_snapshot_loads_empty() {
        let snapshot = RegistrySnapshot::open_in_memory().unwrap();
        assert!(snapshot.load().unwrap().is_empty());
    }

    #[test]
    fn on_disk_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.redb");

        {
            let snapshot = RegistrySnapshot::open(&path).unwrap();
            snapshot
                .save([test_machine(3, MachineState::Up)].iter())
                .unwrap();
        }

        let reopened = RegistrySnapshot::open(&path).unwrap();
        let loaded = reopened.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].state, MachineState::Up);
    }
}
