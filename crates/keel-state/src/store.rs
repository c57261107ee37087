//! StateStore — redb-backed state persistence for Keel.
//!
//! Provides a transactional `commit` over tasks, hosts, and cron jobs, and
//! typed reads used for recovery. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use tracing::debug;

use keel_core::{HostAttributes, JobKey, JobSpec, Task};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::{Mutation, job_table_key};

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
    #[cfg(feature = "testing")]
    faults: Arc<std::sync::atomic::AtomicUsize>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_db(db);
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
        let store = Self::from_db(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_db(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            #[cfg(feature = "testing")]
            faults: Arc::default(),
        }
    }

    /// Fail the next `count` commits with a transaction error.
    #[cfg(feature = "testing")]
    pub fn fail_next_commits(&self, count: usize) {
        self.faults.store(count, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(feature = "testing")]
    fn take_fault(&self) -> bool {
        use std::sync::atomic::Ordering;
        self.faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(TASKS).map_err(map_err!(Table))?;
        txn.open_table(HOSTS).map_err(map_err!(Table))?;
        txn.open_table(CRON_JOBS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Apply a single mutation.
    pub fn commit(&self, mutation: Mutation) -> StateResult<()> {
        self.commit_all(vec![mutation])
    }

    /// Apply mutations atomically: either all land or none do.
    pub fn commit_all(&self, mutations: Vec<Mutation>) -> StateResult<()> {
        #[cfg(feature = "testing")]
        if self.take_fault() {
            return Err(StateError::Transaction("injected commit failure".into()));
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for mutation in &mutations {
            // Returning early drops `txn`, which aborts it.
            apply(&txn, mutation)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = mutations.len(), "mutations committed");
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Get a task record by id.
    pub fn get_task(&self, id: &str) -> StateResult<Option<Task>> {
        self.get(TASKS, id)
    }

    /// Load every task record (used for recovery).
    pub fn load_tasks(&self) -> StateResult<Vec<Task>> {
        self.list(TASKS)
    }

    /// Get a host's attributes.
    pub fn get_host(&self, host: &str) -> StateResult<Option<HostAttributes>> {
        self.get(HOSTS, host)
    }

    /// List all known hosts.
    pub fn list_hosts(&self) -> StateResult<Vec<HostAttributes>> {
        self.list(HOSTS)
    }

    /// Get a cron job by key.
    pub fn get_cron_job(&self, key: &JobKey) -> StateResult<Option<JobSpec>> {
        self.get(CRON_JOBS, &job_table_key(key))
    }

    /// List all cron jobs.
    pub fn list_cron_jobs(&self) -> StateResult<Vec<JobSpec>> {
        self.list(CRON_JOBS)
    }

    fn get<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, table: TableDefinition<&str, &[u8]>) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let item: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(item);
        }
        Ok(results)
    }
}

fn apply(txn: &WriteTransaction, mutation: &Mutation) -> StateResult<()> {
    match mutation {
        Mutation::SaveTask {
            task,
            expected_version,
        } => {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let found = match table.get(task.id.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let stored: Task =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    Some(stored.version)
                }
                None => None,
            };
            if found != *expected_version {
                return Err(StateError::Conflict {
                    key: task.id.clone(),
                    expected: *expected_version,
                    found,
                });
            }
            let value = serde_json::to_vec(task).map_err(map_err!(Serialize))?;
            table
                .insert(task.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        Mutation::DeleteTasks { ids } => {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            for id in ids {
                table.remove(id.as_str()).map_err(map_err!(Write))?;
            }
        }
        Mutation::SaveHost(attributes) => {
            let value = serde_json::to_vec(attributes).map_err(map_err!(Serialize))?;
            let mut table = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            table
                .insert(attributes.host.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        Mutation::SaveCronJob(spec) => {
            let key = job_table_key(&spec.key);
            let value = serde_json::to_vec(spec).map_err(map_err!(Serialize))?;
            let mut table = txn.open_table(CRON_JOBS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        Mutation::DeleteCronJob(key) => {
            let mut table = txn.open_table(CRON_JOBS).map_err(map_err!(Table))?;
            table
                .remove(job_table_key(key).as_str())
                .map_err(map_err!(Write))?;
        }
    }
    Ok(())
}
