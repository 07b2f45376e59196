//! Catalog table manager.
//!
//! Tracks each table through `ABSENT -> CREATING -> READY -> DROPPING ->
//! ABSENT`. Drops go through the query engine and block until the execution
//! is terminal; creation is committed directly to the catalog by the
//! transformer. Drop and create against one table are serialized by a
//! per-table write lock.

pub mod store;

pub use store::{Catalog, CatalogStoreError, CatalogTable, JsonCatalog, StorageFormat};

use crate::engine::sql::backtick;
use crate::engine::{
    await_terminal, CancellationToken, EngineError, PollConfig, PollError, QueryEngine,
    QueryRequest,
};
use crate::fsutil::{escape_component, LockFile};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub database: String,
    pub name: String,
}

impl TableRef {
    pub fn new(database: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableState {
    Absent,
    Creating,
    Ready,
    Dropping,
}

impl TableState {
    /// Allowed lifecycle edges. `Dropping -> Dropping` retries a drop that
    /// timed out or was cancelled; `Ready -> Creating` is a full rebuild.
    pub fn can_transition_to(self, next: TableState) -> bool {
        use TableState::*;
        matches!(
            (self, next),
            (Absent, Creating)
                | (Absent, Dropping)
                | (Ready, Creating)
                | (Ready, Dropping)
                | (Creating, Ready)
                | (Creating, Absent)
                | (Dropping, Absent)
                | (Dropping, Ready)
                | (Dropping, Dropping)
        )
    }
}

impl fmt::Display for TableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TableState::Absent => "ABSENT",
            TableState::Creating => "CREATING",
            TableState::Ready => "READY",
            TableState::Dropping => "DROPPING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum DdlError {
    #[error("DDL on {table} failed: {reason}")]
    Execution { table: TableRef, reason: String },

    #[error("DDL on {table} not finished after {polls} poll(s)")]
    Timeout { table: TableRef, polls: u32 },

    #[error("DDL on {table} was cancelled")]
    Cancelled { table: TableRef },

    #[error("cannot move {table} from {from} to {to}")]
    InvalidTransition {
        table: TableRef,
        from: TableState,
        to: TableState,
    },

    #[error("{table} is locked by another writer ({holder})")]
    Locked { table: TableRef, holder: String },

    #[error("lock for {table}: {source}")]
    LockIo {
        table: TableRef,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Catalog(#[from] CatalogStoreError),
}

/// Per-table exclusive write locks.
///
/// Holders inside this process are tracked in a set. With a lock directory
/// each hold also creates `{dir}/{database}.{table}.lock`, which excludes
/// writers in other processes sharing that directory.
pub struct TableLocks {
    held: Mutex<HashSet<TableRef>>,
    released: Condvar,
    dir: Option<PathBuf>,
    wait: Duration,
}

impl Default for TableLocks {
    fn default() -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
            dir: None,
            wait: Duration::ZERO,
        }
    }
}

impl TableLocks {
    /// Locks that also exclude other processes. A competing holder is
    /// waited on for at most `wait`.
    pub fn with_dir(dir: impl Into<PathBuf>, wait: Duration) -> Self {
        Self {
            dir: Some(dir.into()),
            wait,
            ..Self::default()
        }
    }

    pub fn lock_path(&self, table: &TableRef) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| {
            dir.join(format!(
                "{}.{}.lock",
                escape_component(&table.database),
                escape_component(&table.name)
            ))
        })
    }

    /// Block until no one else in this process holds `table`, then take the
    /// cross-process lock if one is configured.
    pub fn acquire(&self, table: &TableRef) -> Result<TableWriteLock<'_>, DdlError> {
        {
            let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
            while held.contains(table) {
                held = self
                    .released
                    .wait(held)
                    .unwrap_or_else(|p| p.into_inner());
            }
            held.insert(table.clone());
        }
        let mut guard = TableWriteLock {
            locks: self,
            table: table.clone(),
            file: None,
        };

        if let Some(path) = self.lock_path(table) {
            match LockFile::acquire(&path, self.wait) {
                Ok(Some(file)) => guard.file = Some(file),
                Ok(None) => {
                    return Err(DdlError::Locked {
                        table: table.clone(),
                        holder: LockFile::holder(&path).unwrap_or_default(),
                    })
                }
                Err(source) => {
                    return Err(DdlError::LockIo {
                        table: table.clone(),
                        source,
                    })
                }
            }
        }
        Ok(guard)
    }

    pub fn is_held(&self, table: &TableRef) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(table)
    }
}

/// Proof that the holder is the single writer of a table.
pub struct TableWriteLock<'a> {
    locks: &'a TableLocks,
    table: TableRef,
    file: Option<LockFile>,
}

impl TableWriteLock<'_> {
    pub fn table(&self) -> &TableRef {
        &self.table
    }
}

impl Drop for TableWriteLock<'_> {
    fn drop(&mut self) {
        drop(self.file.take());
        let mut held = self.locks.held.lock().unwrap_or_else(|p| p.into_inner());
        held.remove(&self.table);
        self.locks.released.notify_all();
    }
}

/// Result of a completed drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropOutcome {
    pub table: TableRef,
    pub existed: bool,
    pub polls: u32,
}

pub struct CatalogTableManager {
    engine: Arc<dyn QueryEngine>,
    catalog: Arc<dyn Catalog>,
    output_location: String,
    poll: PollConfig,
    locks: TableLocks,
    transient: Mutex<HashMap<TableRef, TableState>>,
}

impl CatalogTableManager {
    pub fn new(
        engine: Arc<dyn QueryEngine>,
        catalog: Arc<dyn Catalog>,
        output_location: impl Into<String>,
        poll: PollConfig,
    ) -> Self {
        Self {
            engine,
            catalog,
            output_location: output_location.into(),
            poll,
            locks: TableLocks::default(),
            transient: Mutex::new(HashMap::new()),
        }
    }

    /// Exclude writers in other processes through lock files under `dir`.
    /// A competing holder is waited on for the full poll budget.
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let wait = self.poll.interval * self.poll.max_polls;
        self.locks = TableLocks::with_dir(dir, wait);
        self
    }

    pub fn poll_config(&self) -> PollConfig {
        self.poll
    }

    fn transient(&self) -> MutexGuard<'_, HashMap<TableRef, TableState>> {
        self.transient.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Take the single-writer lock for `table`.
    pub fn write_lock(&self, table: &TableRef) -> Result<TableWriteLock<'_>, DdlError> {
        self.locks.acquire(table)
    }

    /// Current lifecycle state. Resting states come from the catalog.
    pub fn state(&self, table: &TableRef) -> Result<TableState, DdlError> {
        if let Some(state) = self.transient().get(table) {
            return Ok(*state);
        }
        Ok(match self.catalog.lookup(&table.database, &table.name)? {
            Some(_) => TableState::Ready,
            None => TableState::Absent,
        })
    }

    pub fn describe(&self, table: &TableRef) -> Result<Option<CatalogTable>, DdlError> {
        Ok(self.catalog.lookup(&table.database, &table.name)?)
    }

    fn enter(&self, table: &TableRef, next: TableState) -> Result<TableState, DdlError> {
        let from = self.state(table)?;
        if !from.can_transition_to(next) {
            return Err(DdlError::InvalidTransition {
                table: table.clone(),
                from,
                to: next,
            });
        }
        self.transient().insert(table.clone(), next);
        tracing::debug!(table = %table, %from, to = %next, "table state");
        Ok(from)
    }

    /// Settle back to the resting state recorded in the catalog.
    fn settle(&self, table: &TableRef) {
        self.transient().remove(table);
    }

    /// Drop `table` if it exists and wait for the engine to finish.
    ///
    /// On engine failure the table returns to its prior state. On timeout
    /// or cancellation it stays `DROPPING` until a later drop settles it.
    pub fn drop_if_exists(
        &self,
        table: &TableRef,
        cancel: &CancellationToken,
    ) -> Result<DropOutcome, DdlError> {
        let _guard = self.write_lock(table)?;
        let existed = self.describe(table)?.is_some();
        self.enter(table, TableState::Dropping)?;

        let request = QueryRequest {
            sql: format!(
                "DROP TABLE IF EXISTS {}.{};",
                backtick(&table.database),
                backtick(&table.name)
            ),
            database: table.database.clone(),
            output_location: self.output_location.clone(),
        };

        let id = match self.engine.start_query(&request) {
            Ok(id) => id,
            Err(e) => {
                self.settle(table);
                return Err(e.into());
            }
        };
        tracing::info!(table = %table, execution_id = %id, "drop submitted");

        match await_terminal(self.engine.as_ref(), &id, self.poll, cancel) {
            Ok(outcome) => {
                self.settle(table);
                tracing::info!(table = %table, existed, polls = outcome.polls, "table dropped");
                Ok(DropOutcome {
                    table: table.clone(),
                    existed,
                    polls: outcome.polls,
                })
            }
            Err(PollError::Failed { reason, .. }) => {
                self.settle(table);
                Err(DdlError::Execution {
                    table: table.clone(),
                    reason,
                })
            }
            Err(PollError::EngineCancelled { .. }) => {
                self.settle(table);
                Err(DdlError::Execution {
                    table: table.clone(),
                    reason: "query was cancelled by the engine".to_string(),
                })
            }
            Err(PollError::Engine(e)) => {
                self.settle(table);
                Err(e.into())
            }
            Err(PollError::Timeout { polls, .. }) => Err(DdlError::Timeout {
                table: table.clone(),
                polls,
            }),
            Err(PollError::Cancelled { .. }) => Err(DdlError::Cancelled {
                table: table.clone(),
            }),
        }
    }

    /// Mark the locked table as being rebuilt.
    pub fn begin_create(&self, lock: &TableWriteLock<'_>) -> Result<TableState, DdlError> {
        self.enter(lock.table(), TableState::Creating)
    }

    /// Register the freshly written dataset; the table becomes `READY`.
    pub fn commit_create(
        &self,
        lock: &TableWriteLock<'_>,
        entry: CatalogTable,
    ) -> Result<(), DdlError> {
        let table = lock.table();
        let result = self.catalog.register(entry);
        self.settle(table);
        result?;
        tracing::info!(table = %table, "table registered");
        Ok(())
    }

    /// Abandon a rebuild; the table returns to its catalog state.
    pub fn abort_create(&self, lock: &TableWriteLock<'_>) {
        self.settle(lock.table());
        tracing::warn!(table = %lock.table(), "table rebuild aborted");
    }
}
