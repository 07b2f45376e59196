//! In-process query engine over the JSON catalog and Parquet datasets.
//!
//! Each submitted statement runs on its own worker thread and moves through
//! `QUEUED -> RUNNING -> SUCCEEDED | FAILED`. `DROP TABLE` edits the catalog
//! only; the dataset files are left untouched. `SELECT` registers the
//! catalog tables it references with Polars SQL and writes the result set to
//! `{output_location}/{execution_id}.csv`.
//!
//! Finished executions are retained for a bounded window, oldest evicted
//! first.

use super::sql::{self, Statement};
use super::{EngineError, ExecutionId, ExecutionState, ExecutionStatus, QueryEngine, QueryRequest};
use crate::catalog::Catalog;
use crate::schema::schema_for;
use crate::transform::parquet::read_dataset;
use polars::prelude::*;
use polars::sql::SQLContext;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Finished executions kept for status and result lookups.
pub const DEFAULT_RETAINED_EXECUTIONS: usize = 256;

struct Execution {
    status: ExecutionStatus,
    result: Option<DataFrame>,
    result_path: Option<PathBuf>,
}

struct Registry {
    executions: HashMap<ExecutionId, Execution>,
    finished: VecDeque<ExecutionId>,
    retain: usize,
}

impl Registry {
    fn finish(&mut self, id: &ExecutionId) {
        self.finished.push_back(id.clone());
        while self.finished.len() > self.retain {
            if let Some(old) = self.finished.pop_front() {
                self.executions.remove(&old);
            }
        }
    }
}

type Executions = Arc<Mutex<Registry>>;

pub struct LocalQueryEngine {
    catalog: Arc<dyn Catalog>,
    executions: Executions,
    counter: AtomicU64,
}

impl LocalQueryEngine {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self {
            catalog,
            executions: Arc::new(Mutex::new(Registry {
                executions: HashMap::new(),
                finished: VecDeque::new(),
                retain: DEFAULT_RETAINED_EXECUTIONS,
            })),
            counter: AtomicU64::new(0),
        }
    }

    /// Keep at most `retain` finished executions.
    pub fn with_retention(self, retain: usize) -> Self {
        lock(&self.executions).retain = retain.max(1);
        self
    }

    /// CSV file written for a succeeded `SELECT`.
    pub fn result_path(&self, id: &ExecutionId) -> Option<PathBuf> {
        lock(&self.executions)
            .executions
            .get(id)
            .and_then(|e| e.result_path.clone())
    }

    /// Executions currently tracked, running or finished.
    pub fn tracked(&self) -> usize {
        lock(&self.executions).executions.len()
    }

    fn next_id(&self, request: &QueryRequest) -> ExecutionId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let seed = format!(
            "{n}:{}:{}:{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            request.sql
        );
        let hash = blake3::hash(seed.as_bytes()).to_hex();
        ExecutionId(format!("{n:06}-{}", &hash.as_str()[..16]))
    }
}

fn lock(executions: &Executions) -> MutexGuard<'_, Registry> {
    executions.lock().unwrap_or_else(|p| p.into_inner())
}

fn set_state(executions: &Executions, id: &ExecutionId, status: ExecutionStatus) {
    if let Some(exec) = lock(executions).executions.get_mut(id) {
        exec.status = status;
    }
}

/// What a finished statement produced.
struct Produced {
    frame: Option<DataFrame>,
    csv: Option<PathBuf>,
}

fn execute(
    catalog: &dyn Catalog,
    request: &QueryRequest,
    id: &ExecutionId,
) -> Result<Produced, String> {
    match sql::parse(&request.sql).map_err(|e| format!("SYNTAX_ERROR: {e}"))? {
        Statement::DropTable {
            database,
            table,
            if_exists,
        } => {
            let database = database.unwrap_or_else(|| request.database.clone());
            let removed = catalog
                .remove(&database, &table)
                .map_err(|e| format!("catalog error: {e}"))?;
            if removed.is_none() && !if_exists {
                return Err(format!("Table not found: {database}.{table}"));
            }
            Ok(Produced {
                frame: None,
                csv: None,
            })
        }
        Statement::Select(query) => {
            let mut ctx = SQLContext::new();
            for name in sql::referenced_tables(&query) {
                let Some(table) = catalog
                    .lookup(&request.database, &name)
                    .map_err(|e| format!("catalog error: {e}"))?
                else {
                    continue;
                };
                let schema = schema_for(&table.columns);
                let df = read_dataset(&table.location, &schema)
                    .map_err(|e| format!("failed to read table {}: {e}", table.name))?;
                ctx.register(&table.name, df.lazy());
            }

            let mut df = ctx
                .execute(&query)
                .and_then(|lf| lf.collect())
                .map_err(|e| format!("query failed: {e}"))?;

            let csv = write_csv(&mut df, Path::new(&request.output_location), id)
                .map_err(|e| format!("failed to write results: {e}"))?;
            Ok(Produced {
                frame: Some(df),
                csv: Some(csv),
            })
        }
    }
}

fn write_csv(df: &mut DataFrame, dir: &Path, id: &ExecutionId) -> Result<PathBuf, String> {
    fs::create_dir_all(dir).map_err(|e| e.to_string())?;
    let path = dir.join(format!("{id}.csv"));
    let file = fs::File::create(&path).map_err(|e| e.to_string())?;
    CsvWriter::new(file)
        .include_header(true)
        .finish(df)
        .map_err(|e| e.to_string())?;
    Ok(path)
}

impl QueryEngine for LocalQueryEngine {
    fn start_query(&self, request: &QueryRequest) -> Result<ExecutionId, EngineError> {
        let id = self.next_id(request);
        lock(&self.executions).executions.insert(
            id.clone(),
            Execution {
                status: ExecutionStatus::new(ExecutionState::Queued),
                result: None,
                result_path: None,
            },
        );
        tracing::debug!(execution_id = %id, database = %request.database, "query submitted");

        let catalog = Arc::clone(&self.catalog);
        let executions = Arc::clone(&self.executions);
        let job = request.clone();
        let worker_id = id.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("query-{id}"))
            .spawn(move || {
                set_state(
                    &executions,
                    &worker_id,
                    ExecutionStatus::new(ExecutionState::Running),
                );

                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    execute(catalog.as_ref(), &job, &worker_id)
                }))
                .unwrap_or_else(|_| Err("internal error: query worker panicked".to_string()));

                let mut registry = lock(&executions);
                if let Some(exec) = registry.executions.get_mut(&worker_id) {
                    match outcome {
                        Ok(produced) => {
                            exec.result = produced.frame;
                            exec.result_path = produced.csv;
                            exec.status = ExecutionStatus::new(ExecutionState::Succeeded);
                        }
                        Err(reason) => {
                            tracing::debug!(execution_id = %worker_id, %reason, "query failed");
                            exec.status =
                                ExecutionStatus::with_reason(ExecutionState::Failed, reason);
                        }
                    }
                }
                registry.finish(&worker_id);
            });

        if let Err(e) = spawned {
            lock(&self.executions).executions.remove(&id);
            return Err(EngineError::Io(e));
        }
        Ok(id)
    }

    fn get_status(&self, id: &ExecutionId) -> Result<ExecutionStatus, EngineError> {
        lock(&self.executions)
            .executions
            .get(id)
            .map(|e| e.status.clone())
            .ok_or_else(|| EngineError::UnknownExecution(id.clone()))
    }

    fn get_results(&self, id: &ExecutionId) -> Result<DataFrame, EngineError> {
        let registry = lock(&self.executions);
        let exec = registry
            .executions
            .get(id)
            .ok_or_else(|| EngineError::UnknownExecution(id.clone()))?;
        match (&exec.status.state, &exec.result) {
            (ExecutionState::Succeeded, Some(df)) => Ok(df.clone()),
            (ExecutionState::Succeeded, None) => Ok(DataFrame::empty()),
            (state, _) => Err(EngineError::NoResults {
                id: id.clone(),
                state: *state,
            }),
        }
    }
}
