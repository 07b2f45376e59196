//! Catalog registry: schema-on-read pointers from table names to Parquet
//! locations.

use crate::fsutil::LockFile;
use crate::schema::ColumnDef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageFormat {
    Parquet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogTable {
    pub database: String,
    pub name: String,
    pub location: PathBuf,
    pub format: StorageFormat,
    pub columns: Vec<ColumnDef>,
    pub created_at: DateTime<Utc>,
}

impl CatalogTable {
    pub fn key(&self) -> String {
        table_key(&self.database, &self.name)
    }
}

fn table_key(database: &str, name: &str) -> String {
    format!("{database}.{name}")
}

#[derive(Debug, Error)]
pub enum CatalogStoreError {
    #[error("catalog I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt catalog file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("catalog is locked by another writer ({holder}); remove {path} if that process is gone")]
    Locked { path: PathBuf, holder: String },

    #[error("failed to serialize catalog: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Table registry consulted by the engine and mutated by DDL and transform
/// commits.
pub trait Catalog: Send + Sync {
    /// Insert or replace a table entry.
    fn register(&self, table: CatalogTable) -> Result<(), CatalogStoreError>;

    fn lookup(&self, database: &str, name: &str) -> Result<Option<CatalogTable>, CatalogStoreError>;

    /// Remove an entry. Returns the removed entry, if any.
    fn remove(&self, database: &str, name: &str)
        -> Result<Option<CatalogTable>, CatalogStoreError>;

    /// Every table registered under `database`.
    fn tables(&self, database: &str) -> Result<Vec<CatalogTable>, CatalogStoreError>;
}

/// Catalog persisted as a single JSON document.
///
/// Every call reads the file afresh, so several processes sharing one
/// catalog see each other's changes. Mutations take `{path}.lock`, re-read,
/// and rewrite the whole file via `.tmp` + rename; a crash leaves either the
/// old or the new catalog on disk.
pub struct JsonCatalog {
    path: PathBuf,
    lock_wait: Duration,
    writer: Mutex<()>,
}

impl JsonCatalog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CatalogStoreError> {
        let catalog = Self {
            path: path.into(),
            lock_wait: DEFAULT_LOCK_WAIT,
            writer: Mutex::new(()),
        };
        catalog.load()?;
        Ok(catalog)
    }

    /// How long a mutation waits for another process's catalog lock.
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("json.lock")
    }

    fn io_err(&self) -> impl Fn(std::io::Error) -> CatalogStoreError + '_ {
        move |source| CatalogStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn load(&self) -> Result<BTreeMap<String, CatalogTable>, CatalogStoreError> {
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => {
                serde_json::from_str(&content).map_err(|source| CatalogStoreError::Corrupt {
                    path: self.path.clone(),
                    source,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(source) => Err(self.io_err()(source)),
        }
    }

    fn persist(&self, tables: &BTreeMap<String, CatalogTable>) -> Result<(), CatalogStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(self.io_err())?;
        }
        let json = serde_json::to_string_pretty(tables)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(self.io_err())?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            self.io_err()(e)
        })
    }

    /// Read-modify-write under both the in-process and the file lock.
    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut BTreeMap<String, CatalogTable>) -> (bool, T),
    ) -> Result<T, CatalogStoreError> {
        let _writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        let lock_path = self.lock_path();
        let _file_lock = LockFile::acquire(&lock_path, self.lock_wait)
            .map_err(self.io_err())?
            .ok_or_else(|| CatalogStoreError::Locked {
                holder: LockFile::holder(&lock_path).unwrap_or_default(),
                path: lock_path.clone(),
            })?;

        let mut tables = self.load()?;
        let (changed, out) = change(&mut tables);
        if changed {
            self.persist(&tables)?;
        }
        Ok(out)
    }
}

impl Catalog for JsonCatalog {
    fn register(&self, table: CatalogTable) -> Result<(), CatalogStoreError> {
        self.mutate(|tables| {
            tables.insert(table.key(), table);
            (true, ())
        })
    }

    fn lookup(&self, database: &str, name: &str) -> Result<Option<CatalogTable>, CatalogStoreError> {
        Ok(self.load()?.remove(&table_key(database, name)))
    }

    fn remove(
        &self,
        database: &str,
        name: &str,
    ) -> Result<Option<CatalogTable>, CatalogStoreError> {
        let key = table_key(database, name);
        self.mutate(|tables| {
            let removed = tables.remove(&key);
            (removed.is_some(), removed)
        })
    }

    fn tables(&self, database: &str) -> Result<Vec<CatalogTable>, CatalogStoreError> {
        Ok(self
            .load()?
            .into_values()
            .filter(|t| t.database == database)
            .collect())
    }
}
