//! Pipeline configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) yields a
//! runnable local configuration.

use chrono::{NaiveDate, Utc};
use quotelake_core::buffer::RetryPolicy;
use quotelake_core::catalog::TableRef;
use quotelake_core::engine::PollConfig;
use quotelake_core::fetch::http::DEFAULT_BASE_URL;
use quotelake_core::validate::InvariantCheck;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SYMBOLS: [&str; 5] = ["AMZN", "TSLA", "NVDA", "GS-PI", "IBM"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub api: ApiConfig,
    pub buffer: BufferConfig,
    pub catalog: CatalogConfig,
    pub validation: ValidationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub symbols: Vec<String>,
    pub start_date: NaiveDate,
    /// Inclusive; today (UTC) when unset.
    pub end_date: Option<NaiveDate>,
    pub timeout_secs: u64,
    pub max_concurrency: usize,
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            symbols: DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect(),
            start_date: NaiveDate::from_ymd_opt(2020, 6, 1).unwrap_or_default(),
            end_date: None,
            timeout_secs: 30,
            max_concurrency: 4,
            user_agent: concat!("quotelake/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub dir: PathBuf,
    pub stream_name: String,
    pub shards: usize,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/buffer"),
            stream_name: "financial-data-stream".to_string(),
            shards: 4,
            max_attempts: 3,
            base_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub database: String,
    pub table: String,
    /// Where the transformer writes the Parquet dataset.
    pub location: PathBuf,
    /// Where query results land.
    pub output_location: PathBuf,
    pub catalog_path: PathBuf,
    pub poll_interval_ms: u64,
    pub max_polls: u32,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            database: "financial_data_db".to_string(),
            table: "structured_fd_transformed_f_data".to_string(),
            location: PathBuf::from("data/transformed"),
            output_location: PathBuf::from("data/query-results"),
            catalog_path: PathBuf::from("data/catalog.json"),
            poll_interval_ms: 5000,
            max_polls: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub fail_fast: bool,
    /// Extra checks run after the mandatory ones.
    pub checks: Vec<InvariantCheck>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            fail_fast: true,
            checks: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.api.symbols.is_empty() {
            return invalid("api.symbols must not be empty".into());
        }
        if let Some(sym) = self.api.symbols.iter().find(|s| s.trim().is_empty()) {
            return invalid(format!("api.symbols contains a blank entry: {sym:?}"));
        }
        if self.api.max_concurrency == 0 {
            return invalid("api.max_concurrency must be at least 1".into());
        }
        let end = self.end_date();
        if self.api.start_date > end {
            return invalid(format!(
                "api.start_date {} is after end date {end}",
                self.api.start_date
            ));
        }
        if self.buffer.shards == 0 {
            return invalid("buffer.shards must be at least 1".into());
        }
        if self.buffer.max_attempts == 0 {
            return invalid("buffer.max_attempts must be at least 1".into());
        }
        if self.catalog.max_polls == 0 {
            return invalid("catalog.max_polls must be at least 1".into());
        }
        if self.catalog.database.is_empty() || self.catalog.table.is_empty() {
            return invalid("catalog.database and catalog.table must be set".into());
        }

        let mut seen = HashSet::new();
        let names = InvariantCheck::mandatory()
            .into_iter()
            .chain(self.validation.checks.iter().cloned())
            .map(|c| c.name);
        for name in names {
            if !seen.insert(name.clone()) {
                return invalid(format!("duplicate validation check name: {name}"));
            }
        }

        Ok(())
    }

    /// Effective inclusive end of the fetch window.
    pub fn end_date(&self) -> NaiveDate {
        self.api.end_date.unwrap_or_else(|| Utc::now().date_naive())
    }

    pub fn table(&self) -> TableRef {
        TableRef::new(&self.catalog.database, &self.catalog.table)
    }

    /// Directory of per-table lock files, next to the catalog file.
    pub fn lock_dir(&self) -> PathBuf {
        self.catalog.catalog_path.with_extension("locks")
    }

    pub fn poll(&self) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(self.catalog.poll_interval_ms),
            max_polls: self.catalog.max_polls,
        }
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.buffer.max_attempts,
            base_delay: Duration::from_millis(self.buffer.base_delay_ms),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }
}
