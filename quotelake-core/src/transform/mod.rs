//! Batch transformer: buffered JSON records to partitioned Parquet.
//!
//! A run reads the entire buffer, flattens each record's `payload.data`
//! array into one row per trading day, de-duplicates on
//! `(symbol, trade_date)` and rebuilds the table's dataset from scratch.
//! Malformed records degrade to zero rows instead of failing the batch.

pub mod parquet;

use crate::buffer::{BufferError, BufferSource};
use crate::catalog::{CatalogTable, CatalogTableManager, DdlError, StorageFormat, TableRef};
use crate::domain::{FlattenedRow, RawObservation};
use crate::schema::RowSchema;
use chrono::NaiveDate;
use self::parquet::{write_dataset, DatasetError};
use rayon::prelude::*;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

const DATE_KEYS: [&str; 3] = ["date", "trade_date", "Date"];
const ADJUSTED_CLOSE_KEYS: [&str; 3] = ["adjusted_close", "adj_close", "adjClose"];

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("failed to read buffer: {0}")]
    Buffer(#[from] BufferError),

    #[error("failed to write dataset: {0}")]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Ddl(#[from] DdlError),
}

/// Counters for one transform run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransformSummary {
    pub records_read: usize,
    pub records_skipped: usize,
    pub rows_flattened: usize,
    pub duplicates_dropped: usize,
    pub rows_written: usize,
    pub partitions_written: usize,
    pub data_hash: String,
}

fn field<'a>(obj: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k)).filter(|v| !v.is_null())
}

fn number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    n.filter(|f| f.is_finite())
}

fn parse_trade_date(value: &Value) -> Option<NaiveDate> {
    let s = value.as_str()?.trim();
    let head = s.get(..10).unwrap_or(s);
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%B %d %Y"))
        .or_else(|_| NaiveDate::parse_from_str(s, "%b %d %Y"))
        .or_else(|_| NaiveDate::parse_from_str(s, "%m/%d/%Y"))
        .ok()
}

fn flatten_element(obs: &RawObservation, element: &Value) -> Option<FlattenedRow> {
    let obj = element.as_object()?;
    let trade_date = parse_trade_date(field(obj, &DATE_KEYS)?)?;
    let price = |key: &str| field(obj, &[key]).and_then(number);

    Some(FlattenedRow {
        symbol: obs.symbol.clone(),
        row_ts: obs.ingest_timestamp,
        trade_date,
        open: price("open")?,
        high: price("high")?,
        low: price("low")?,
        close: price("close")?,
        adjusted_close: field(obj, &ADJUSTED_CLOSE_KEYS).and_then(number),
        volume: price("volume"),
    })
}

/// One row per usable element of `payload.data`.
///
/// Yields nothing when `data` is missing, not an array, or empty. Elements
/// without a parseable date or any of open/high/low/close are skipped.
pub fn flatten(obs: &RawObservation) -> Vec<FlattenedRow> {
    let Some(data) = obs.payload.get("data").and_then(Value::as_array) else {
        return Vec::new();
    };
    data.iter()
        .filter_map(|element| flatten_element(obs, element))
        .collect()
}

/// Keep one row per `(symbol, trade_date)`: the greatest `row_ts` wins and
/// among equal timestamps the later row wins. Output is sorted by key.
pub fn dedupe_last_write_wins(rows: Vec<FlattenedRow>) -> (Vec<FlattenedRow>, usize) {
    let total = rows.len();
    let mut latest: BTreeMap<(String, NaiveDate), FlattenedRow> = BTreeMap::new();
    for row in rows {
        let key = (row.symbol.clone(), row.trade_date);
        match latest.get(&key) {
            Some(existing) if existing.row_ts > row.row_ts => {}
            _ => {
                latest.insert(key, row);
            }
        }
    }
    let kept: Vec<FlattenedRow> = latest.into_values().collect();
    let dropped = total - kept.len();
    (kept, dropped)
}

pub struct BatchTransformer {
    source: Arc<dyn BufferSource>,
    tables: Arc<CatalogTableManager>,
    table: TableRef,
    location: PathBuf,
}

impl BatchTransformer {
    pub fn new(
        source: Arc<dyn BufferSource>,
        tables: Arc<CatalogTableManager>,
        table: TableRef,
        location: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source,
            tables,
            table,
            location: location.into(),
        }
    }

    pub fn location(&self) -> &std::path::Path {
        &self.location
    }

    /// Rebuild the table from every buffered record.
    pub fn run(&self) -> Result<TransformSummary, TransformError> {
        let lines = self.source.read_lines()?;
        let parsed: Vec<Option<Vec<FlattenedRow>>> = lines
            .par_iter()
            .enumerate()
            .map(|(i, line)| match RawObservation::from_buffer_line(line) {
                Ok(obs) => Some(flatten(&obs)),
                Err(e) => {
                    tracing::warn!(record = i, error = %e, "skipping malformed buffer record");
                    None
                }
            })
            .collect();

        let mut summary = TransformSummary {
            records_read: lines.len(),
            ..TransformSummary::default()
        };
        let mut rows = Vec::new();
        for batch in parsed {
            match batch {
                Some(batch) => rows.extend(batch),
                None => summary.records_skipped += 1,
            }
        }
        summary.rows_flattened = rows.len();

        let (rows, dropped) = dedupe_last_write_wins(rows);
        summary.duplicates_dropped = dropped;

        let lock = self.tables.write_lock(&self.table)?;
        self.tables.begin_create(&lock)?;

        let written = match write_dataset(&self.location, &rows) {
            Ok(w) => w,
            Err(e) => {
                self.tables.abort_create(&lock);
                return Err(e.into());
            }
        };

        self.tables.commit_create(
            &lock,
            CatalogTable {
                database: self.table.database.clone(),
                name: self.table.name.clone(),
                location: self.location.clone(),
                format: StorageFormat::Parquet,
                columns: RowSchema::columns(),
                created_at: chrono::Utc::now(),
            },
        )?;

        summary.rows_written = written.rows;
        summary.partitions_written = written.partitions;
        summary.data_hash = written.manifest.data_hash;

        tracing::info!(
            table = %self.table,
            records = summary.records_read,
            skipped = summary.records_skipped,
            rows = summary.rows_written,
            duplicates = summary.duplicates_dropped,
            partitions = summary.partitions_written,
            "transform complete"
        );
        Ok(summary)
    }
}
