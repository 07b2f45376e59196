//! Parquet dataset I/O with Hive-style partitioning.
//!
//! Layout:
//!
//! ```text
//! {location}/_manifest.json
//! {location}/gen-{id}/symbol={SYMBOL}/{year}.parquet
//! ```
//!
//! A rebuild writes a fresh generation directory, each file via `.tmp` +
//! rename, then replaces `_manifest.json` with a single rename. The manifest
//! names the live generation, so readers resolve either the previous
//! generation or the new one and never a partial one. Superseded generations
//! are removed after the flip.

use crate::domain::FlattenedRow;
use crate::fsutil::escape_component;
use crate::schema::{RowSchema, SchemaError};
use chrono::{DateTime, Datelike, NaiveDate};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

static GENERATION_SEQ: AtomicU64 = AtomicU64::new(0);

pub const MANIFEST_FILE: &str = "_manifest.json";
const GENERATION_PREFIX: &str = "gen-";

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no dataset at {0}")]
    Missing(PathBuf),

    #[error("dataset at {path} has {actual} rows, manifest says {expected}")]
    RowCount {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    #[error("parquet: {0}")]
    Parquet(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

fn io_at(path: &Path) -> impl Fn(std::io::Error) -> DatasetError + '_ {
    move |source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Sidecar naming the live generation of a materialized dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub generation: String,
    pub row_count: usize,
    /// Partition files relative to the generation directory.
    pub partitions: Vec<String>,
    pub data_hash: String,
    pub written_at: DateTime<chrono::Utc>,
}

/// What a rebuild produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSummary {
    pub rows: usize,
    pub partitions: usize,
    pub manifest: DatasetManifest,
}

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

/// Partition directory name for a symbol. Path separators and other
/// unsafe bytes are escaped, so distinct symbols never share a directory.
pub fn partition_dir(symbol: &str) -> String {
    format!("symbol={}", escape_component(symbol))
}

/// Convert rows to a DataFrame matching [`RowSchema`].
pub fn rows_to_dataframe(rows: &[&FlattenedRow]) -> Result<DataFrame, DatasetError> {
    let perr = |what: &str, e: PolarsError| DatasetError::Parquet(format!("{what}: {e}"));

    let symbols: Vec<&str> = rows.iter().map(|r| r.symbol.as_str()).collect();
    let row_ts: Vec<i64> = rows.iter().map(|r| r.row_ts.timestamp_micros()).collect();
    let dates: Vec<i32> = rows
        .iter()
        .map(|r| (r.trade_date - epoch()).num_days() as i32)
        .collect();
    let opens: Vec<f64> = rows.iter().map(|r| r.open).collect();
    let highs: Vec<f64> = rows.iter().map(|r| r.high).collect();
    let lows: Vec<f64> = rows.iter().map(|r| r.low).collect();
    let closes: Vec<f64> = rows.iter().map(|r| r.close).collect();
    let adjusted: Vec<Option<f64>> = rows.iter().map(|r| r.adjusted_close).collect();
    let volumes: Vec<Option<f64>> = rows.iter().map(|r| r.volume).collect();

    let df = DataFrame::new(vec![
        Column::new("symbol".into(), symbols),
        Column::new("row_ts".into(), row_ts)
            .cast(&DataType::Datetime(TimeUnit::Microseconds, None))
            .map_err(|e| perr("row_ts cast", e))?,
        Column::new("trade_date".into(), dates)
            .cast(&DataType::Date)
            .map_err(|e| perr("trade_date cast", e))?,
        Column::new("open".into(), opens),
        Column::new("high".into(), highs),
        Column::new("low".into(), lows),
        Column::new("close".into(), closes),
        Column::new("adjusted_close".into(), adjusted),
        Column::new("volume".into(), volumes),
    ])
    .map_err(|e| perr("dataframe creation", e))?;

    RowSchema::validate(&df)?;
    Ok(df)
}

fn write_parquet(df: &mut DataFrame, path: &Path) -> Result<(), DatasetError> {
    let tmp = path.with_extension("parquet.tmp");
    let file = fs::File::create(&tmp).map_err(io_at(&tmp))?;
    ParquetWriter::new(file)
        .finish(df)
        .map_err(|e| DatasetError::Parquet(format!("write {}: {e}", path.display())))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        io_at(path)(e)
    })
}

/// Replace the dataset at `location` with `rows`.
pub fn write_dataset(location: &Path, rows: &[FlattenedRow]) -> Result<WriteSummary, DatasetError> {
    fs::create_dir_all(location).map_err(io_at(location))?;

    let generation = format!(
        "{GENERATION_PREFIX}{}-{}-{}",
        chrono::Utc::now().timestamp_micros(),
        std::process::id(),
        GENERATION_SEQ.fetch_add(1, Ordering::Relaxed)
    );
    let gen_dir = location.join(&generation);

    let manifest = match write_generation(&gen_dir, &generation, rows) {
        Ok(m) => m,
        Err(e) => {
            let _ = fs::remove_dir_all(&gen_dir);
            return Err(e);
        }
    };

    if let Err(e) = publish_manifest(location, &manifest) {
        let _ = fs::remove_dir_all(&gen_dir);
        return Err(e);
    }
    remove_superseded(location, &generation);

    Ok(WriteSummary {
        rows: manifest.row_count,
        partitions: manifest.partitions.len(),
        manifest,
    })
}

fn write_generation(
    gen_dir: &Path,
    generation: &str,
    rows: &[FlattenedRow],
) -> Result<DatasetManifest, DatasetError> {
    fs::create_dir_all(gen_dir).map_err(io_at(gen_dir))?;

    let mut by_partition: BTreeMap<(String, i32), Vec<&FlattenedRow>> = BTreeMap::new();
    for row in rows {
        by_partition
            .entry((row.symbol.clone(), row.trade_date.year()))
            .or_default()
            .push(row);
    }

    let mut partitions = Vec::with_capacity(by_partition.len());
    for ((symbol, year), part_rows) in &by_partition {
        let dir = gen_dir.join(partition_dir(symbol));
        fs::create_dir_all(&dir).map_err(io_at(&dir))?;
        let mut df = rows_to_dataframe(part_rows)?;
        write_parquet(&mut df, &dir.join(format!("{year}.parquet")))?;
        partitions.push(format!("{}/{year}.parquet", partition_dir(symbol)));
    }

    Ok(DatasetManifest {
        generation: generation.to_string(),
        row_count: rows.len(),
        partitions,
        data_hash: blake3::hash(&serde_json::to_vec(rows)?).to_hex().to_string(),
        written_at: chrono::Utc::now(),
    })
}

/// Point the dataset at a new generation: write, sync, rename.
fn publish_manifest(location: &Path, manifest: &DatasetManifest) -> Result<(), DatasetError> {
    let path = location.join(MANIFEST_FILE);
    let tmp = location.join(format!("{MANIFEST_FILE}.tmp"));
    let json = serde_json::to_vec_pretty(manifest)?;

    let written = fs::File::create(&tmp)
        .and_then(|mut file| {
            file.write_all(&json)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&tmp, &path));
    written.map_err(|e| {
        let _ = fs::remove_file(&tmp);
        io_at(&path)(e)
    })
}

/// Remove every generation except `live`. Failures only leave garbage.
fn remove_superseded(location: &Path, live: &str) {
    let entries = match fs::read_dir(location) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(path = %location.display(), error = %e, "cannot list dataset generations");
            return;
        }
    };
    for entry in entries.filter_map(Result::ok) {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(GENERATION_PREFIX) || name == live {
            continue;
        }
        if let Err(e) = fs::remove_dir_all(entry.path()) {
            tracing::warn!(generation = %name, error = %e, "failed to remove superseded generation");
        }
    }
}

/// Manifest of the dataset at `location`, if one has been published.
pub fn read_manifest(location: &Path) -> Result<Option<DatasetManifest>, DatasetError> {
    let path = location.join(MANIFEST_FILE);
    match fs::read_to_string(&path) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_at(&path)(e)),
    }
}

/// Load the live generation as one DataFrame. A published dataset with no
/// partitions yields an empty frame with the table schema; a location with
/// no manifest is an error.
pub fn read_dataset(location: &Path, schema: &Schema) -> Result<DataFrame, DatasetError> {
    let manifest =
        read_manifest(location)?.ok_or_else(|| DatasetError::Missing(location.to_path_buf()))?;
    let base = location.join(&manifest.generation);

    let mut combined: Option<DataFrame> = None;
    for partition in &manifest.partitions {
        let path = base.join(partition);
        let file = fs::File::open(&path).map_err(io_at(&path))?;
        let df = ParquetReader::new(file)
            .finish()
            .map_err(|e| DatasetError::Parquet(format!("read {}: {e}", path.display())))?;
        match combined.as_mut() {
            None => combined = Some(df),
            Some(acc) => {
                acc.vstack_mut(&df)
                    .map_err(|e| DatasetError::Parquet(format!("stack {}: {e}", path.display())))?;
            }
        }
    }

    let df = combined.unwrap_or_else(|| DataFrame::empty_with_schema(schema));
    if df.height() != manifest.row_count {
        return Err(DatasetError::RowCount {
            path: location.to_path_buf(),
            expected: manifest.row_count,
            actual: df.height(),
        });
    }
    Ok(df)
}

/// Load the dataset back into rows, sorted by symbol then trade date.
pub fn read_rows(location: &Path) -> Result<Vec<FlattenedRow>, DatasetError> {
    let df = read_dataset(location, &RowSchema::schema())?;
    let mut rows = dataframe_to_rows(&df)?;
    rows.sort_by(|a, b| (&a.symbol, a.trade_date).cmp(&(&b.symbol, b.trade_date)));
    Ok(rows)
}

fn dataframe_to_rows(df: &DataFrame) -> Result<Vec<FlattenedRow>, DatasetError> {
    let perr = |what: &str, e: PolarsError| DatasetError::Parquet(format!("{what}: {e}"));
    let column = |name: &str, dtype: DataType| {
        df.column(name)
            .and_then(|c| c.cast(&dtype))
            .map_err(|e| perr(name, e))
    };

    let symbol = column("symbol", DataType::String)?;
    let row_ts = column("row_ts", DataType::Int64)?;
    let trade_date = column("trade_date", DataType::Int32)?;
    let open = column("open", DataType::Float64)?;
    let high = column("high", DataType::Float64)?;
    let low = column("low", DataType::Float64)?;
    let close = column("close", DataType::Float64)?;
    let adjusted = column("adjusted_close", DataType::Float64)?;
    let volume = column("volume", DataType::Float64)?;

    let symbol = symbol.str().map_err(|e| perr("symbol", e))?;
    let row_ts = row_ts.i64().map_err(|e| perr("row_ts", e))?;
    let trade_date = trade_date.i32().map_err(|e| perr("trade_date", e))?;
    let open = open.f64().map_err(|e| perr("open", e))?;
    let high = high.f64().map_err(|e| perr("high", e))?;
    let low = low.f64().map_err(|e| perr("low", e))?;
    let close = close.f64().map_err(|e| perr("close", e))?;
    let adjusted = adjusted.f64().map_err(|e| perr("adjusted_close", e))?;
    let volume = volume.f64().map_err(|e| perr("volume", e))?;

    let null_at = |what: &str, i: usize| DatasetError::Parquet(format!("null {what} at row {i}"));
    let mut rows = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let micros = row_ts.get(i).ok_or_else(|| null_at("row_ts", i))?;
        let days = trade_date.get(i).ok_or_else(|| null_at("trade_date", i))?;
        rows.push(FlattenedRow {
            symbol: symbol.get(i).ok_or_else(|| null_at("symbol", i))?.to_string(),
            row_ts: DateTime::from_timestamp_micros(micros)
                .ok_or_else(|| DatasetError::Parquet(format!("row_ts out of range at row {i}")))?,
            trade_date: epoch() + chrono::Duration::days(days as i64),
            open: open.get(i).unwrap_or(f64::NAN),
            high: high.get(i).unwrap_or(f64::NAN),
            low: low.get(i).unwrap_or(f64::NAN),
            close: close.get(i).unwrap_or(f64::NAN),
            adjusted_close: adjusted.get(i),
            volume: volume.get(i),
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::env;

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_dir() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = env::temp_dir().join(format!("quotelake_dataset_{}_{id}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn row(symbol: &str, y: i32, m: u32, d: u32, close: f64) -> FlattenedRow {
        FlattenedRow {
            symbol: symbol.into(),
            row_ts: Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap(),
            trade_date: NaiveDate::from_ymd_opt(y, m, d).unwrap(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            adjusted_close: Some(close),
            volume: None,
        }
    }

    fn generations(location: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(location)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(GENERATION_PREFIX))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn writes_hive_partitions_and_reads_back() {
        let dir = temp_dir();
        let location = dir.join("quotes");
        let rows = vec![
            row("AMZN", 2023, 12, 29, 150.0),
            row("AMZN", 2024, 1, 2, 151.0),
            row("TSLA", 2024, 1, 2, 240.0),
        ];

        let summary = write_dataset(&location, &rows).unwrap();

        assert_eq!(summary.rows, 3);
        assert_eq!(summary.partitions, 3);
        let live = location.join(&summary.manifest.generation);
        assert!(live.join("symbol=AMZN").join("2023.parquet").exists());
        assert!(live.join("symbol=TSLA").join("2024.parquet").exists());
        assert_eq!(read_manifest(&location).unwrap().unwrap(), summary.manifest);

        let back = read_rows(&location).unwrap();
        assert_eq!(back, rows);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rebuild_replaces_previous_dataset() {
        let dir = temp_dir();
        let location = dir.join("quotes");

        let first = write_dataset(&location, &[row("IBM", 2022, 3, 1, 120.0)]).unwrap();
        let second = write_dataset(&location, &[row("NVDA", 2024, 3, 1, 800.0)]).unwrap();

        assert_ne!(first.manifest.generation, second.manifest.generation);
        assert_eq!(generations(&location), vec![second.manifest.generation.clone()]);
        assert!(!location.join(format!("{MANIFEST_FILE}.tmp")).exists());

        let back = read_rows(&location).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].symbol, "NVDA");

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn location_is_never_absent_across_a_rebuild() {
        let dir = temp_dir();
        let location = dir.join("quotes");
        write_dataset(&location, &[row("IBM", 2022, 3, 1, 120.0)]).unwrap();

        let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reader = {
            let location = location.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut reads = 0;
                while !stop.load(Ordering::Relaxed) {
                    let manifest = read_manifest(&location).unwrap();
                    assert!(manifest.is_some(), "manifest vanished mid-rebuild");
                    reads += 1;
                }
                reads
            })
        };

        for i in 0..10 {
            write_dataset(&location, &[row("IBM", 2022, 3, 1, 120.0 + i as f64)]).unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        assert!(reader.join().unwrap() > 0);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_location_is_an_error() {
        let dir = temp_dir();
        assert!(matches!(
            read_dataset(&dir.join("nothing"), &RowSchema::schema()),
            Err(DatasetError::Missing(_))
        ));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn deleted_generation_is_an_error_not_an_empty_table() {
        let dir = temp_dir();
        let location = dir.join("quotes");
        let summary = write_dataset(&location, &[row("IBM", 2022, 3, 1, 120.0)]).unwrap();

        fs::remove_dir_all(location.join(&summary.manifest.generation)).unwrap();

        assert!(matches!(
            read_dataset(&location, &RowSchema::schema()),
            Err(DatasetError::Io { .. })
        ));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn empty_rebuild_leaves_manifest_only() {
        let dir = temp_dir();
        let location = dir.join("quotes");

        let summary = write_dataset(&location, &[]).unwrap();

        assert_eq!(summary.rows, 0);
        assert!(location.join(MANIFEST_FILE).exists());
        let df = read_dataset(&location, &RowSchema::schema()).unwrap();
        assert_eq!((df.height(), df.width()), (0, 9));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn partition_names_do_not_collide() {
        assert_eq!(partition_dir("GS-PI"), "symbol=GS-PI");
        assert_eq!(partition_dir("BRK.B"), "symbol=BRK.B");
        assert_eq!(partition_dir("A/B"), "symbol=A%2FB");
        assert_ne!(partition_dir("A/B"), partition_dir("A_B"));
        assert_ne!(partition_dir("A%2FB"), partition_dir("A/B"));
    }

    #[test]
    fn symbols_with_separators_keep_their_own_partition() {
        let dir = temp_dir();
        let location = dir.join("quotes");
        let rows = vec![row("A/B", 2024, 1, 2, 10.0), row("A_B", 2024, 1, 2, 20.0)];

        let summary = write_dataset(&location, &rows).unwrap();

        assert_eq!(summary.partitions, 2);
        let back = read_rows(&location).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.iter().find(|r| r.symbol == "A/B").unwrap().close, 10.0);
        assert_eq!(back.iter().find(|r| r.symbol == "A_B").unwrap().close, 20.0);

        fs::remove_dir_all(&dir).ok();
    }
}
