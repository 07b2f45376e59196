//! End-to-end runs of the coordinator over the local stack with a scripted
//! quote source in place of the HTTP API.

use chrono::NaiveDate;
use quotelake_core::buffer::{BufferWriter, FileBuffer, RetryPolicy};
use quotelake_core::catalog::{CatalogTableManager, JsonCatalog, TableState};
use quotelake_core::engine::{LocalQueryEngine, PollConfig};
use quotelake_core::fetch::{FetchError, QuoteSource, RecordFetcher};
use quotelake_core::transform::parquet::read_rows;
use quotelake_core::transform::BatchTransformer;
use quotelake_core::validate::QualityValidator;
use quotelake_runner::{Pipeline, PipelineComponents, PipelineConfig, RunOutcome, Stage};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Serves canned `data` arrays; unknown symbols get HTTP 404.
#[derive(Default)]
struct ScriptedApi {
    data: Mutex<HashMap<String, Value>>,
}

impl ScriptedApi {
    fn set(&self, symbol: &str, rows: Vec<Value>) {
        self.data
            .lock()
            .unwrap()
            .insert(symbol.to_string(), json!({ "data": rows }));
    }
}

impl QuoteSource for ScriptedApi {
    fn name(&self) -> &str {
        "scripted"
    }

    fn fetch(
        &self,
        symbol: &str,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> Result<Value, FetchError> {
        self.data
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .ok_or_else(|| FetchError::Status {
                symbol: symbol.to_string(),
                status: 404,
            })
    }
}

fn bar(date: &str, open: f64, high: f64, low: f64, close: f64) -> Value {
    json!({
        "date": date, "open": open, "high": high, "low": low, "close": close,
        "adjusted_close": close, "volume": 5_000
    })
}

fn two_good_bars() -> Vec<Value> {
    vec![
        bar("2024-01-02", 10.0, 11.0, 9.0, 10.5),
        bar("2024-01-03", 10.5, 12.0, 10.0, 11.0),
    ]
}

fn config(dir: &Path, symbols: &[&str]) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.api.symbols = symbols.iter().map(|s| s.to_string()).collect();
    config.api.start_date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    config.api.end_date = NaiveDate::from_ymd_opt(2024, 1, 31);
    config.buffer.dir = dir.join("buffer");
    config.buffer.shards = 2;
    config.buffer.base_delay_ms = 1;
    config.catalog.location = dir.join("transformed");
    config.catalog.output_location = dir.join("results");
    config.catalog.catalog_path = dir.join("catalog.json");
    config.catalog.poll_interval_ms = 10;
    config.catalog.max_polls = 500;
    config
}

fn pipeline(dir: &Path, symbols: &[&str], api: Arc<ScriptedApi>) -> Pipeline {
    let config = config(dir, symbols);
    config.validate().unwrap();

    let poll = PollConfig {
        interval: Duration::from_millis(config.catalog.poll_interval_ms),
        max_polls: config.catalog.max_polls,
    };
    let buffer = Arc::new(
        FileBuffer::open(&config.buffer.dir, &config.buffer.stream_name, config.buffer.shards)
            .unwrap(),
    );
    let catalog = Arc::new(JsonCatalog::open(&config.catalog.catalog_path).unwrap());
    let engine = Arc::new(LocalQueryEngine::new(catalog.clone()));
    let output = config.catalog.output_location.to_string_lossy().into_owned();
    let tables = Arc::new(
        CatalogTableManager::new(engine.clone(), catalog, output.clone(), poll)
            .with_lock_dir(dir.join("locks")),
    );

    let components = PipelineComponents {
        fetcher: RecordFetcher::new(api),
        writer: BufferWriter::new(buffer.clone(), RetryPolicy::default()),
        transformer: BatchTransformer::new(
            buffer.clone(),
            tables.clone(),
            config.table(),
            config.catalog.location.clone(),
        ),
        validator: QualityValidator::new(engine, config.table(), output, poll),
        tables,
        file_buffer: Some(buffer),
    };
    Pipeline::new(config, components)
}

#[test]
fn clean_run_succeeds() {
    let dir = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::default());
    api.set("AMZN", two_good_bars());
    api.set("TSLA", two_good_bars());

    let outcome = pipeline(dir.path(), &["AMZN", "TSLA"], api).run();

    assert!(outcome.is_success(), "{outcome}");
    let report = outcome.report();
    assert_eq!(
        report.stages,
        vec![Stage::Fetch, Stage::Buffer, Stage::Transform, Stage::Validate]
    );
    assert_eq!(report.records_buffered, 2);
    assert_eq!(report.transform.as_ref().unwrap().rows_written, 4);
    assert_eq!(report.checks.len(), 2);
    assert!(report
        .lines
        .contains(&"Success: Data for AMZN sent to buffer.".to_string()));
    assert_eq!(report.outcome, "Success");
}

#[test]
fn inconsistent_row_fails_validation() {
    let dir = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::default());
    api.set("AMZN", two_good_bars());
    api.set(
        "TSLA",
        vec![
            bar("2024-01-02", 10.0, 11.0, 9.0, 10.5),
            bar("2024-01-03", 10.0, 10.0, 9.0, 12.0),
        ],
    );

    let outcome = pipeline(dir.path(), &["AMZN", "TSLA"], api).run();

    assert_eq!(
        outcome.to_string(),
        r#"Failure(validate, "ohlc_consistency: 1 issues found")"#
    );
    assert_eq!(outcome.exit_code(), 1);
    match outcome {
        RunOutcome::Failure { stage, report, .. } => {
            assert_eq!(stage, Stage::Validate);
            assert_eq!(report.checks[0].violation_count, 1);
        }
        RunOutcome::Success(_) => unreachable!(),
    }
}

#[test]
fn partial_fetch_failure_is_not_fatal() {
    let dir = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::default());
    api.set("AMZN", two_good_bars());

    let outcome = pipeline(dir.path(), &["AMZN", "DELISTED"], api).run();

    assert!(outcome.is_success(), "{outcome}");
    let report = outcome.report();
    assert_eq!(report.symbols_fetched, 1);
    assert_eq!(report.symbols_failed, vec!["DELISTED".to_string()]);
    assert!(report
        .lines
        .iter()
        .any(|l| l.starts_with("Error: Failed to fetch data for DELISTED")));
}

#[test]
fn nothing_fetched_fails_the_fetch_stage() {
    let dir = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::default());

    let outcome = pipeline(dir.path(), &["AMZN", "TSLA"], api).ingest();

    match outcome {
        RunOutcome::Failure { stage, .. } => assert_eq!(stage, Stage::Fetch),
        RunOutcome::Success(_) => panic!("expected fetch failure"),
    }
}

#[test]
fn double_ingest_does_not_duplicate_rows() {
    let dir = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::default());
    api.set("AMZN", two_good_bars());
    let p = pipeline(dir.path(), &["AMZN"], api);

    assert!(p.ingest().is_success());
    assert!(p.ingest().is_success());
    let outcome = p.transform();

    assert!(outcome.is_success(), "{outcome}");
    let summary = outcome.report().transform.clone().unwrap();
    assert_eq!(summary.records_read, 2);
    assert_eq!(summary.duplicates_dropped, 2);

    let rows = read_rows(&dir.path().join("transformed")).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(p.validate().is_success());
}

#[test]
fn drop_table_is_isolated_and_breaks_validation_until_rebuild() {
    let dir = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::default());
    api.set("IBM", two_good_bars());
    let p = pipeline(dir.path(), &["IBM"], api);
    assert!(p.run().is_success());

    let dropped = p.drop_table();
    assert!(dropped.is_success(), "{dropped}");
    assert_eq!(dropped.report().stages, vec![Stage::Cleanup]);
    assert!(dropped.report().dropped.as_ref().unwrap().existed);
    assert_eq!(p.status().unwrap().state, TableState::Absent);

    match p.validate() {
        RunOutcome::Failure { stage, reason, .. } => {
            assert_eq!(stage, Stage::Validate);
            assert!(reason.contains("failed to execute query"), "{reason}");
        }
        RunOutcome::Success(_) => panic!("validation of a dropped table must fail"),
    }

    assert!(p.transform().is_success());
    assert!(p.validate().is_success());
}

#[test]
fn dropping_an_absent_table_succeeds() {
    let dir = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::default());
    let p = pipeline(dir.path(), &["AMZN"], api);

    let outcome = p.drop_table();

    assert!(outcome.is_success(), "{outcome}");
    assert!(!outcome.report().dropped.as_ref().unwrap().existed);
}

#[test]
fn status_reports_table_and_buffer() {
    let dir = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::default());
    api.set("NVDA", two_good_bars());
    let p = pipeline(dir.path(), &["NVDA"], api);
    assert!(p.run().is_success());

    let status = p.status().unwrap();

    assert_eq!(status.state, TableState::Ready);
    assert_eq!(status.manifest.unwrap().row_count, 2);
    assert_eq!(status.buffer.unwrap().total_records(), 1);
    assert!(status.entry.is_some());
}

#[test]
fn report_round_trips_to_json_file() {
    let dir = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::default());
    api.set("AMZN", two_good_bars());

    let outcome = pipeline(dir.path(), &["AMZN"], api).run();
    let path = dir.path().join("reports").join("run.json");
    outcome.report().write_json(&path).unwrap();

    let json: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(json["outcome"], "Success");
    assert_eq!(json["stages"][0], "fetch");
}

#[test]
fn cancellation_stops_validation_polling() {
    let dir = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::default());
    api.set("AMZN", two_good_bars());
    let p = pipeline(dir.path(), &["AMZN"], api);
    assert!(p.ingest().is_success());
    assert!(p.transform().is_success());

    p.cancellation().cancel();
    let outcome = p.validate();

    match outcome {
        RunOutcome::Failure { stage, reason, .. } => {
            assert_eq!(stage, Stage::Validate);
            assert!(reason.contains("cancelled"), "{reason}");
        }
        other => panic!("expected failure, got {other}"),
    }
}
