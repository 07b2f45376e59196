//! Pipeline coordinator.
//!
//! Sequences the stages and turns their results into a [`RunOutcome`]:
//! - `ingest`: fetch every symbol, then buffer every fetched observation
//! - `transform`: rebuild the table from the buffer
//! - `validate`: run the quality checks against the table
//! - `run`: ingest, transform, validate; stops at the first failing stage
//! - `drop_table`: isolated maintenance, never chained with the others
//!
//! Components are injected through [`PipelineComponents`]; [`Pipeline::local`]
//! wires the file-backed implementations from a [`PipelineConfig`].

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::outcome::{DropSummary, RunOutcome, RunReport, Stage};
use quotelake_core::buffer::{BufferStats, BufferWriter, FileBuffer};
use quotelake_core::catalog::{CatalogTable, CatalogTableManager, JsonCatalog, TableState};
use quotelake_core::engine::{CancellationToken, LocalQueryEngine};
use quotelake_core::fetch::{FetchReport, HttpQuoteSource, RecordFetcher};
use quotelake_core::transform::parquet::{read_manifest, DatasetManifest};
use quotelake_core::transform::BatchTransformer;
use quotelake_core::validate::QualityValidator;
use rayon::prelude::*;
use serde::Serialize;
use std::sync::Arc;

/// The stage implementations a pipeline drives.
pub struct PipelineComponents {
    pub fetcher: RecordFetcher,
    pub writer: BufferWriter,
    pub transformer: BatchTransformer,
    pub validator: QualityValidator,
    pub tables: Arc<CatalogTableManager>,
    /// Local buffer, when there is one to report on.
    pub file_buffer: Option<Arc<FileBuffer>>,
}

/// Snapshot of the table and buffer for the `status` command.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub table: String,
    pub state: TableState,
    pub entry: Option<CatalogTable>,
    pub manifest: Option<DatasetManifest>,
    pub buffer: Option<BufferStats>,
}

pub struct Pipeline {
    config: PipelineConfig,
    components: PipelineComponents,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, components: PipelineComponents) -> Self {
        Self {
            config,
            components,
            cancel: CancellationToken::new(),
        }
    }

    /// Wire the HTTP fetcher with the file buffer, JSON catalog and local
    /// query engine.
    pub fn local(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let setup = |what: &str, e: &dyn std::fmt::Display| {
            PipelineError::Setup(format!("{what}: {e}"))
        };

        let source = HttpQuoteSource::new(
            config.api.base_url.clone(),
            config.fetch_timeout(),
            &config.api.user_agent,
        )
        .map_err(|e| setup("http client", &e))?;

        let file_buffer = Arc::new(
            FileBuffer::open(
                &config.buffer.dir,
                &config.buffer.stream_name,
                config.buffer.shards,
            )
            .map_err(|e| setup("buffer", &e))?,
        );
        let catalog = Arc::new(
            JsonCatalog::open(&config.catalog.catalog_path).map_err(|e| setup("catalog", &e))?,
        );
        let engine = Arc::new(LocalQueryEngine::new(catalog.clone()));
        let output_location = config.catalog.output_location.to_string_lossy().into_owned();

        let tables = Arc::new(
            CatalogTableManager::new(
                engine.clone(),
                catalog,
                output_location.clone(),
                config.poll(),
            )
            .with_lock_dir(config.lock_dir()),
        );
        let transformer = BatchTransformer::new(
            file_buffer.clone(),
            tables.clone(),
            config.table(),
            config.catalog.location.clone(),
        );
        let validator = QualityValidator::new(engine, config.table(), output_location, config.poll())
            .with_checks(config.validation.checks.clone())
            .fail_fast(config.validation.fail_fast);

        let components = PipelineComponents {
            fetcher: RecordFetcher::new(Arc::new(source)),
            writer: BufferWriter::new(file_buffer.clone(), config.retry()),
            transformer,
            validator,
            tables,
            file_buffer: Some(file_buffer),
        };
        Ok(Self::new(config, components))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Token that aborts in-flight poll loops when cancelled. The CLI
    /// cancels it on interrupt.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn pool(&self) -> Result<rayon::ThreadPool, PipelineError> {
        let threads = self
            .config
            .api
            .symbols
            .len()
            .min(self.config.api.max_concurrency)
            .max(1);
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("ingest-{i}"))
            .build()
            .map_err(|e| PipelineError::Setup(format!("thread pool: {e}")))
    }

    /// Fetch every configured symbol over the configured window.
    pub fn fetch_all(&self) -> Result<FetchReport, PipelineError> {
        let start = self.config.api.start_date;
        let end = self.config.end_date();
        let symbols = &self.config.api.symbols;
        tracing::info!(
            source = self.components.fetcher.source_name(),
            symbols = symbols.len(),
            %start,
            %end,
            "fetching"
        );
        let pool = self.pool()?;
        Ok(pool.install(|| self.components.fetcher.fetch_all(symbols, start, end)))
    }

    /// Buffer every fetched observation. All symbols are attempted; the
    /// first submission error fails the stage.
    pub fn buffer_all(
        &self,
        fetched: &FetchReport,
        report: &mut RunReport,
    ) -> Result<usize, PipelineError> {
        let pool = self.pool()?;
        let observations: Vec<_> = fetched.observations().collect();
        let results: Vec<_> = pool.install(|| {
            observations
                .par_iter()
                .map(|obs| (obs.symbol.clone(), self.components.writer.append(obs)))
                .collect()
        });

        let mut buffered = 0;
        let mut first_error = None;
        for (symbol, result) in results {
            match result {
                Ok(ack) => {
                    tracing::info!(symbol = %symbol, record_id = %ack.record_id, "buffered");
                    report.lines.push(format!("Success: Data for {symbol} sent to buffer."));
                    buffered += 1;
                }
                Err(e) => {
                    tracing::error!(symbol = %symbol, error = %e, "buffer submission failed");
                    report
                        .lines
                        .push(format!("Error: Failed to send data for {symbol} to buffer."));
                    first_error.get_or_insert(e);
                }
            }
        }
        report.records_buffered += buffered;

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(buffered),
        }
    }

    fn ingest_into(&self, report: &mut RunReport) -> Result<(), PipelineError> {
        enter(report, Stage::Fetch);
        let fetched = self.fetch_all()?;
        report.lines.extend(fetched.lines.iter().cloned());
        report.symbols_fetched = fetched.succeeded();
        report.symbols_failed = fetched.failures().map(|(s, _)| s.to_string()).collect();
        if fetched.succeeded() == 0 {
            return Err(PipelineError::NothingFetched {
                failed: fetched.failed(),
            });
        }
        if fetched.failed() > 0 {
            tracing::warn!(
                failed = fetched.failed(),
                succeeded = fetched.succeeded(),
                "continuing with partial fetch"
            );
        }

        enter(report, Stage::Buffer);
        self.buffer_all(&fetched, report)?;
        Ok(())
    }

    fn transform_into(&self, report: &mut RunReport) -> Result<(), PipelineError> {
        enter(report, Stage::Transform);
        let summary = self.components.transformer.run()?;
        report.transform = Some(summary);
        Ok(())
    }

    fn validate_into(&self, report: &mut RunReport) -> Result<(), PipelineError> {
        enter(report, Stage::Validate);
        let outcome = self.components.validator.run(&self.cancel);
        report.checks = outcome.results.clone();
        outcome.into_result()?;
        Ok(())
    }

    pub fn ingest(&self) -> RunOutcome {
        self.execute(|p, r| p.ingest_into(r))
    }

    pub fn transform(&self) -> RunOutcome {
        self.execute(|p, r| p.transform_into(r))
    }

    pub fn validate(&self) -> RunOutcome {
        self.execute(|p, r| p.validate_into(r))
    }

    /// Ingest, transform, validate. Never drops the table.
    pub fn run(&self) -> RunOutcome {
        self.execute(|p, r| {
            p.ingest_into(r)?;
            p.transform_into(r)?;
            p.validate_into(r)
        })
    }

    /// Drop the table so the next transform rebuilds it from scratch.
    pub fn drop_table(&self) -> RunOutcome {
        self.execute(|p, r| {
            enter(r, Stage::Cleanup);
            let table = p.config.table();
            let dropped = p.components.tables.drop_if_exists(&table, &p.cancel)?;
            r.dropped = Some(DropSummary {
                table: table.to_string(),
                existed: dropped.existed,
                polls: dropped.polls,
            });
            Ok(())
        })
    }

    pub fn status(&self) -> Result<StatusReport, PipelineError> {
        let table = self.config.table();
        let tables = &self.components.tables;
        let manifest = read_manifest(&self.config.catalog.location)
            .map_err(|e| PipelineError::Setup(format!("manifest: {e}")))?;
        let buffer = match &self.components.file_buffer {
            Some(b) => Some(
                b.stats()
                    .map_err(|e| PipelineError::Setup(format!("buffer stats: {e}")))?,
            ),
            None => None,
        };
        Ok(StatusReport {
            table: table.to_string(),
            state: tables.state(&table).map_err(PipelineError::Cleanup)?,
            entry: tables.describe(&table).map_err(PipelineError::Cleanup)?,
            manifest,
            buffer,
        })
    }

    fn execute(
        &self,
        body: impl FnOnce(&Self, &mut RunReport) -> Result<(), PipelineError>,
    ) -> RunOutcome {
        let mut report = RunReport::start(&self.config.api.symbols);
        let result = body(self, &mut report);
        report.finished_at = Some(chrono::Utc::now());

        match result {
            Ok(()) => {
                report.outcome = "Success".to_string();
                tracing::info!(run_id = %report.run_id, "pipeline succeeded");
                RunOutcome::Success(report)
            }
            Err(e) => {
                let stage = e.stage();
                let reason = e.to_string();
                tracing::error!(run_id = %report.run_id, %stage, %reason, "pipeline failed");
                report.outcome = format!("Failure({stage}, {reason:?})");
                RunOutcome::Failure {
                    stage,
                    reason,
                    report,
                }
            }
        }
    }
}

fn enter(report: &mut RunReport, stage: Stage) {
    tracing::info!(%stage, "stage started");
    report.stages.push(stage);
}
