//! QuoteLake CLI: ingest, transform, validate and maintain the quote table.
//!
//! Commands:
//! - `ingest`: fetch every symbol and append it to the durable buffer
//! - `transform`: rebuild the Parquet table from the buffer
//! - `validate`: run the quality checks against the table
//! - `run`: ingest, transform and validate in sequence
//! - `drop-table`: drop the table ahead of a clean rebuild
//! - `status`: show table state, dataset manifest and buffer counts

mod obs;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use quotelake_runner::{Pipeline, PipelineConfig, RunOutcome};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "quotelake",
    version,
    about = "QuoteLake: buffered quote ingestion into a validated Parquet table"
)]
struct Cli {
    /// Path to a TOML config file. Built-in defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter (overridden by QUOTELAKE_LOG).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log output format: text or json.
    #[arg(long, global = true, default_value = "text")]
    log_format: String,

    /// Write the run report as JSON to this path.
    #[arg(long, global = true)]
    report: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Default)]
struct WindowArgs {
    /// Symbols to fetch, comma separated (e.g. AMZN,TSLA).
    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,

    /// Start date (YYYY-MM-DD).
    #[arg(long)]
    start: Option<String>,

    /// End date (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    end: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch quotes and append them to the durable buffer.
    Ingest(WindowArgs),
    /// Rebuild the table from everything in the buffer.
    Transform,
    /// Run the quality checks against the table.
    Validate,
    /// Ingest, transform and validate.
    Run(WindowArgs),
    /// Drop the table so the next transform starts clean.
    DropTable,
    /// Show table state, dataset manifest and buffer counts.
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    obs::init_tracing(&cli.log_level, &cli.log_format).map_err(anyhow::Error::msg)?;

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Commands::Ingest(window) | Commands::Run(window) = &cli.command {
        apply_window(&mut config, window)?;
    }

    let pipeline = Pipeline::local(config).context("failed to set up pipeline")?;
    install_interrupt(&pipeline)?;

    let outcome = match cli.command {
        Commands::Ingest(_) => pipeline.ingest(),
        Commands::Transform => pipeline.transform(),
        Commands::Validate => pipeline.validate(),
        Commands::Run(_) => pipeline.run(),
        Commands::DropTable => pipeline.drop_table(),
        Commands::Status => {
            let status = pipeline.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            return Ok(());
        }
    };

    finish(outcome, cli.report)
}

/// First Ctrl-C cancels in-flight query polling so the stage fails cleanly;
/// a second one exits immediately.
fn install_interrupt(pipeline: &Pipeline) -> Result<()> {
    let cancel = pipeline.cancellation();
    ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            std::process::exit(130);
        }
        tracing::warn!("interrupt received, cancelling in-flight queries");
        cancel.cancel();
    })
    .context("failed to install interrupt handler")
}

fn parse_date(flag: &str, value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("{flag} expects YYYY-MM-DD, got '{value}'"))
}

fn apply_window(config: &mut PipelineConfig, window: &WindowArgs) -> Result<()> {
    if !window.symbols.is_empty() {
        config.api.symbols = window
            .symbols
            .iter()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(start) = &window.start {
        config.api.start_date = parse_date("--start", start)?;
    }
    if let Some(end) = &window.end {
        config.api.end_date = Some(parse_date("--end", end)?);
    }
    config.validate()?;
    Ok(())
}

fn finish(outcome: RunOutcome, report_path: Option<PathBuf>) -> Result<()> {
    for line in &outcome.report().lines {
        println!("{line}");
    }
    for check in &outcome.report().checks {
        println!("{}: {} violation(s)", check.check_name, check.violation_count);
    }

    if let Some(path) = report_path {
        outcome
            .report()
            .write_json(&path)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
    }

    if outcome.is_success() {
        println!("{outcome}");
        Ok(())
    } else {
        eprintln!("{outcome}");
        std::process::exit(outcome.exit_code());
    }
}
