//! QuoteLake Runner: the pipeline coordinator.
//!
//! This crate builds on `quotelake-core` to provide:
//! - TOML configuration with defaults and validation
//! - Stage sequencing (ingest, transform, validate, run, drop-table)
//! - Stage-qualified run outcomes and a serializable run report

pub mod config;
pub mod error;
pub mod outcome;
pub mod pipeline;

pub use config::{ConfigError, PipelineConfig};
pub use error::PipelineError;
pub use outcome::{DropSummary, RunOutcome, RunReport, Stage};
pub use pipeline::{Pipeline, PipelineComponents, StatusReport};
