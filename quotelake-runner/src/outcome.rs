//! Run outcomes and the serializable run report.

use chrono::{DateTime, Utc};
use quotelake_core::transform::TransformSummary;
use quotelake_core::validate::ValidationResult;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Setup,
    Fetch,
    Buffer,
    Transform,
    Validate,
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Setup => "setup",
            Stage::Fetch => "fetch",
            Stage::Buffer => "buffer",
            Stage::Transform => "transform",
            Stage::Validate => "validate",
            Stage::Cleanup => "cleanup",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DropSummary {
    pub table: String,
    pub existed: bool,
    pub polls: u32,
}

/// Everything a run observed, in the order it happened.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stages: Vec<Stage>,
    /// Per-symbol fetch and buffer result lines.
    pub lines: Vec<String>,
    pub symbols_fetched: usize,
    pub symbols_failed: Vec<String>,
    pub records_buffered: usize,
    pub transform: Option<TransformSummary>,
    pub checks: Vec<ValidationResult>,
    pub dropped: Option<DropSummary>,
    pub outcome: String,
}

impl RunReport {
    pub fn start(symbols: &[String]) -> Self {
        let started_at = Utc::now();
        let seed = format!("{}|{}", started_at.to_rfc3339(), symbols.join(","));
        let hash = blake3::hash(seed.as_bytes()).to_hex();
        Self {
            run_id: hash.as_str()[..16].to_string(),
            started_at: Some(started_at),
            ..Self::default()
        }
    }

    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, json)
    }
}

/// Final result of a pipeline operation.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Success(RunReport),
    Failure {
        stage: Stage,
        reason: String,
        report: RunReport,
    },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success(_))
    }

    pub fn report(&self) -> &RunReport {
        match self {
            RunOutcome::Success(report) | RunOutcome::Failure { report, .. } => report,
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Success(_) => f.write_str("Success"),
            RunOutcome::Failure { stage, reason, .. } => write!(f, "Failure({stage}, {reason:?})"),
        }
    }
}
