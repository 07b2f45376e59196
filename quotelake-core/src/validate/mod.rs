//! Quality validator: declarative invariant checks run as aggregate SQL.
//!
//! Each check is a named predicate that identifies violating rows. The
//! validator counts matches per check; any non-zero count fails the run.

use crate::catalog::TableRef;
use crate::engine::sql::double_quote;
use crate::engine::{await_terminal, CancellationToken, PollConfig, QueryEngine, QueryRequest};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantCheck {
    pub name: String,
    /// SQL boolean expression that is true for a violating row.
    pub predicate: String,
}

impl InvariantCheck {
    pub fn new(name: impl Into<String>, predicate: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            predicate: predicate.into(),
        }
    }

    pub fn ohlc_consistency() -> Self {
        Self::new(
            "ohlc_consistency",
            "NOT (high >= open AND high >= close AND low <= open AND low <= close)",
        )
    }

    pub fn non_negative_prices() -> Self {
        Self::new(
            "non_negative_prices",
            "adjusted_close < 0 OR close < 0 OR high < 0 OR low < 0 OR open < 0",
        )
    }

    /// Checks every run includes, in order.
    pub fn mandatory() -> Vec<Self> {
        vec![Self::ohlc_consistency(), Self::non_negative_prices()]
    }

    pub fn sql(&self, table: &str) -> String {
        format!(
            "SELECT COUNT(*) AS violation_count FROM {} WHERE {}",
            double_quote(table),
            self.predicate
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub check_name: String,
    pub violation_count: u64,
}

impl ValidationResult {
    pub fn passed(&self) -> bool {
        self.violation_count == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{check}: {count} issues found")]
    Violations { check: String, count: u64 },

    #[error("{check}: failed to execute query: {reason}")]
    Query { check: String, reason: String },
}

impl ValidationError {
    pub fn check(&self) -> &str {
        match self {
            ValidationError::Violations { check, .. } | ValidationError::Query { check, .. } => {
                check
            }
        }
    }
}

/// Per-check results plus the failure that ended the run, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub results: Vec<ValidationResult>,
    pub failure: Option<ValidationError>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }

    pub fn into_result(self) -> Result<Vec<ValidationResult>, ValidationError> {
        match self.failure {
            Some(e) => Err(e),
            None => Ok(self.results),
        }
    }
}

pub struct QualityValidator {
    engine: Arc<dyn QueryEngine>,
    table: TableRef,
    output_location: String,
    checks: Vec<InvariantCheck>,
    poll: PollConfig,
    fail_fast: bool,
}

impl QualityValidator {
    /// Validator with the mandatory checks.
    pub fn new(
        engine: Arc<dyn QueryEngine>,
        table: TableRef,
        output_location: impl Into<String>,
        poll: PollConfig,
    ) -> Self {
        Self {
            engine,
            table,
            output_location: output_location.into(),
            checks: InvariantCheck::mandatory(),
            poll,
            fail_fast: true,
        }
    }

    /// Append checks after the mandatory ones.
    pub fn with_checks(mut self, extra: impl IntoIterator<Item = InvariantCheck>) -> Self {
        self.checks.extend(extra);
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn checks(&self) -> &[InvariantCheck] {
        &self.checks
    }

    /// Run one check and return its violation count.
    pub fn run_check(
        &self,
        check: &InvariantCheck,
        cancel: &CancellationToken,
    ) -> Result<ValidationResult, ValidationError> {
        let query_err = |reason: String| ValidationError::Query {
            check: check.name.clone(),
            reason,
        };

        let request = QueryRequest {
            sql: check.sql(&self.table.name),
            database: self.table.database.clone(),
            output_location: self.output_location.clone(),
        };
        let id = self
            .engine
            .start_query(&request)
            .map_err(|e| query_err(e.to_string()))?;
        await_terminal(self.engine.as_ref(), &id, self.poll, cancel)
            .map_err(|e| query_err(e.to_string()))?;

        let df = self
            .engine
            .get_results(&id)
            .map_err(|e| query_err(e.to_string()))?;
        let violation_count = first_count(&df).map_err(query_err)?;

        Ok(ValidationResult {
            check_name: check.name.clone(),
            violation_count,
        })
    }

    /// Run every check in order. With `fail_fast` the first failure stops
    /// the run; otherwise all checks run and the first failure is reported.
    pub fn run(&self, cancel: &CancellationToken) -> ValidationReport {
        let mut report = ValidationReport::default();

        for check in &self.checks {
            let outcome = self.run_check(check, cancel).and_then(|result| {
                let count = result.violation_count;
                report.results.push(result);
                if count > 0 {
                    Err(ValidationError::Violations {
                        check: check.name.clone(),
                        count,
                    })
                } else {
                    Ok(())
                }
            });

            match outcome {
                Ok(()) => {
                    tracing::info!(check = %check.name, "quality check passed");
                }
                Err(e) => {
                    tracing::error!(check = %check.name, error = %e, "quality check failed");
                    if report.failure.is_none() {
                        report.failure = Some(e);
                    }
                    if self.fail_fast {
                        break;
                    }
                }
            }
        }

        report
    }
}

/// First cell of the first column, as a non-negative count.
///
/// An aggregate over zero matching rows may come back as an empty frame;
/// that is a count of zero.
fn first_count(df: &DataFrame) -> Result<u64, String> {
    let column = df
        .get_columns()
        .first()
        .ok_or_else(|| "query returned no columns".to_string())?;
    if column.len() == 0 {
        return Ok(0);
    }
    let cast = column
        .cast(&DataType::Int64)
        .map_err(|e| format!("count column is not numeric: {e}"))?;
    let count = cast
        .i64()
        .map_err(|e| e.to_string())?
        .get(0)
        .ok_or_else(|| "count is null".to_string())?;
    u64::try_from(count).map_err(|_| format!("negative count {count}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, ExecutionId, ExecutionState, ExecutionStatus};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Answers each check's SQL with a canned count, or fails it.
    struct CannedEngine {
        counts: HashMap<&'static str, Result<i64, &'static str>>,
        submitted: Mutex<Vec<String>>,
        /// Answer zero counts with a zero-row frame.
        empty_when_zero: bool,
    }

    impl CannedEngine {
        fn new(counts: Vec<(&'static str, Result<i64, &'static str>)>) -> Self {
            Self {
                counts: counts.into_iter().collect(),
                submitted: Mutex::new(Vec::new()),
                empty_when_zero: false,
            }
        }

        fn empty_when_zero(mut self) -> Self {
            self.empty_when_zero = true;
            self
        }

        fn lookup(&self, id: &ExecutionId) -> Result<i64, &'static str> {
            let submitted = self.submitted.lock().unwrap();
            let sql = &submitted[id.0.parse::<usize>().unwrap()];
            self.counts
                .iter()
                .find(|(pred, _)| sql.contains(*pred))
                .map(|(_, r)| *r)
                .unwrap_or(Ok(0))
        }
    }

    impl QueryEngine for CannedEngine {
        fn start_query(&self, request: &QueryRequest) -> Result<ExecutionId, EngineError> {
            let mut submitted = self.submitted.lock().unwrap();
            submitted.push(request.sql.clone());
            Ok(ExecutionId((submitted.len() - 1).to_string()))
        }

        fn get_status(&self, id: &ExecutionId) -> Result<ExecutionStatus, EngineError> {
            Ok(match self.lookup(id) {
                Ok(_) => ExecutionStatus::new(ExecutionState::Succeeded),
                Err(reason) => ExecutionStatus::with_reason(ExecutionState::Failed, reason),
            })
        }

        fn get_results(&self, id: &ExecutionId) -> Result<DataFrame, EngineError> {
            let count = self.lookup(id).unwrap_or_default();
            let values: Vec<i64> = if count == 0 && self.empty_when_zero {
                Vec::new()
            } else {
                vec![count]
            };
            Ok(DataFrame::new(vec![Column::new("violation_count".into(), values)]).unwrap())
        }
    }

    fn validator(engine: Arc<CannedEngine>) -> QualityValidator {
        QualityValidator::new(
            engine,
            TableRef::new("db", "quotes"),
            "results",
            PollConfig {
                interval: Duration::from_millis(1),
                max_polls: 5,
            },
        )
    }

    #[test]
    fn all_zero_counts_pass() {
        let engine = Arc::new(CannedEngine::new(vec![]));
        let report = validator(engine.clone()).run(&CancellationToken::new());

        assert!(report.passed());
        assert_eq!(report.results.len(), 2);
        assert!(engine.submitted.lock().unwrap()[0]
            .starts_with(r#"SELECT COUNT(*) AS violation_count FROM "quotes" WHERE NOT ("#));
    }

    #[test]
    fn zero_row_aggregate_counts_as_zero() {
        let engine = Arc::new(CannedEngine::new(vec![("low < 0", Ok(2))]).empty_when_zero());
        let report = validator(engine)
            .fail_fast(false)
            .run(&CancellationToken::new());

        assert_eq!(report.results[0].violation_count, 0);
        assert_eq!(report.results[1].violation_count, 2);
        assert_eq!(
            report.failure.unwrap().to_string(),
            "non_negative_prices: 2 issues found"
        );
    }

    #[test]
    fn empty_frame_without_columns_is_a_query_error() {
        assert_eq!(first_count(&DataFrame::empty()), Err("query returned no columns".to_string()));
        let empty = DataFrame::new(vec![Column::new("violation_count".into(), Vec::<i64>::new())])
            .unwrap();
        assert_eq!(first_count(&empty), Ok(0));
    }

    #[test]
    fn violation_reports_check_and_count() {
        let engine = Arc::new(CannedEngine::new(vec![("NOT (high", Ok(3))]));
        let report = validator(engine.clone()).run(&CancellationToken::new());

        let err = report.failure.clone().unwrap();
        assert_eq!(err.to_string(), "ohlc_consistency: 3 issues found");
        assert_eq!(report.results.len(), 1);
        assert_eq!(engine.submitted.lock().unwrap().len(), 1);
    }

    #[test]
    fn without_fail_fast_every_check_runs() {
        let engine = Arc::new(CannedEngine::new(vec![("NOT (high", Ok(2)), ("low < 0", Ok(1))]));
        let report = validator(engine).fail_fast(false).run(&CancellationToken::new());

        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[1].violation_count, 1);
        assert_eq!(report.failure.unwrap().check(), "ohlc_consistency");
    }

    #[test]
    fn query_failure_is_distinct_from_violation() {
        let engine = Arc::new(CannedEngine::new(vec![(
            "NOT (high",
            Err("Table not found"),
        )]));
        let report = validator(engine).run(&CancellationToken::new());

        match report.failure {
            Some(ValidationError::Query { check, reason }) => {
                assert_eq!(check, "ohlc_consistency");
                assert!(reason.contains("Table not found"));
            }
            other => panic!("expected query error, got {other:?}"),
        }
    }

    #[test]
    fn extra_checks_run_after_mandatory_ones() {
        let engine = Arc::new(CannedEngine::new(vec![]));
        let v = validator(engine.clone())
            .with_checks([InvariantCheck::new("positive_volume", "volume < 0")]);

        let report = v.run(&CancellationToken::new());

        assert_eq!(report.results.len(), 3);
        assert_eq!(report.results[2].check_name, "positive_volume");
    }
}
