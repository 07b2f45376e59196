//! Record fetcher: one API call per symbol, partial-failure tolerant.
//!
//! The [`QuoteSource`] trait abstracts over where observations come from so
//! the HTTP client can be swapped for a scripted source in tests. The
//! fetcher never retries; a failed symbol is recorded and the batch moves on.

pub mod http;

pub use http::HttpQuoteSource;

use crate::domain::RawObservation;
use chrono::{NaiveDate, Utc};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Per-symbol fetch failures. Never fatal to a batch.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("HTTP {status} for {symbol}")]
    Status { symbol: String, status: u16 },

    #[error("malformed response for {symbol}: {reason}")]
    Parse { symbol: String, reason: String },

    #[error("invalid request for {symbol}: {reason}")]
    InvalidRequest { symbol: String, reason: String },

    #[error("http client error: {0}")]
    Client(String),
}

/// A source of raw JSON observations for one symbol and date window.
pub trait QuoteSource: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// Fetch the raw API body for `symbol` over `[start, end]`.
    fn fetch(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<serde_json::Value, FetchError>;
}

/// Outcome of fetching a batch of symbols.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub results: BTreeMap<String, Result<RawObservation, FetchError>>,
    /// One human-readable line per symbol, in request order.
    pub lines: Vec<String>,
}

impl FetchReport {
    pub fn succeeded(&self) -> usize {
        self.results.values().filter(|r| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.values().filter(|r| r.is_err()).count()
    }

    pub fn observations(&self) -> impl Iterator<Item = &RawObservation> {
        self.results.values().filter_map(|r| r.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &FetchError)> {
        self.results
            .iter()
            .filter_map(|(sym, r)| r.as_ref().err().map(|e| (sym.as_str(), e)))
    }
}

/// Calls a [`QuoteSource`] per symbol and stamps each response.
pub struct RecordFetcher {
    source: Arc<dyn QuoteSource>,
}

impl RecordFetcher {
    pub fn new(source: Arc<dyn QuoteSource>) -> Self {
        Self { source }
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// Fetch one symbol and attach the wall-clock ingest timestamp.
    pub fn fetch_one(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<RawObservation, FetchError> {
        let payload = self.source.fetch(symbol, start, end)?;
        Ok(RawObservation::new(symbol, start, end, payload, Utc::now()))
    }

    /// Fetch every symbol. Runs on the current rayon pool, so callers bound
    /// concurrency by installing a sized pool around this call.
    pub fn fetch_all(&self, symbols: &[String], start: NaiveDate, end: NaiveDate) -> FetchReport {
        let fetched: Vec<(String, Result<RawObservation, FetchError>)> = symbols
            .par_iter()
            .map(|symbol| (symbol.clone(), self.fetch_one(symbol, start, end)))
            .collect();

        let mut report = FetchReport::default();
        for (symbol, result) in fetched {
            let line = match &result {
                Ok(_) => {
                    tracing::info!(symbol = %symbol, source = self.source.name(), "fetched");
                    format!("Success: Data for {symbol} fetched.")
                }
                Err(e) => {
                    tracing::warn!(symbol = %symbol, error = %e, "fetch failed");
                    format!("Error: Failed to fetch data for {symbol}: {e}")
                }
            };
            report.lines.push(line);
            report.results.insert(symbol, result);
        }
        report
    }
}
