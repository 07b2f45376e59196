//! One materialized row per (symbol, trading day).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A flattened daily observation, produced by the transformer and never
/// mutated in place afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlattenedRow {
    pub symbol: String,
    /// Ingest timestamp carried through from the source observation.
    pub row_ts: DateTime<Utc>,
    pub trade_date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adjusted_close: Option<f64>,
    pub volume: Option<f64>,
}

impl FlattenedRow {
    /// `high` bounds open/close from above and `low` bounds them from below.
    pub fn is_ohlc_consistent(&self) -> bool {
        self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
    }

    /// True if any price column is below zero. A missing adjusted close
    /// does not count.
    pub fn has_negative_price(&self) -> bool {
        self.open < 0.0
            || self.high < 0.0
            || self.low < 0.0
            || self.close < 0.0
            || self.adjusted_close.is_some_and(|p| p < 0.0)
    }
}
