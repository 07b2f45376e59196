//! Raw API observation as it travels through the durable buffer.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One API response for one symbol, stamped at fetch time.
///
/// Immutable once buffered. The serialized field names match what the
/// downstream table expects: the ingest timestamp is written as `row_ts`
/// and the alias as `company`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub symbol: String,
    pub fetch_window_start: NaiveDate,
    pub fetch_window_end: NaiveDate,
    #[serde(rename = "row_ts")]
    pub ingest_timestamp: DateTime<Utc>,
    #[serde(rename = "company")]
    pub symbol_alias: String,
    /// The untouched API body. Daily observations live under `data`.
    pub payload: serde_json::Value,
}

impl RawObservation {
    pub fn new(
        symbol: impl Into<String>,
        fetch_window_start: NaiveDate,
        fetch_window_end: NaiveDate,
        payload: serde_json::Value,
        ingest_timestamp: DateTime<Utc>,
    ) -> Self {
        let symbol = symbol.into();
        Self {
            symbol_alias: symbol.clone(),
            symbol,
            fetch_window_start,
            fetch_window_end,
            ingest_timestamp,
            payload,
        }
    }

    /// Serialize as a single newline-terminated JSON document.
    pub fn to_buffer_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one buffered line (trailing newline optional).
    pub fn from_buffer_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end_matches(&['\r', '\n'][..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample() -> RawObservation {
        RawObservation::new(
            "AMZN",
            NaiveDate::from_ymd_opt(2020, 6, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            json!({"data": [{"date": "2024-02-29", "open": 1.0}]}),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        )
    }

    #[test]
    fn buffer_line_is_single_terminated_line() {
        let line = sample().to_buffer_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn buffer_line_uses_table_field_names() {
        let line = sample().to_buffer_line().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["company"], "AMZN");
        assert_eq!(value["row_ts"], "2024-03-01T12:00:00Z");
        assert_eq!(value["fetch_window_start"], "2020-06-01");
        assert!(value["payload"]["data"].is_array());
    }

    #[test]
    fn parses_back_what_it_wrote() {
        let obs = sample();
        let parsed = RawObservation::from_buffer_line(&obs.to_buffer_line().unwrap()).unwrap();
        assert_eq!(parsed, obs);
    }
}
