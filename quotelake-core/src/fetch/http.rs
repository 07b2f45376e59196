//! HTTP price API source.
//!
//! `GET {base}/getSingleStockDetailsInDepth?symbol=S&start_date=D&end_date=D`
//! where dates are rendered as full month name, zero-padded day and year
//! (`June 01 2020`). Any non-200 status is a failure for that symbol only.

use super::{FetchError, QuoteSource};
use chrono::NaiveDate;
use reqwest::Url;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://stock-market-data-manage.onrender.com";
const DETAILS_PATH: &str = "getSingleStockDetailsInDepth";

/// Blocking HTTP client for the price API.
pub struct HttpQuoteSource {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpQuoteSource {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        user_agent: &str,
    ) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    /// Date format the API expects in `start_date` / `end_date`.
    pub fn format_api_date(date: NaiveDate) -> String {
        date.format("%B %d %Y").to_string()
    }

    /// Build the request URL for a symbol and window.
    pub fn request_url(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Url, FetchError> {
        let endpoint = format!("{}/{DETAILS_PATH}", self.base_url.trim_end_matches('/'));
        Url::parse_with_params(
            &endpoint,
            &[
                ("symbol", symbol.to_string()),
                ("start_date", Self::format_api_date(start)),
                ("end_date", Self::format_api_date(end)),
            ],
        )
        .map_err(|e| FetchError::InvalidRequest {
            symbol: symbol.to_string(),
            reason: e.to_string(),
        })
    }
}

impl QuoteSource for HttpQuoteSource {
    fn name(&self) -> &str {
        "stock_details_api"
    }

    fn fetch(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<serde_json::Value, FetchError> {
        let url = self.request_url(symbol, start, end)?;
        tracing::debug!(symbol, %url, "requesting");

        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| FetchError::NetworkUnreachable(e.to_string()))?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(FetchError::Status {
                symbol: symbol.to_string(),
                status: status.as_u16(),
            });
        }

        let body = resp
            .text()
            .map_err(|e| FetchError::NetworkUnreachable(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| FetchError::Parse {
            symbol: symbol.to_string(),
            reason: e.to_string(),
        })
    }
}
