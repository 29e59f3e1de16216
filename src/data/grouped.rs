//! Grouped-daily HTTP provider.
//!
//! One request per date returns the whole US equity universe.
//!
//! API: `{base_url}/v2/aggs/grouped/locale/us/market/stocks/{date}`
//! Auth: API key via `apiKey` query param.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{DailyBar, MarketDataProvider};

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GroupedResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    results: Vec<GroupedBar>,
}

#[derive(Debug, Deserialize)]
struct GroupedBar {
    #[serde(rename = "T")]
    ticker: String,
    #[serde(rename = "o")]
    open: f64,
    #[serde(rename = "h")]
    high: f64,
    #[serde(rename = "l")]
    low: f64,
    #[serde(rename = "c")]
    close: f64,
    #[serde(rename = "v", default)]
    volume: f64,
    #[serde(rename = "vw", default)]
    vwap: Option<f64>,
    #[serde(rename = "n", default)]
    transactions: Option<u64>,
    /// Session timestamp, epoch milliseconds.
    #[serde(rename = "t", default)]
    timestamp: Option<i64>,
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct GroupedDailyProvider {
    http: Client,
    base_url: String,
    api_key: SecretString,
}

impl GroupedDailyProvider {
    pub fn new(base_url: &str, api_key: SecretString) -> Result<Self> {
        // Units may run on short-lived worker runtimes; pooled connections
        // must not outlive the runtime that opened them.
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .pool_max_idle_per_host(0)
            .user_agent("SCANLAB/0.1.0")
            .build()
            .context("Failed to build market-data HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, date: NaiveDate) -> String {
        format!(
            "{}/v2/aggs/grouped/locale/us/market/stocks/{}?adjusted=true&apiKey={}",
            self.base_url,
            date.format("%Y-%m-%d"),
            urlencoding::encode(self.api_key.expose_secret())
        )
    }

    fn into_bars(date: NaiveDate, resp: GroupedResponse) -> Vec<DailyBar> {
        resp.results
            .into_iter()
            .filter(|b| b.close.is_finite() && b.close > 0.0)
            .map(|b| {
                let bar_date = b
                    .timestamp
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                    .map(|ts| ts.date_naive())
                    .unwrap_or(date);
                DailyBar {
                    ticker: b.ticker,
                    date: bar_date,
                    open: b.open,
                    high: b.high,
                    low: b.low,
                    close: b.close,
                    volume: b.volume,
                    vwap: b.vwap,
                    transactions: b.transactions,
                }
            })
            .collect()
    }
}

#[async_trait]
impl MarketDataProvider for GroupedDailyProvider {
    fn name(&self) -> &'static str {
        "grouped_http"
    }

    async fn grouped_daily(&self, date: NaiveDate) -> Result<Vec<DailyBar>> {
        let resp = self
            .http
            .get(self.url(date))
            .send()
            .await
            .with_context(|| format!("Grouped-daily request failed for {date}"))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            debug!(%date, "No grouped data for date");
            return Ok(Vec::new());
        }
        if !status.is_success() {
            anyhow::bail!("Grouped-daily API error for {date}: {status}");
        }

        let body: GroupedResponse = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse grouped-daily response for {date}"))?;

        if let Some(s) = body.status.as_deref() {
            if s != "OK" && s != "DELAYED" {
                warn!(%date, status = s, "Grouped-daily response not OK");
            }
        }

        let bars = Self::into_bars(date, body);
        debug!(%date, bars = bars.len(), "Fetched grouped daily bars");
        Ok(bars)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
