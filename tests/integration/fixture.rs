//! Fixture market data for integration testing.
//!
//! Provides a deterministic `MarketDataProvider` whose gaps are placed by a
//! simple arithmetic rule, so tests can predict which (ticker, date) pairs
//! a gap scanner must flag. All state is in-memory.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Datelike, Duration as Days, NaiveDate};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use scanlab::config::AppConfig;
use scanlab::data::{BarCache, DailyBar, MarketDataProvider};
use scanlab::engine::{JobController, JobRequest, ProgressObserver};
use scanlab::runtime::sandbox::ExecutionSandbox;
use scanlab::types::{is_weekday, JobMode};

/// Opens 10% above the previous close on these days.
const GAP_UP_FACTOR: f64 = 1.10;
const GAP_DOWN_FACTOR: f64 = 0.90;

pub struct FixtureProvider {
    tickers: Vec<String>,
    calls: AtomicU64,
    delay: Option<Duration>,
    /// If set, every request fails with this message.
    force_error: Mutex<Option<String>>,
}

impl FixtureProvider {
    pub fn new(universe: usize) -> Self {
        Self {
            tickers: (0..universe).map(|i| format!("FIX{i:02}")).collect(),
            calls: AtomicU64::new(0),
            delay: None,
            force_error: Mutex::new(None),
        }
    }

    /// Every request sleeps for `delay` before answering.
    pub fn slow(universe: usize, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new(universe)
        }
    }

    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn factor(index: usize, date: NaiveDate) -> f64 {
        match (date.num_days_from_ce() as usize + index * 7) % 9 {
            0 => GAP_UP_FACTOR,
            4 => GAP_DOWN_FACTOR,
            _ => 1.0,
        }
    }

    fn close(index: usize, date: NaiveDate) -> f64 {
        20.0 + index as f64 * 3.0 + (date.num_days_from_ce() % 5) as f64
    }

    fn previous_session(date: NaiveDate) -> NaiveDate {
        let mut prev = date - Days::days(1);
        while !is_weekday(prev) {
            prev -= Days::days(1);
        }
        prev
    }

    pub fn bar(index: usize, ticker: &str, date: NaiveDate) -> DailyBar {
        let close = Self::close(index, date);
        let open = Self::close(index, Self::previous_session(date)) * Self::factor(index, date);
        DailyBar {
            ticker: ticker.to_string(),
            date,
            open,
            high: open.max(close) * 1.01,
            low: open.min(close) * 0.99,
            close,
            volume: 1_000_000.0 + index as f64 * 1_000.0,
            vwap: None,
            transactions: None,
        }
    }

    /// Tickers whose open gaps 10% up (or down) on `date`.
    pub fn expected_gaps(&self, date: NaiveDate, up: bool) -> Vec<String> {
        let wanted = if up { GAP_UP_FACTOR } else { GAP_DOWN_FACTOR };
        self.tickers
            .iter()
            .enumerate()
            .filter(|(i, _)| is_weekday(date) && Self::factor(*i, date) == wanted)
            .map(|(_, t)| t.clone())
            .collect()
    }
}

#[async_trait]
impl MarketDataProvider for FixtureProvider {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn grouped_daily(&self, date: NaiveDate) -> Result<Vec<DailyBar>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let forced = self.force_error.lock().unwrap().clone();
        if let Some(msg) = forced {
            return Err(anyhow!(msg));
        }
        if !is_weekday(date) {
            return Ok(Vec::new());
        }
        Ok(self
            .tickers
            .iter()
            .enumerate()
            .map(|(i, t)| Self::bar(i, t, date))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

/// Config whose row estimate matches the fixture universe.
pub fn config(universe: usize) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.sandbox.universe_size = universe as u64;
    cfg.sandbox.timeout_secs = 30;
    cfg
}

pub fn sandbox(cfg: &AppConfig, provider: Arc<FixtureProvider>) -> ExecutionSandbox {
    let cache = Arc::new(BarCache::new(provider, cfg.market_data.scope.clone()));
    ExecutionSandbox::new(cfg.sandbox.clone(), cache)
}

pub fn controller(cfg: &AppConfig, provider: Arc<FixtureProvider>, observer: Option<ProgressObserver>) -> JobController {
    JobController::with_sandbox(cfg, sandbox(cfg, provider), observer)
}

pub fn request(source: &str, start: &str, end: &str, mode: JobMode) -> JobRequest {
    JobRequest {
        source_text: source.to_string(),
        start_date: date(start),
        end_date: date(end),
        mode,
    }
}
