//! Deterministic synthetic market data.
//!
//! Generates a fixed universe of instruments with reproducible bars: the
//! same `(ticker, date)` always hashes to the same prices. Used for offline
//! runs and tests; no network access.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{DailyBar, MarketDataProvider};
use crate::types::is_weekday;

pub struct SyntheticProvider {
    tickers: Vec<String>,
    calls: AtomicU64,
}

impl SyntheticProvider {
    pub fn new(universe: usize) -> Self {
        let tickers = (0..universe).map(|i| format!("SYN{i:04}")).collect();
        Self {
            tickers,
            calls: AtomicU64::new(0),
        }
    }

    /// Requests served so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn universe(&self) -> usize {
        self.tickers.len()
    }

    /// Uniform value in [0, 1) derived from the inputs.
    fn unit(parts: &[&str]) -> f64 {
        let mut hasher = Sha256::new();
        for p in parts {
            hasher.update(p.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Bar for one instrument on one session date.
    pub fn bar(ticker: &str, date: NaiveDate) -> DailyBar {
        let day = date.format("%Y-%m-%d").to_string();
        let base = 5.0 + 195.0 * Self::unit(&[ticker, "base"]);
        let drift = 0.8 + 0.4 * Self::unit(&[ticker, &day, "close"]);
        let close = round2(base * drift);
        // Opens gap up to ±12% away from the close.
        let gap = (Self::unit(&[ticker, &day, "open"]) - 0.5) * 0.24;
        let open = round2(close * (1.0 + gap));
        let spread = 0.03 * Self::unit(&[ticker, &day, "range"]);
        let high = round2(open.max(close) * (1.0 + spread));
        let low = round2(open.min(close) * (1.0 - spread));
        let volume = (50_000.0 + 9_950_000.0 * Self::unit(&[ticker, &day, "volume"])).round();
        DailyBar {
            ticker: ticker.to_string(),
            date,
            open,
            high,
            low,
            close,
            volume,
            vwap: Some(round2((open + high + low + close) / 4.0)),
            transactions: Some((volume / 120.0) as u64),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[async_trait]
impl MarketDataProvider for SyntheticProvider {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    async fn grouped_daily(&self, date: NaiveDate) -> Result<Vec<DailyBar>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !is_weekday(date) {
            return Ok(Vec::new());
        }
        Ok(self.tickers.iter().map(|t| Self::bar(t, date)).collect())
    }
}
