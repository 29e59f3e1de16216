//! Market-data access.
//!
//! Providers answer one question: every instrument's daily bar for one
//! date. Fetch volume stays proportional to the number of days, never to
//! days × instruments. `BarCache` sits in front of a provider and keeps at
//! most one upstream request in flight per `(scope, date)`.

pub mod cache;
pub mod grouped;
pub mod synthetic;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{AppConfig, ProviderKind};

pub use cache::BarCache;
pub use grouped::GroupedDailyProvider;
pub use synthetic::SyntheticProvider;

/// One instrument's session bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub ticker: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub vwap: Option<f64>,
    pub transactions: Option<u64>,
}

/// Abstraction over batch-by-date market-data sources.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &'static str;

    /// All instruments' bars for `date`. Non-session days yield an empty
    /// list rather than an error.
    async fn grouped_daily(&self, date: NaiveDate) -> Result<Vec<DailyBar>>;
}

/// Build the provider selected in config.
pub fn build_provider(config: &AppConfig) -> Result<Arc<dyn MarketDataProvider>> {
    let md = &config.market_data;
    let provider: Arc<dyn MarketDataProvider> = match md.provider {
        ProviderKind::GroupedHttp => {
            let key = config.market_data_api_key()?;
            Arc::new(GroupedDailyProvider::new(&md.base_url, key)?)
        }
        ProviderKind::Synthetic => Arc::new(SyntheticProvider::new(md.synthetic_universe)),
    };
    Ok(provider)
}
