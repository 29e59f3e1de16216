//! Single-flight cache over a market-data provider.
//!
//! Entries are keyed by `(scope, date)`. Concurrent requests for the same
//! key share one upstream call; a failed fetch leaves the entry empty so
//! the next caller retries. Each entry remembers when it was last read so
//! idle days can be released.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::debug;

use super::{DailyBar, MarketDataProvider};

type Slot = Arc<OnceCell<Arc<Vec<DailyBar>>>>;

struct Entry {
    slot: Slot,
    last_used: DateTime<Utc>,
}

pub struct BarCache {
    provider: Arc<dyn MarketDataProvider>,
    scope: String,
    slots: Mutex<HashMap<(String, NaiveDate), Entry>>,
    upstream_calls: AtomicU64,
}

impl BarCache {
    pub fn new(provider: Arc<dyn MarketDataProvider>, scope: impl Into<String>) -> Self {
        Self {
            provider,
            scope: scope.into(),
            slots: Mutex::new(HashMap::new()),
            upstream_calls: AtomicU64::new(0),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Number of requests that actually reached the provider.
    pub fn upstream_calls(&self) -> u64 {
        self.upstream_calls.load(Ordering::Relaxed)
    }

    /// Dates currently held (filled or in flight).
    pub fn len(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, date: NaiveDate) -> Result<Slot> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| anyhow::anyhow!("bar cache lock poisoned"))?;
        let entry = slots.entry((self.scope.clone(), date)).or_insert_with(|| Entry {
            slot: Arc::new(OnceCell::new()),
            last_used: Utc::now(),
        });
        entry.last_used = Utc::now();
        Ok(Arc::clone(&entry.slot))
    }

    /// All bars for `date`, fetched at most once per key.
    pub async fn get(&self, date: NaiveDate) -> Result<Arc<Vec<DailyBar>>> {
        let slot = self.slot(date)?;
        let bars = slot
            .get_or_try_init(|| async {
                self.upstream_calls.fetch_add(1, Ordering::Relaxed);
                debug!(scope = %self.scope, %date, provider = self.provider.name(), "Cache miss");
                self.provider.grouped_daily(date).await.map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(bars))
    }

    /// Drop entries older than `cutoff`.
    pub fn evict_before(&self, cutoff: NaiveDate) -> usize {
        let Ok(mut slots) = self.slots.lock() else {
            return 0;
        };
        let before = slots.len();
        slots.retain(|(_, date), _| *date >= cutoff);
        before - slots.len()
    }

    /// Drop entries not read since `cutoff`.
    pub fn evict_idle(&self, cutoff: DateTime<Utc>) -> usize {
        let Ok(mut slots) = self.slots.lock() else {
            return 0;
        };
        let before = slots.len();
        slots.retain(|_, entry| entry.last_used >= cutoff);
        let evicted = before - slots.len();
        if evicted > 0 {
            debug!(scope = %self.scope, evicted, held = slots.len(), "Released idle days");
        }
        evicted
    }
}
