//! Execution sandbox.
//!
//! Runs one compiled unit over a date range and hands back its raw output.
//! Every invocation ends in exactly one of: rows, `SandboxError::Timeout`
//! or `SandboxError::Runtime`; panics in the unit driver are caught here.
//!
//! Loop-context rule: the unit driver is always driven by a runtime that
//! the sandbox creates for it. When the calling thread has no runtime, a
//! fresh current-thread runtime is built on that thread. When it already
//! has one, the driver moves to a dedicated worker thread with its own
//! runtime and the caller waits on a channel. `FreeThread` can only be
//! obtained on a thread without a runtime, and `drive_here` requires one,
//! so a runtime is never blocked on from inside another.
//!
//! Ranges whose estimated working set (trading days × universe) exceeds
//! the row ceiling are split into sequential windows and merged on
//! `(ticker, date, pattern)`, later windows winning. Cached days behind the
//! next window's lookback are released as each window finishes.

use chrono::{Duration as ChronoDuration, NaiveDate};
use futures::stream::{self, StreamExt, TryStreamExt};
use indexmap::IndexMap;
use serde_json::{json, Map, Value as Json};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::compile::{CompiledUnit, EntryRef, OutputShape};
use super::expr::{Row, Value};
use super::{RawOutput, Table};
use crate::config::SandboxConfig;
use crate::data::{BarCache, DailyBar};
use crate::error::SandboxError;
use crate::types::DateRange;

/// Extra time the caller waits past the deadline before giving up on a
/// worker that never answered.
const WORKER_GRACE: Duration = Duration::from_secs(1);

/// Tickers processed between cancellation checks.
const YIELD_EVERY: usize = 256;

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Receives coarse progress milestones. Called from whichever thread
/// drives the unit.
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: u8, message: &str);
}

impl<F> ProgressSink for F
where
    F: Fn(u8, &str) + Send + Sync,
{
    fn report(&self, percent: u8, message: &str) {
        self(percent, message)
    }
}

/// Maps a window's 0..=100 milestones into its slice of the whole run.
#[derive(Clone)]
struct WindowProgress {
    sink: Arc<dyn ProgressSink>,
    base: f64,
    span: f64,
}

impl WindowProgress {
    fn report(&self, local: u8, message: &str) {
        let pct = self.base + self.span * f64::from(local.min(100)) / 100.0;
        self.sink.report(pct.floor() as u8, message);
    }
}

// ---------------------------------------------------------------------------
// Loop context
// ---------------------------------------------------------------------------

/// Proof that the current thread has no runtime.
pub struct FreeThread {
    _private: (),
}

enum LoopContext {
    Free(FreeThread),
    Occupied,
}

fn loop_context() -> LoopContext {
    match Handle::try_current() {
        Ok(_) => LoopContext::Occupied,
        Err(_) => LoopContext::Free(FreeThread { _private: () }),
    }
}

type WindowRows = Vec<Map<String, Json>>;
type WindowResult = Result<WindowRows, SandboxError>;

/// Everything the driver needs for one window, owned so it can move to a
/// worker thread.
struct WindowJob {
    unit: Arc<CompiledUnit>,
    range: DateRange,
    cache: Arc<BarCache>,
    lookback_days: i64,
    fetch_concurrency: usize,
    progress: WindowProgress,
    cancel: Arc<AtomicBool>,
    timeout: Duration,
    total_timeout: Duration,
}

/// Drive a window on this thread with a fresh runtime.
fn drive_here(_proof: FreeThread, job: WindowJob) -> WindowResult {
    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| SandboxError::Runtime(format!("failed to build unit runtime: {e}")))?;

    let timeout = job.timeout;
    let total = job.total_timeout;
    let cancel = Arc::clone(&job.cancel);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        runtime.block_on(async move { tokio::time::timeout(timeout, drive_unit(job)).await })
    }));
    // Tears down anything the unit left running.
    runtime.shutdown_background();

    match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(_elapsed)) => {
            cancel.store(true, Ordering::SeqCst);
            Err(SandboxError::Timeout(total))
        }
        Err(payload) => Err(SandboxError::Runtime(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic in unit driver".to_string()
    }
}

/// Start `job` on a dedicated thread; `reply` receives the outcome.
fn spawn_worker(job: WindowJob, reply: Box<dyn FnOnce(WindowResult) + Send>) -> Result<(), SandboxError> {
    std::thread::Builder::new()
        .name("scanlab-unit".to_string())
        .spawn(move || {
            let outcome = match loop_context() {
                LoopContext::Free(proof) => drive_here(proof, job),
                LoopContext::Occupied => {
                    error!("Fresh unit worker thread already has a runtime");
                    Err(SandboxError::EventLoopConflict(
                        "worker thread started inside a runtime".to_string(),
                    ))
                }
            };
            reply(outcome);
        })
        .map(|_| ())
        .map_err(|e| SandboxError::Runtime(format!("failed to start unit worker: {e}")))
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

pub struct ExecutionSandbox {
    config: SandboxConfig,
    timeout: Duration,
    cache: Arc<BarCache>,
}

impl ExecutionSandbox {
    pub fn new(config: SandboxConfig, cache: Arc<BarCache>) -> Self {
        let timeout = config.timeout();
        Self { config, timeout, cache }
    }

    /// Override the configured wall-clock bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn cache(&self) -> &Arc<BarCache> {
        &self.cache
    }

    /// Working-set estimate: trading days × instrument universe.
    pub fn estimate_rows(&self, range: DateRange) -> u64 {
        range.trading_day_count() as u64 * self.config.universe_size
    }

    /// Sequential windows to run `range` in.
    pub fn plan(&self, range: DateRange) -> Vec<DateRange> {
        let estimate = self.estimate_rows(range);
        if estimate <= self.config.row_ceiling {
            return vec![range];
        }
        let max_days = (self.config.row_ceiling / self.config.universe_size.max(1)).max(1) as i64;
        let windows = range.split(max_days);
        info!(
            %range,
            estimate,
            ceiling = self.config.row_ceiling,
            windows = windows.len(),
            "Chunking date range"
        );
        windows
    }

    fn window_job(
        &self,
        unit: &Arc<CompiledUnit>,
        window: DateRange,
        index: usize,
        count: usize,
        progress: &Arc<dyn ProgressSink>,
        remaining: Duration,
        cancel: &Arc<AtomicBool>,
    ) -> WindowJob {
        // Windows share the first 99%; the final 100 is reported once.
        let span = 99.0 / count as f64;
        WindowJob {
            unit: Arc::clone(unit),
            range: window,
            cache: Arc::clone(&self.cache),
            lookback_days: self.config.lookback_days,
            fetch_concurrency: self.config.fetch_concurrency.max(1),
            progress: WindowProgress {
                sink: Arc::clone(progress),
                base: span * index as f64,
                span,
            },
            cancel: Arc::clone(cancel),
            timeout: remaining,
            total_timeout: self.timeout,
        }
    }

    /// Run `unit` over `range` from async code. The driver always runs on
    /// its own runtime; this future only waits for it.
    pub async fn execute(
        &self,
        unit: Arc<CompiledUnit>,
        range: DateRange,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<RawOutput, SandboxError> {
        let deadline = Instant::now() + self.timeout;
        let windows = self.plan(range);
        let cancel = Arc::new(AtomicBool::new(false));
        let mut merged = IndexMap::new();

        for (i, window) in windows.iter().enumerate() {
            let remaining = self.remaining(deadline, &cancel)?;
            let job = self.window_job(&unit, *window, i, windows.len(), &progress, remaining, &cancel);

            let rows = match loop_context() {
                LoopContext::Occupied => {
                    debug!(window = %window, "Caller has a runtime; using worker thread");
                    let (tx, rx) = oneshot::channel();
                    spawn_worker(job, Box::new(move |r| drop(tx.send(r))))?;
                    match tokio::time::timeout(remaining + WORKER_GRACE, rx).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(_)) => Err(SandboxError::Runtime("unit worker exited without a result".to_string())),
                        Err(_) => {
                            cancel.store(true, Ordering::SeqCst);
                            Err(SandboxError::Timeout(self.timeout))
                        }
                    }
                }
                LoopContext::Free(proof) => {
                    debug!(window = %window, "No runtime on caller; driving in place");
                    drive_here(proof, job)
                }
            };
            self.finish_window(&mut merged, rows, i, windows.len())?;
            self.release_window(&windows, i);
        }

        progress.report(100, "Execution complete");
        Ok(shape_output(&unit, merged.into_values().collect()))
    }

    /// Run `unit` over `range` from synchronous code on any thread.
    pub fn execute_blocking(
        &self,
        unit: Arc<CompiledUnit>,
        range: DateRange,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<RawOutput, SandboxError> {
        let deadline = Instant::now() + self.timeout;
        let windows = self.plan(range);
        let cancel = Arc::new(AtomicBool::new(false));
        let mut merged = IndexMap::new();

        for (i, window) in windows.iter().enumerate() {
            let remaining = self.remaining(deadline, &cancel)?;
            let job = self.window_job(&unit, *window, i, windows.len(), &progress, remaining, &cancel);

            let rows = match loop_context() {
                LoopContext::Free(proof) => {
                    debug!(window = %window, "No runtime on caller; driving in place");
                    drive_here(proof, job)
                }
                LoopContext::Occupied => {
                    debug!(window = %window, "Caller has a runtime; using worker thread");
                    let (tx, rx) = mpsc::channel();
                    spawn_worker(job, Box::new(move |r| drop(tx.send(r))))?;
                    match rx.recv_timeout(remaining + WORKER_GRACE) {
                        Ok(result) => result,
                        Err(mpsc::RecvTimeoutError::Disconnected) => {
                            Err(SandboxError::Runtime("unit worker exited without a result".to_string()))
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            cancel.store(true, Ordering::SeqCst);
                            Err(SandboxError::Timeout(self.timeout))
                        }
                    }
                }
            };
            self.finish_window(&mut merged, rows, i, windows.len())?;
            self.release_window(&windows, i);
        }

        progress.report(100, "Execution complete");
        Ok(shape_output(&unit, merged.into_values().collect()))
    }

    fn remaining(&self, deadline: Instant, cancel: &AtomicBool) -> Result<Duration, SandboxError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            cancel.store(true, Ordering::SeqCst);
            return Err(SandboxError::Timeout(self.timeout));
        }
        Ok(remaining)
    }

    fn finish_window(
        &self,
        merged: &mut IndexMap<(String, String, String), Map<String, Json>>,
        rows: WindowResult,
        index: usize,
        count: usize,
    ) -> Result<(), SandboxError> {
        let rows = match rows {
            Ok(rows) => rows,
            Err(err) => {
                if let SandboxError::Timeout(t) = &err {
                    warn!(timeout = ?t, window = index + 1, windows = count, "Unit timed out");
                }
                return Err(err);
            }
        };
        let emitted = rows.len();
        for row in rows {
            merged.insert(row_key(&row), row);
        }
        debug!(window = index + 1, windows = count, emitted, merged = merged.len(), "Window finished");
        Ok(())
    }

    /// Release cached days the following window no longer needs, keeping
    /// its lookback.
    fn release_window(&self, windows: &[DateRange], index: usize) {
        let Some(next) = windows.get(index + 1) else {
            return;
        };
        let cutoff = next.start - ChronoDuration::days(self.config.lookback_days.max(0));
        let released = self.cache.evict_before(cutoff);
        debug!(window = index + 1, %cutoff, released, held = self.cache.len(), "Released window data");
    }
}

fn row_key(row: &Map<String, Json>) -> (String, String, String) {
    let field = |k: &str| row.get(k).and_then(Json::as_str).unwrap_or_default().to_string();
    (field("ticker"), field("date"), field("pattern"))
}

// ---------------------------------------------------------------------------
// Unit driver
// ---------------------------------------------------------------------------

/// Builtin columns for one session, with D-1 values from `prev`.
pub fn session_row(bar: &DailyBar, prev: Option<&DailyBar>) -> Row {
    let mut row = Row::new();
    row.insert("ticker".to_string(), Value::Str(bar.ticker.clone()));
    row.insert("date".to_string(), Value::Str(bar.date.format("%Y-%m-%d").to_string()));
    row.insert("open".to_string(), Value::num(bar.open));
    row.insert("high".to_string(), Value::num(bar.high));
    row.insert("low".to_string(), Value::num(bar.low));
    row.insert("close".to_string(), Value::num(bar.close));
    row.insert("volume".to_string(), Value::num(bar.volume));
    row.insert("vwap".to_string(), bar.vwap.map_or(Value::Null, Value::num));
    row.insert(
        "transactions".to_string(),
        bar.transactions.map_or(Value::Null, |n| Value::num(n as f64)),
    );
    row.insert("dollar_volume".to_string(), Value::num(bar.close * bar.volume));
    row.insert("range_pct".to_string(), pct(bar.high - bar.low, bar.open));

    let prev_value = |f: fn(&DailyBar) -> f64| prev.map_or(Value::Null, |p| Value::num(f(p)));
    row.insert("prev_open".to_string(), prev_value(|b| b.open));
    row.insert("prev_high".to_string(), prev_value(|b| b.high));
    row.insert("prev_low".to_string(), prev_value(|b| b.low));
    row.insert("prev_close".to_string(), prev_value(|b| b.close));
    row.insert("prev_volume".to_string(), prev_value(|b| b.volume));
    match prev {
        Some(p) => {
            row.insert("gap_pct".to_string(), pct(bar.open - p.close, p.close));
            row.insert("change_pct".to_string(), pct(bar.close - p.close, p.close));
        }
        None => {
            row.insert("gap_pct".to_string(), Value::Null);
            row.insert("change_pct".to_string(), Value::Null);
        }
    }
    row
}

fn pct(delta: f64, base: f64) -> Value {
    if base == 0.0 {
        Value::Null
    } else {
        Value::num(delta / base * 100.0)
    }
}

/// Fetch the window (plus lookback), evaluate every row and emit the rows
/// whose selected pattern columns fired inside the window.
async fn drive_unit(job: WindowJob) -> WindowResult {
    let WindowJob {
        unit,
        range,
        cache,
        lookback_days,
        fetch_concurrency,
        progress,
        cancel,
        ..
    } = job;

    let fetch_range = DateRange {
        start: range.start - ChronoDuration::days(lookback_days.max(0)),
        end: range.end,
    };
    let dates = fetch_range.weekdays();
    progress.report(5, "Fetching market data");
    debug!(entry = unit.entry_name(), %range, sessions = dates.len(), "Unit driver started");

    let days: Vec<Arc<Vec<DailyBar>>> = stream::iter(dates)
        .map(|date| {
            let cache = Arc::clone(&cache);
            async move { cache.get(date).await }
        })
        .buffered(fetch_concurrency)
        .try_collect()
        .await
        .map_err(|e| SandboxError::Runtime(format!("market data fetch failed: {e:#}")))?;

    if cancel.load(Ordering::SeqCst) {
        return Err(SandboxError::Runtime("cancelled".to_string()));
    }
    progress.report(40, &format!("Fetched {} sessions", days.len()));

    // Per-ticker series in date order; `days` is already sorted.
    let mut series: BTreeMap<&str, Vec<&DailyBar>> = BTreeMap::new();
    for day in &days {
        for bar in day.iter() {
            series.entry(bar.ticker.as_str()).or_default().push(bar);
        }
    }

    progress.report(45, "Running detection");
    let pattern_columns: Vec<&str> = unit.pattern_names();
    let mut out = Vec::new();
    for (n, (_, bars)) in series.iter().enumerate() {
        if n % YIELD_EVERY == YIELD_EVERY - 1 {
            if cancel.load(Ordering::SeqCst) {
                return Err(SandboxError::Runtime("cancelled".to_string()));
            }
            tokio::task::yield_now().await;
        }
        let mut prev_bar: Option<&DailyBar> = None;
        let mut prev_row: Option<Row> = None;
        for &bar in bars {
            let mut row = session_row(bar, prev_bar);
            let fired = unit
                .evaluate_row(&mut row, prev_row.as_ref())
                .map_err(|e| SandboxError::Runtime(format!("{e} (ticker {}, {})", bar.ticker, bar.date)))?;
            if range.contains(bar.date) {
                for pattern in fired {
                    out.push(emit(&row, bar.date, &pattern, &pattern_columns));
                }
            }
            prev_bar = Some(bar);
            prev_row = Some(row);
        }
    }

    progress.report(90, &format!("Detection complete, {} hits", out.len()));
    Ok(out)
}

fn emit(row: &Row, date: NaiveDate, pattern: &str, pattern_columns: &[&str]) -> Map<String, Json> {
    let mut m = Map::new();
    if let Some(Value::Str(t)) = row.get("ticker") {
        m.insert("ticker".to_string(), json!(t));
    }
    m.insert("date".to_string(), json!(date.format("%Y-%m-%d").to_string()));
    m.insert("pattern".to_string(), json!(pattern));
    let mut metrics: Vec<(&String, f64)> = row
        .iter()
        .filter(|(k, _)| !pattern_columns.contains(&k.as_str()))
        .filter_map(|(k, v)| match v {
            Value::Num(x) => Some((k, *x)),
            _ => None,
        })
        .collect();
    metrics.sort_by(|a, b| a.0.cmp(b.0));
    for (k, v) in metrics {
        m.insert(k.clone(), json!(v));
    }
    m
}

/// Package merged rows the way the unit's entry point returns them.
fn shape_output(unit: &CompiledUnit, rows: WindowRows) -> RawOutput {
    if let EntryRef::LegacyGlobal(name) = &unit.entry {
        return RawOutput::Container(json!({ name.as_str(): rows }));
    }
    match &unit.shape {
        OutputShape::Table => RawOutput::Table(to_table(rows)),
        OutputShape::Records => RawOutput::Records(rows),
        OutputShape::Stream => RawOutput::Stream(Box::new(rows.into_iter())),
        OutputShape::Container(key) => RawOutput::Container(json!({ key.as_str(): rows })),
    }
}

fn to_table(rows: WindowRows) -> Table {
    let mut columns: Vec<String> = vec!["ticker".into(), "date".into(), "pattern".into()];
    for row in &rows {
        for key in row.keys() {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
    }
    let rows = rows
        .into_iter()
        .map(|row| columns.iter().map(|c| row.get(c).cloned().unwrap_or(Json::Null)).collect())
        .collect();
    Table { columns, rows }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MockMarketDataProvider, SyntheticProvider};
    use crate::runtime::compile::{compile, CompileOptions};
    use std::sync::Mutex;

    const GAP_SCAN: &str = "async def run_scan(start_date, end_date):\n    df = await fetch(start_date, end_date)\n    df['gap_up'] = (df['gap_pct'] > 8).astype(int)\n    return df[df['gap_up'] == 1]\n";

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn range(start: NaiveDate, end: NaiveDate) -> DateRange {
        DateRange::new(start, end).unwrap()
    }

    fn unit(src: &str) -> Arc<CompiledUnit> {
        Arc::new(compile(src, &CompileOptions::default()).unwrap())
    }

    fn sandbox(universe: usize, config: SandboxConfig) -> ExecutionSandbox {
        let cache = Arc::new(BarCache::new(Arc::new(SyntheticProvider::new(universe)), "test"));
        ExecutionSandbox::new(config, cache)
    }

    fn rows(output: RawOutput) -> Vec<(String, String)> {
        let table = match output {
            RawOutput::Table(table) => table,
            other => panic!("expected table, got {other:?}"),
        };
        let mut keys: Vec<(String, String)> = table
            .rows
            .iter()
            .map(|r| (r[0].as_str().unwrap().to_string(), r[1].as_str().unwrap().to_string()))
            .collect();
        keys.sort();
        keys
    }

    fn recorder() -> (Arc<Mutex<Vec<u8>>>, Arc<dyn ProgressSink>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: Arc<dyn ProgressSink> = Arc::new(move |p: u8, _: &str| sink_seen.lock().unwrap().push(p));
        (seen, sink)
    }

    fn noop() -> Arc<dyn ProgressSink> {
        Arc::new(|_: u8, _: &str| {})
    }

    // -- Rows --------------------------------------------------------------

    #[test]
    fn test_session_row_derives_d1_columns() {
        let prev = SyntheticProvider::bar("AAA", d(2024, 3, 4));
        let bar = SyntheticProvider::bar("AAA", d(2024, 3, 5));
        let row = session_row(&bar, Some(&prev));
        let gap = row["gap_pct"].as_f64().unwrap();
        assert!((gap - (bar.open / prev.close - 1.0) * 100.0).abs() < 1e-9);
        assert_eq!(row["prev_close"], Value::Num(prev.close));

        let first = session_row(&prev, None);
        assert_eq!(first["gap_pct"], Value::Null);
        assert_eq!(first["prev_close"], Value::Null);
    }

    // -- Loop context --------------------------------------------------------

    #[test]
    fn test_no_runtime_drives_in_place() {
        let sb = sandbox(50, SandboxConfig::default());
        let out = sb
            .execute_blocking(unit(GAP_SCAN), range(d(2024, 3, 4), d(2024, 3, 15)), noop())
            .unwrap();
        assert!(!rows(out).is_empty());
    }

    #[test]
    fn test_same_results_with_and_without_caller_runtime() {
        let r = range(d(2024, 3, 4), d(2024, 3, 15));
        let free = rows(sandbox(50, SandboxConfig::default()).execute_blocking(unit(GAP_SCAN), r, noop()).unwrap());

        let host = tokio::runtime::Runtime::new().unwrap();
        let from_blocking = host.block_on(async {
            sandbox(50, SandboxConfig::default()).execute_blocking(unit(GAP_SCAN), r, noop())
        });
        let from_async = host.block_on(async {
            sandbox(50, SandboxConfig::default()).execute(unit(GAP_SCAN), r, noop()).await
        });

        assert_eq!(free, rows(from_blocking.unwrap()));
        assert_eq!(free, rows(from_async.unwrap()));
    }

    #[tokio::test]
    async fn test_async_execute_inside_current_thread_runtime() {
        let sb = sandbox(50, SandboxConfig::default());
        let out = sb.execute(unit(GAP_SCAN), range(d(2024, 3, 4), d(2024, 3, 8)), noop()).await;
        assert!(out.is_ok());
    }

    // -- Timeout -------------------------------------------------------------

    #[tokio::test]
    async fn test_timeout_is_distinct_outcome() {
        let mut mock = MockMarketDataProvider::new();
        mock.expect_name().return_const("slow");
        mock.expect_grouped_daily().returning(|_| {
            std::thread::sleep(Duration::from_millis(400));
            Ok(Vec::new())
        });
        let cache = Arc::new(BarCache::new(Arc::new(mock), "test"));
        let config = SandboxConfig {
            fetch_concurrency: 1,
            ..SandboxConfig::default()
        };
        let sb = ExecutionSandbox::new(config, cache).with_timeout(Duration::from_millis(200));

        let started = Instant::now();
        let err = sb
            .execute(unit(GAP_SCAN), range(d(2024, 3, 4), d(2024, 3, 29)), noop())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_runtime_error_is_captured() {
        let src = "def main():\n    df['hit'] = (df['missing_col'] > 1).astype(int)\n    return df\n";
        let err = sandbox(5, SandboxConfig::default())
            .execute_blocking(unit(src), range(d(2024, 3, 4), d(2024, 3, 5)), noop())
            .unwrap_err();
        match err {
            SandboxError::Runtime(msg) => assert!(msg.contains("missing_col"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_fetch_failure_is_runtime_error() {
        let mut mock = MockMarketDataProvider::new();
        mock.expect_name().return_const("broken");
        mock.expect_grouped_daily().returning(|_| Err(anyhow::anyhow!("HTTP 500")));
        let sb = ExecutionSandbox::new(SandboxConfig::default(), Arc::new(BarCache::new(Arc::new(mock), "test")));
        let err = sb
            .execute_blocking(unit(GAP_SCAN), range(d(2024, 3, 4), d(2024, 3, 5)), noop())
            .unwrap_err();
        assert!(matches!(err, SandboxError::Runtime(ref m) if m.contains("HTTP 500")), "{err:?}");
    }

    // -- Chunking ------------------------------------------------------------

    #[test]
    fn test_plan_splits_when_over_ceiling() {
        let config = SandboxConfig {
            row_ceiling: 5_000_000,
            universe_size: 10_000,
            ..SandboxConfig::default()
        };
        let sb = sandbox(10, config);
        let three_years = range(d(2021, 1, 1), d(2023, 12, 31));
        assert!(sb.estimate_rows(three_years) > 5_000_000);
        let windows = sb.plan(three_years);
        assert!(windows.len() > 1);
        assert_eq!(windows.first().unwrap().start, three_years.start);
        assert_eq!(windows.last().unwrap().end, three_years.end);
        for w in &windows {
            assert!(sb.estimate_rows(*w) <= 5_000_000);
        }
        assert_eq!(sb.plan(range(d(2023, 1, 2), d(2023, 1, 31))).len(), 1);
    }

    #[test]
    fn test_chunked_equals_unchunked() {
        let r = range(d(2024, 1, 1), d(2024, 3, 29));
        let whole = sandbox(40, SandboxConfig { universe_size: 40, ..SandboxConfig::default() });
        let chunked = sandbox(40, SandboxConfig { universe_size: 40, row_ceiling: 400, ..SandboxConfig::default() });
        assert!(chunked.plan(r).len() > 1);

        let a = rows(whole.execute_blocking(unit(GAP_SCAN), r, noop()).unwrap());
        let b = rows(chunked.execute_blocking(unit(GAP_SCAN), r, noop()).unwrap());
        assert!(!a.is_empty());
        assert_eq!(a, b);
        let mut dedup = b.clone();
        dedup.dedup();
        assert_eq!(dedup.len(), b.len());
    }

    #[test]
    fn test_chunked_run_holds_at_most_one_window_of_data() {
        let r = range(d(2024, 1, 1), d(2024, 6, 28));
        let config = SandboxConfig { universe_size: 40, row_ceiling: 400, ..SandboxConfig::default() };
        let lookback = ChronoDuration::days(config.lookback_days);
        let sb = sandbox(40, config);
        let windows = sb.plan(r);
        assert!(windows.len() > 2);

        sb.execute_blocking(unit(GAP_SCAN), r, noop()).unwrap();

        let last = windows[windows.len() - 1];
        let last_fetch = DateRange { start: last.start - lookback, end: last.end };
        assert!(sb.cache().len() <= last_fetch.weekdays().len(), "held {}", sb.cache().len());
        assert!(sb.cache().len() < r.trading_day_count());
    }

    // -- Progress ------------------------------------------------------------

    #[test]
    fn test_progress_is_monotonic_and_ends_at_100() {
        let (seen, sink) = recorder();
        let sb = sandbox(20, SandboxConfig { universe_size: 20, row_ceiling: 100, ..SandboxConfig::default() });
        sb.execute_blocking(unit(GAP_SCAN), range(d(2024, 3, 4), d(2024, 3, 29)), sink).unwrap();
        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
        assert_eq!(*seen.last().unwrap(), 100);
    }

    // -- Output shapes -------------------------------------------------------

    #[test]
    fn test_container_and_records_shapes() {
        let records = "def main(start_date, end_date):\n    df['gap_up'] = (df['gap_pct'] > 8).astype(int)\n    return df[df['gap_up'] == 1].to_dict('records')\n";
        let out = sandbox(30, SandboxConfig::default())
            .execute_blocking(unit(records), range(d(2024, 3, 4), d(2024, 3, 15)), noop())
            .unwrap();
        assert!(matches!(out, RawOutput::Records(_)));

        let container = "def main(start_date, end_date):\n    df['gap_up'] = (df['gap_pct'] > 8).astype(int)\n    return {\"signals\": df[df['gap_up'] == 1]}\n";
        let out = sandbox(30, SandboxConfig::default())
            .execute_blocking(unit(container), range(d(2024, 3, 4), d(2024, 3, 15)), noop())
            .unwrap();
        match out {
            RawOutput::Container(v) => assert!(v.get("signals").is_some()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
