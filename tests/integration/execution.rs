//! Jobs end-to-end: loop context, chunking, progress and failure states.

use chrono::NaiveDate;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

use scanlab::engine::{ProgressObserver, ResultNormalizer};
use scanlab::runtime::compile::{compile, CompileOptions};
use scanlab::runtime::sandbox::{ExecutionSandbox, ProgressSink};
use scanlab::types::{DateRange, JobMode, JobStatus, ResultRecord};

use crate::fixture::{self, date, FixtureProvider};

const ASYNC_MAIN: &str = "async def main(start_date, end_date):\n    df = await fetch_grouped_daily(start_date, end_date)\n    df['gap_up'] = (df['gap_pct'] > 8).astype(int)\n    return df[df['gap_up'] == 1]\n";

const TWO_GAPS: &str = "GAP_MIN = 8\n\ndef main(start_date, end_date):\n    df['gap_up'] = (df['gap_pct'] > GAP_MIN).astype(int)\n    df['gap_down'] = (df['gap_pct'] < -GAP_MIN).astype(int)\n    return df[(df['gap_up'] == 1) | (df['gap_down'] == 1)]\n";

type Key = (String, NaiveDate);

fn keys(records: &[ResultRecord]) -> BTreeSet<Key> {
    records.iter().map(|r| (r.ticker.clone(), r.date)).collect()
}

fn expected(provider: &FixtureProvider, range: DateRange, up: bool) -> BTreeSet<Key> {
    range
        .weekdays()
        .into_iter()
        .flat_map(|d| provider.expected_gaps(d, up).into_iter().map(move |t| (t, d)))
        .collect()
}

fn noop() -> Arc<dyn ProgressSink> {
    Arc::new(|_: u8, _: &str| {})
}

/// Run `source` directly on the calling thread, which has no runtime.
fn reference_run(sandbox: &ExecutionSandbox, source: &str, range: DateRange) -> Vec<ResultRecord> {
    let unit = Arc::new(compile(source, &CompileOptions::default()).unwrap());
    let raw = sandbox.execute_blocking(unit, range, noop()).unwrap();
    ResultNormalizer::new().normalize(raw)
}

fn recording_observer() -> (Arc<Mutex<HashMap<Uuid, Vec<u8>>>>, ProgressObserver) {
    let seen: Arc<Mutex<HashMap<Uuid, Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));
    let sink = Arc::clone(&seen);
    let observer: ProgressObserver = Arc::new(move |id: Uuid, p: u8, _: &str| {
        sink.lock().unwrap().entry(id).or_default().push(p);
    });
    (seen, observer)
}

// ---------------------------------------------------------------------------
// Loop context
// ---------------------------------------------------------------------------

#[test]
fn test_async_main_inside_running_loop_matches_fresh_run() {
    let provider = Arc::new(FixtureProvider::new(12));
    let cfg = fixture::config(12);
    let range = DateRange::new(date("2024-03-04"), date("2024-03-29")).unwrap();

    let fresh = reference_run(&fixture::sandbox(&cfg, Arc::clone(&provider)), ASYNC_MAIN, range);

    let host = tokio::runtime::Runtime::new().unwrap();
    let controller = fixture::controller(&cfg, Arc::clone(&provider), None);
    let view = host
        .block_on(controller.run(fixture::request(ASYNC_MAIN, "2024-03-04", "2024-03-29", JobMode::Auto)))
        .unwrap();

    assert_eq!(view.status, JobStatus::Completed, "{:?}", view.error);
    let results = view.results.unwrap();
    assert!(!results.is_empty());
    assert_eq!(keys(&results), keys(&fresh));
    assert_eq!(keys(&results), expected(&provider, range, true));
}

#[tokio::test]
async fn test_jobs_complete_on_a_current_thread_host() {
    let provider = Arc::new(FixtureProvider::new(8));
    let controller = fixture::controller(&fixture::config(8), provider, None);
    let view = controller
        .run(fixture::request(ASYNC_MAIN, "2024-03-04", "2024-03-08", JobMode::Single))
        .await
        .unwrap();
    assert_eq!(view.status, JobStatus::Completed, "{:?}", view.error);
}

// ---------------------------------------------------------------------------
// Multi-pattern jobs
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_auto_mode_runs_each_pattern_unit() {
    let provider = Arc::new(FixtureProvider::new(12));
    let controller = fixture::controller(&fixture::config(12), Arc::clone(&provider), None);
    let range = DateRange::new(date("2024-03-04"), date("2024-03-15")).unwrap();

    let view = controller
        .run(fixture::request(TWO_GAPS, "2024-03-04", "2024-03-15", JobMode::Auto))
        .await
        .unwrap();
    assert_eq!(view.status, JobStatus::Completed, "{:?}", view.error);
    assert_eq!(view.analysis.as_ref().unwrap().units.len(), 2);

    let results = view.results.unwrap();
    let by_pattern = |name: &str| -> Vec<ResultRecord> {
        results
            .iter()
            .filter(|r| r.pattern_name.as_deref() == Some(name))
            .cloned()
            .collect()
    };
    assert_eq!(keys(&by_pattern("gap_up")), expected(&provider, range, true));
    assert_eq!(keys(&by_pattern("gap_down")), expected(&provider, range, false));
    assert!(results.iter().all(|r| r.pattern_name.is_some()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fetch_volume_is_per_day_across_units_and_jobs() {
    let provider = Arc::new(FixtureProvider::new(25));
    let controller = fixture::controller(&fixture::config(25), Arc::clone(&provider), None);

    let ids: Vec<Uuid> = (0..3)
        .map(|_| {
            controller
                .submit(fixture::request(TWO_GAPS, "2024-03-04", "2024-03-15", JobMode::Auto))
                .unwrap()
        })
        .collect();
    for id in ids {
        let view = controller.wait(id, Duration::from_millis(10)).await.unwrap();
        assert_eq!(view.status, JobStatus::Completed, "{:?}", view.error);
    }

    // Weekdays from 2024-02-28 (five days of lookback) to 2024-03-15.
    assert!(provider.calls() <= 13, "calls = {}", provider.calls());
    assert!(provider.calls() > 0);
}

// ---------------------------------------------------------------------------
// Chunking
// ---------------------------------------------------------------------------

#[test]
fn test_three_year_range_chunks_and_matches_manual_merge() {
    let provider = Arc::new(FixtureProvider::new(6));
    let mut cfg = fixture::config(6);
    cfg.sandbox.universe_size = 10_000;
    cfg.sandbox.row_ceiling = 5_000_000;
    let range = DateRange::new(date("2021-01-01"), date("2023-12-31")).unwrap();

    let chunking = fixture::sandbox(&cfg, Arc::clone(&provider));
    assert!(chunking.estimate_rows(range) > 5_000_000);
    let windows = chunking.plan(range);
    assert!(windows.len() > 1);

    let mut whole_cfg = cfg.clone();
    whole_cfg.sandbox.row_ceiling = u64::MAX;
    let whole = fixture::sandbox(&whole_cfg, Arc::clone(&provider));
    assert_eq!(whole.plan(range).len(), 1);

    let normalizer = ResultNormalizer::new();
    let manual = normalizer.dedup(windows.iter().flat_map(|w| reference_run(&whole, ASYNC_MAIN, *w)));
    let unchunked = reference_run(&whole, ASYNC_MAIN, range);

    let host = tokio::runtime::Runtime::new().unwrap();
    let controller = fixture::controller(&cfg, Arc::clone(&provider), None);
    let view = host
        .block_on(controller.run(fixture::request(ASYNC_MAIN, "2021-01-01", "2023-12-31", JobMode::Auto)))
        .unwrap();
    assert_eq!(view.status, JobStatus::Completed, "{:?}", view.error);
    let results = view.results.unwrap();

    assert!(!results.is_empty());
    assert_eq!(keys(&results).len(), results.len(), "duplicate keys in merged output");
    assert_eq!(keys(&results), keys(&manual));
    assert_eq!(keys(&results), keys(&unchunked));
    assert_eq!(keys(&results), expected(&provider, range, true));
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_progress_sequences_are_monotonic_and_end_at_100() {
    let provider = Arc::new(FixtureProvider::new(10));
    let mut cfg = fixture::config(10);
    cfg.sandbox.row_ceiling = 100;
    let (seen, observer) = recording_observer();
    let controller = fixture::controller(&cfg, provider, Some(observer));

    let a = controller
        .submit(fixture::request(TWO_GAPS, "2024-01-02", "2024-02-29", JobMode::Auto))
        .unwrap();
    let b = controller
        .submit(fixture::request(ASYNC_MAIN, "2024-01-02", "2024-02-29", JobMode::Single))
        .unwrap();
    for id in [a, b] {
        let view = controller.wait(id, Duration::from_millis(10)).await.unwrap();
        assert_eq!(view.status, JobStatus::Completed, "{:?}", view.error);
        assert_eq!(view.progress_percent, 100);
    }

    let seen = seen.lock().unwrap();
    for id in [a, b] {
        let sequence = &seen[&id];
        assert!(sequence.windows(2).all(|w| w[0] <= w[1]), "{sequence:?}");
        assert_eq!(*sequence.last().unwrap(), 100);
    }
}

// ---------------------------------------------------------------------------
// Failure states
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_provider_times_out() {
    let provider = Arc::new(FixtureProvider::slow(3, Duration::from_millis(300)));
    let mut cfg = fixture::config(3);
    cfg.sandbox.timeout_secs = 1;
    cfg.sandbox.fetch_concurrency = 1;
    let controller = fixture::controller(&cfg, provider, None);

    let started = Instant::now();
    let view = controller
        .run(fixture::request(ASYNC_MAIN, "2024-03-04", "2024-03-29", JobMode::Single))
        .await
        .unwrap();
    assert_eq!(view.status, JobStatus::TimedOut);
    assert!(view.results.is_none());
    assert!(view.error.unwrap().contains("timed out"));
    assert!(started.elapsed() < Duration::from_secs(6));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_provider_failure_fails_job_without_hurting_host() {
    let broken = Arc::new(FixtureProvider::new(3));
    broken.set_error("upstream 503");
    let controller = fixture::controller(&fixture::config(3), broken, None);
    let view = controller
        .run(fixture::request(ASYNC_MAIN, "2024-03-04", "2024-03-08", JobMode::Single))
        .await
        .unwrap();
    assert_eq!(view.status, JobStatus::Failed);
    assert!(view.error.unwrap().contains("upstream 503"));

    let healthy = fixture::controller(&fixture::config(3), Arc::new(FixtureProvider::new(3)), None);
    let view = healthy
        .run(fixture::request(ASYNC_MAIN, "2024-03-04", "2024-03-08", JobMode::Single))
        .await
        .unwrap();
    assert_eq!(view.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_unrecognised_source_warns_and_fails() {
    let controller = fixture::controller(&fixture::config(3), Arc::new(FixtureProvider::new(3)), None);
    let view = controller
        .run(fixture::request("threshold = 1\n", "2024-03-04", "2024-03-08", JobMode::Auto))
        .await
        .unwrap();
    assert_eq!(view.status, JobStatus::Failed);
    assert!(view.warnings.iter().any(|w| w.starts_with("Classification ambiguous")), "{:?}", view.warnings);
    assert!(view.error.is_some());
}
