//! Per-job progress tracking.
//!
//! All progress writes for a job go through its lock and are clamped so
//! the visible percentage never decreases. Terminal jobs ignore updates.

use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::{lock_job, SharedJob};
use crate::runtime::sandbox::ProgressSink;

/// Optional listener for every applied update, e.g. for CLI output.
pub type ProgressObserver = Arc<dyn Fn(Uuid, u8, &str) + Send + Sync>;

#[derive(Clone)]
pub struct ProgressTracker {
    job: SharedJob,
    job_id: Uuid,
    observer: Option<ProgressObserver>,
}

impl ProgressTracker {
    pub fn new(job: SharedJob, observer: Option<ProgressObserver>) -> Self {
        let job_id = lock_job(&job).job_id;
        Self { job, job_id, observer }
    }

    /// Apply an update; returns the percentage now visible, or `None` if
    /// the job is already terminal.
    pub fn set(&self, percent: u8, message: &str) -> Option<u8> {
        let applied = {
            let mut job = lock_job(&self.job);
            if job.status.is_terminal() {
                return None;
            }
            job.progress_percent = job.progress_percent.max(percent.min(100));
            job.message = message.to_string();
            job.progress_percent
        };
        debug!(job_id = %self.job_id, percent = applied, message, "Progress");
        if let Some(observer) = &self.observer {
            observer(self.job_id, applied, message);
        }
        Some(applied)
    }

    /// A sink that maps 0..=100 into slice `index` of `count` equal slices
    /// of `[lo, hi]`.
    pub fn slice(&self, index: usize, count: usize, lo: u8, hi: u8) -> SliceProgress {
        let count = count.max(1) as f64;
        let width = f64::from(hi.saturating_sub(lo)) / count;
        SliceProgress {
            tracker: self.clone(),
            base: f64::from(lo) + width * index as f64,
            width,
        }
    }
}

/// Progress sink for one unit of a multi-unit job.
pub struct SliceProgress {
    tracker: ProgressTracker,
    base: f64,
    width: f64,
}

impl ProgressSink for SliceProgress {
    fn report(&self, percent: u8, message: &str) {
        let mapped = self.base + self.width * f64::from(percent.min(100)) / 100.0;
        self.tracker.set(mapped.floor() as u8, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DateRange, ExecutionJob, JobMode, JobStatus};
    use chrono::NaiveDate;
    use std::sync::Mutex;

    fn job() -> SharedJob {
        let d = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let mut job = ExecutionJob::new(DateRange::new(d, d).unwrap(), JobMode::Auto, "h".into());
        job.status = JobStatus::Running;
        Arc::new(Mutex::new(job))
    }

    #[test]
    fn test_progress_never_decreases() {
        let tracker = ProgressTracker::new(job(), None);
        assert_eq!(tracker.set(40, "a"), Some(40));
        assert_eq!(tracker.set(20, "b"), Some(40));
        assert_eq!(tracker.set(250, "c"), Some(100));
    }

    #[test]
    fn test_terminal_job_ignores_updates() {
        let shared = job();
        let tracker = ProgressTracker::new(Arc::clone(&shared), None);
        tracker.set(30, "running");
        lock_job(&shared).status = JobStatus::Failed;
        assert_eq!(tracker.set(90, "late"), None);
        assert_eq!(lock_job(&shared).progress_percent, 30);
    }

    #[test]
    fn test_slices_partition_the_range() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let observer: ProgressObserver = Arc::new(move |_: Uuid, p: u8, _: &str| sink_seen.lock().unwrap().push(p));
        let tracker = ProgressTracker::new(job(), Some(observer));

        let first = tracker.slice(0, 2, 10, 90);
        let second = tracker.slice(1, 2, 10, 90);
        first.report(0, "u1 start");
        first.report(100, "u1 done");
        second.report(0, "u2 start");
        second.report(100, "u2 done");
        assert_eq!(*seen.lock().unwrap(), vec![10, 50, 50, 90]);
    }
}
