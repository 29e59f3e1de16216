//! Core engine: job lifecycle, progress and result normalisation.

pub mod controller;
pub mod normalizer;
pub mod progress;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::types::ExecutionJob;

pub use controller::{JobController, JobRequest, JobSummary};
pub use normalizer::ResultNormalizer;
pub use progress::{ProgressObserver, ProgressTracker};

/// One job behind its own lock. The driver task and the unit worker thread
/// both write through it.
pub type SharedJob = Arc<Mutex<ExecutionJob>>;

/// Lock a job, recovering the data if a writer panicked.
pub fn lock_job(job: &SharedJob) -> MutexGuard<'_, ExecutionJob> {
    job.lock().unwrap_or_else(PoisonError::into_inner)
}
