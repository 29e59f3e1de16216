//! Job controller.
//!
//! Owns the job registry and drives each submitted job through analysis,
//! optional decomposition, sandboxed execution and normalisation. Jobs
//! run on the host runtime, at most `max_concurrent` at a time; each unit
//! inside a job runs through the sandbox sequentially.
//!
//! Lifecycle: `queued` → `running` → exactly one of `completed`, `failed`
//! or `timed_out`. Terminal jobs are frozen and evicted by `cleanup` once
//! older than the retention window.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::normalizer::ResultNormalizer;
use super::progress::{ProgressObserver, ProgressTracker};
use super::{lock_job, SharedJob};
use crate::analysis::{ParameterExtractor, PatternDecomposer, SourceClassifier};
use crate::config::AppConfig;
use crate::data::{BarCache, MarketDataProvider};
use crate::error::{EngineError, SandboxError};
use crate::runtime::compile::{compile, CompileOptions};
use crate::runtime::sandbox::{ExecutionSandbox, ProgressSink};
use crate::types::{
    DateRange, Decomposition, ExecutionJob, JobAnalysis, JobMode, JobStatus, JobStatusView,
    PatternKind, ResultRecord, ScannerSource, UnitSummary,
};

/// Progress band reserved for unit execution.
const EXEC_LO: u8 = 10;
const EXEC_HI: u8 = 95;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub source_text: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub mode: JobMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub mode: JobMode,
    pub result_count: usize,
    pub created_at: DateTime<Utc>,
}

/// Everything learned about a source before execution.
#[derive(Debug, Clone)]
pub struct SourceAnalysis {
    pub analysis: JobAnalysis,
    pub decomposition: Decomposition,
    pub warnings: Vec<String>,
}

/// One unit scheduled for execution. `label` overrides the pattern name
/// of every record it produces.
struct PlannedUnit {
    label: Option<String>,
    text: String,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct Inner {
    classifier: SourceClassifier,
    extractor: ParameterExtractor,
    decomposer: PatternDecomposer,
    compile_options: CompileOptions,
    sandbox: ExecutionSandbox,
    normalizer: ResultNormalizer,
    jobs: RwLock<HashMap<Uuid, SharedJob>>,
    permits: Arc<Semaphore>,
    retention: Duration,
    observer: Option<ProgressObserver>,
}

/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct JobController {
    inner: Arc<Inner>,
}

impl JobController {
    /// Controller backed by a fresh cache over `provider`.
    pub fn new(config: &AppConfig, provider: Arc<dyn MarketDataProvider>) -> Self {
        let cache = Arc::new(BarCache::new(provider, config.market_data.scope.clone()));
        let sandbox = ExecutionSandbox::new(config.sandbox.clone(), cache);
        Self::with_sandbox(config, sandbox, None)
    }

    pub fn with_sandbox(config: &AppConfig, sandbox: ExecutionSandbox, observer: Option<ProgressObserver>) -> Self {
        let compile_options = CompileOptions::from_config(&config.classifier);
        let extractor = ParameterExtractor::new(config.extraction.clone());
        let inner = Inner {
            classifier: SourceClassifier::new(config.classifier.clone()),
            decomposer: PatternDecomposer::new(extractor.clone(), compile_options.clone()),
            extractor,
            compile_options,
            sandbox,
            normalizer: ResultNormalizer::new(),
            jobs: RwLock::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(config.jobs.max_concurrent.max(1))),
            retention: Duration::from_secs(config.jobs.retention_secs),
            observer,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Classification, parameters and decomposition, without executing.
    pub fn analyze(&self, source: &ScannerSource) -> SourceAnalysis {
        self.inner.analyze(source)
    }

    /// Register a job and start driving it. Returns immediately.
    pub fn submit(&self, request: JobRequest) -> Result<Uuid, EngineError> {
        if request.source_text.trim().is_empty() {
            return Err(EngineError::InvalidRequest("source_text is empty".to_string()));
        }
        let range = DateRange::new(request.start_date, request.end_date)
            .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| EngineError::InvalidRequest("jobs can only be submitted from a runtime".to_string()))?;

        let source = ScannerSource::new(request.source_text);
        let job = ExecutionJob::new(range, request.mode, source.content_hash().to_string());
        let job_id = job.job_id;
        let shared: SharedJob = Arc::new(Mutex::new(job));
        self.inner
            .jobs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(job_id, Arc::clone(&shared));

        info!(job_id = %job_id, %range, bytes = source.byte_len(), "Job submitted");

        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            let driver = tokio::spawn(drive(Arc::clone(&inner), Arc::clone(&shared), source));
            if let Err(e) = driver.await {
                error!(job_id = %job_id, error = %e, "Job driver aborted");
                finish(&shared, JobStatus::Failed, "Internal error", Some(format!("job driver aborted: {e}")), Vec::new());
            }
        });
        Ok(job_id)
    }

    fn shared(&self, job_id: Uuid) -> Result<SharedJob, EngineError> {
        self.inner
            .jobs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&job_id)
            .cloned()
            .ok_or(EngineError::JobNotFound(job_id))
    }

    pub fn status(&self, job_id: Uuid) -> Result<JobStatusView, EngineError> {
        let shared = self.shared(job_id)?;
        let view = lock_job(&shared).view();
        Ok(view)
    }

    /// Full snapshot of a job, results included whatever its state.
    pub fn snapshot(&self, job_id: Uuid) -> Result<ExecutionJob, EngineError> {
        let shared = self.shared(job_id)?;
        let job = lock_job(&shared).clone();
        Ok(job)
    }

    pub fn list(&self) -> Vec<JobSummary> {
        let jobs = self.inner.jobs.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut out: Vec<JobSummary> = jobs
            .values()
            .map(|shared| {
                let job = lock_job(shared);
                JobSummary {
                    job_id: job.job_id,
                    status: job.status,
                    progress_percent: job.progress_percent,
                    mode: job.mode.clone(),
                    result_count: job.results.len(),
                    created_at: job.created_at,
                }
            })
            .collect();
        out.sort_by_key(|s| s.created_at);
        out
    }

    /// Poll until the job is terminal.
    pub async fn wait(&self, job_id: Uuid, poll: Duration) -> Result<JobStatusView, EngineError> {
        loop {
            let view = self.status(job_id)?;
            if view.status.is_terminal() {
                return Ok(view);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Submit and wait for the terminal state.
    pub async fn run(&self, request: JobRequest) -> Result<JobStatusView, EngineError> {
        let job_id = self.submit(request)?;
        self.wait(job_id, Duration::from_millis(20)).await
    }

    /// Evict terminal jobs that finished before `now - retention`, and cached
    /// days not read since then.
    pub fn cleanup(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.inner.retention).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = now - retention;
        let mut jobs = self.inner.jobs.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = jobs.len();
        jobs.retain(|_, shared| {
            let job = lock_job(shared);
            !(job.status.is_terminal() && job.finished_at.is_some_and(|t| t < cutoff))
        });
        let evicted = before - jobs.len();
        if evicted > 0 {
            info!(evicted, remaining = jobs.len(), "Evicted finished jobs");
        }
        drop(jobs);

        let released = self.inner.sandbox.cache().evict_idle(cutoff);
        if released > 0 {
            info!(released, held = self.inner.sandbox.cache().len(), "Released idle market data");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.inner.jobs.read().map(|j| j.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

impl Inner {
    fn analyze(&self, source: &ScannerSource) -> SourceAnalysis {
        let classification = self.classifier.classify(source);
        let parameters = self.extractor.extract(source, &classification);
        let decomposition = self.decomposer.decompose(source, &classification);

        let mut warnings = Vec::new();
        if classification.pattern_kind == PatternKind::Unknown {
            warnings.push(EngineError::ClassificationAmbiguous(classification.signals.join(", ")).to_string());
        }
        if parameters.is_empty() {
            warnings.push(EngineError::ParameterExtractionEmpty.to_string());
        }
        for failure in &decomposition.failures {
            warnings.push(
                EngineError::DecompositionSyntaxError {
                    unit: failure.name.clone(),
                    reason: failure.reason.clone(),
                }
                .to_string(),
            );
        }

        info!(
            kind = %classification.pattern_kind,
            confidence = classification.confidence,
            parameters = parameters.len(),
            units = decomposition.units.len(),
            failures = decomposition.failures.len(),
            "Source analysed"
        );

        let analysis = JobAnalysis {
            classification,
            parameters,
            units: decomposition
                .units
                .iter()
                .map(|u| UnitSummary {
                    name: u.name.clone(),
                    logic_expression: u.logic_expression.clone(),
                    parameters: u.parameters.clone(),
                })
                .collect(),
            failures: decomposition.failures.clone(),
        };
        SourceAnalysis {
            analysis,
            decomposition,
            warnings,
        }
    }

    /// Which units a job runs, per its mode.
    fn plan(&self, mode: &JobMode, source: &ScannerSource, analysed: &SourceAnalysis) -> Result<Vec<PlannedUnit>, String> {
        let whole = || PlannedUnit {
            label: None,
            text: source.text().to_string(),
        };
        let decomposition = &analysed.decomposition;
        match mode {
            JobMode::Analyze => Ok(Vec::new()),
            JobMode::Single => Ok(vec![whole()]),
            JobMode::Pattern(name) => {
                if let Some(unit) = decomposition.unit(name) {
                    return Ok(vec![PlannedUnit {
                        label: Some(unit.name.clone()),
                        text: unit.standalone_source.clone(),
                    }]);
                }
                match decomposition.failures.iter().find(|f| &f.name == name) {
                    Some(f) => Err(format!("pattern `{name}` failed to decompose: {}", f.reason)),
                    None => Err(format!("pattern `{name}` not found in source")),
                }
            }
            JobMode::Auto => {
                let kind = analysed.analysis.classification.pattern_kind;
                if kind != PatternKind::MultiPatternAssignments {
                    return Ok(vec![whole()]);
                }
                if decomposition.units.is_empty() {
                    let reasons: Vec<String> = decomposition
                        .failures
                        .iter()
                        .map(|f| format!("{}: {}", f.name, f.reason))
                        .collect();
                    if reasons.is_empty() {
                        return Ok(vec![whole()]);
                    }
                    return Err(format!("no pattern unit could be prepared ({})", reasons.join("; ")));
                }
                Ok(decomposition
                    .units
                    .iter()
                    .map(|u| PlannedUnit {
                        label: Some(u.name.clone()),
                        text: u.standalone_source.clone(),
                    })
                    .collect())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Move the job to its terminal state unless it already has one.
fn finish(job: &SharedJob, status: JobStatus, message: &str, error: Option<String>, results: Vec<ResultRecord>) {
    let mut guard = lock_job(job);
    if guard.status.is_terminal() {
        return;
    }
    guard.status = status;
    guard.message = message.to_string();
    guard.error = error;
    guard.results = results;
    guard.finished_at = Some(Utc::now());
    if status == JobStatus::Completed {
        guard.progress_percent = 100;
    }
    let elapsed_ms = guard
        .started_at
        .map(|s| (Utc::now() - s).num_milliseconds())
        .unwrap_or(0);
    match status {
        JobStatus::Completed => {
            info!(job_id = %guard.job_id, results = guard.results.len(), elapsed_ms, "Job completed")
        }
        _ => warn!(
            job_id = %guard.job_id,
            status = %status,
            error = guard.error.as_deref().unwrap_or(""),
            elapsed_ms,
            "Job ended without results"
        ),
    }
}

fn fail_with(job: &SharedJob, err: EngineError) {
    let status = match err {
        EngineError::ExecutionTimeout(_) => JobStatus::TimedOut,
        _ => JobStatus::Failed,
    };
    let message = match status {
        JobStatus::TimedOut => "Timed out",
        _ => "Failed",
    };
    finish(job, status, message, Some(err.to_string()), Vec::new());
}

async fn drive(inner: Arc<Inner>, job: SharedJob, source: ScannerSource) {
    let (job_id, range, mode) = {
        let guard = lock_job(&job);
        (guard.job_id, guard.date_range, guard.mode.clone())
    };

    let _permit = match Arc::clone(&inner.permits).acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            fail_with(&job, EngineError::ExecutionRuntimeError("worker pool closed".to_string()));
            return;
        }
    };

    {
        let mut guard = lock_job(&job);
        guard.status = JobStatus::Running;
        guard.started_at = Some(Utc::now());
    }
    let tracker = ProgressTracker::new(Arc::clone(&job), inner.observer.clone());
    tracker.set(2, "Analyzing source");

    let analysed = inner.analyze(&source);
    {
        let mut guard = lock_job(&job);
        guard.analysis = Some(analysed.analysis.clone());
        guard.warnings = analysed.warnings.clone();
    }
    tracker.set(EXEC_LO, "Analysis complete");

    let plan = match inner.plan(&mode, &source, &analysed) {
        Ok(plan) => plan,
        Err(reason) => {
            fail_with(&job, EngineError::InvalidRequest(reason));
            return;
        }
    };
    if plan.is_empty() {
        tracker.set(100, "Analysis complete");
        finish(&job, JobStatus::Completed, "Analysis complete", None, Vec::new());
        return;
    }

    info!(job_id = %job_id, %mode, units = plan.len(), "Executing job");
    let mut records = Vec::new();
    for (i, planned) in plan.iter().enumerate() {
        let unit = match compile(&planned.text, &inner.compile_options) {
            Ok(unit) => Arc::new(unit),
            Err(e) => {
                let name = planned.label.as_deref().unwrap_or("source");
                fail_with(
                    &job,
                    EngineError::DecompositionSyntaxError {
                        unit: name.to_string(),
                        reason: e.to_string(),
                    },
                );
                return;
            }
        };
        // A whole-source run keeps per-row pattern names only when the
        // source selects more than one pattern.
        let keep_row_patterns = planned.label.is_none() && unit.selection.len() > 1;

        let sink: Arc<dyn ProgressSink> = Arc::new(tracker.slice(i, plan.len(), EXEC_LO, EXEC_HI));
        let raw = match inner.sandbox.execute(Arc::clone(&unit), range, sink).await {
            Ok(raw) => raw,
            Err(e) => {
                if let SandboxError::EventLoopConflict(msg) = &e {
                    error!(job_id = %job_id, msg = %msg, "Loop-context invariant violated");
                }
                fail_with(&job, e.into());
                return;
            }
        };

        let mut unit_records = inner.normalizer.normalize(raw);
        if !keep_row_patterns {
            for r in &mut unit_records {
                r.pattern_name = planned.label.clone();
            }
        }
        info!(
            job_id = %job_id,
            unit = planned.label.as_deref().unwrap_or("source"),
            records = unit_records.len(),
            "Unit finished"
        );
        records.extend(unit_records);
    }

    tracker.set(97, "Normalizing results");
    let results = inner.normalizer.dedup(records);
    let message = format!("Completed with {} results", results.len());
    tracker.set(100, &message);
    finish(&job, JobStatus::Completed, &message, None, results);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
