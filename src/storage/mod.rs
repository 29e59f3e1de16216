//! Persistence layer.
//!
//! Finished job reports are written as pretty JSON so a CLI run can be
//! inspected or diffed later. The registry itself is in-memory only.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, info};

use crate::types::ExecutionJob;

/// Default report file path.
const DEFAULT_REPORT_FILE: &str = "scanlab_report.json";

/// Save a job report to a JSON file.
pub fn save_report(job: &ExecutionJob, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_REPORT_FILE);
    let json = serde_json::to_string_pretty(job).context("Failed to serialise job report")?;

    std::fs::write(path, &json).with_context(|| format!("Failed to write report to {path}"))?;

    debug!(path, job_id = %job.job_id, status = %job.status, results = job.results.len(), "Report saved");
    Ok(())
}

/// Load a job report. Returns None if the file doesn't exist.
pub fn load_report(path: Option<&str>) -> Result<Option<ExecutionJob>> {
    let path = path.unwrap_or(DEFAULT_REPORT_FILE);

    if !Path::new(path).exists() {
        info!(path, "No saved report found");
        return Ok(None);
    }

    let json = std::fs::read_to_string(path).with_context(|| format!("Failed to read report from {path}"))?;
    let job: ExecutionJob =
        serde_json::from_str(&json).with_context(|| format!("Failed to parse report from {path}"))?;

    info!(path, job_id = %job.job_id, status = %job.status, results = job.results.len(), "Report loaded");
    Ok(Some(job))
}

/// Delete a report file if present.
pub fn delete_report(path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_REPORT_FILE);
    if Path::new(path).exists() {
        std::fs::remove_file(path).with_context(|| format!("Failed to delete report file {path}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
