//! API route handlers.
//!
//! State is shared via `Arc<ApiState>`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::engine::{JobController, JobRequest, JobSummary};
use crate::error::EngineError;
use crate::types::{JobAnalysis, JobStatusView, ScannerSource};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct ApiState {
    pub controller: JobController,
    pub service: String,
    pub started_at: DateTime<Utc>,
}

impl ApiState {
    pub fn new(controller: JobController, service: impl Into<String>) -> Self {
        Self {
            controller,
            service: service.into(),
            started_at: Utc::now(),
        }
    }
}

pub type AppState = Arc<ApiState>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzeRequest {
    pub source_text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeResponse {
    pub content_hash: String,
    #[serde(flatten)]
    pub analysis: JobAnalysis,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: String,
    pub jobs: usize,
    pub uptime_secs: i64,
}

/// Engine errors mapped onto HTTP statuses.
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::JobNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// POST /api/jobs
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<JobRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let job_id = state.controller.submit(request)?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id })))
}

/// GET /api/jobs
pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobSummary>> {
    Json(state.controller.list())
}

/// GET /api/jobs/:id
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusView>, ApiError> {
    Ok(Json(state.controller.status(job_id)?))
}

/// POST /api/analyze
pub async fn analyze_source(
    State(state): State<AppState>,
    Json(request): Json<AnalyzeRequest>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    if request.source_text.trim().is_empty() {
        return Err(EngineError::InvalidRequest("source_text is empty".to_string()).into());
    }
    let source = ScannerSource::new(request.source_text);
    let analysed = state.controller.analyze(&source);
    Ok(Json(AnalyzeResponse {
        content_hash: source.content_hash().to_string(),
        analysis: analysed.analysis,
        warnings: analysed.warnings,
    }))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: state.service.clone(),
        jobs: state.controller.len(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}
