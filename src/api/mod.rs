//! HTTP surface: job submission, polling and source analysis.
//!
//! All endpoints speak JSON. CORS is open for local tooling.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub use routes::{ApiState, AppState};

/// Build the router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/jobs", post(routes::submit_job).get(routes::list_jobs))
        .route("/api/jobs/:id", get(routes::get_job))
        .route("/api/analyze", post(routes::analyze_source))
        .route("/health", get(routes::health))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: AppState, addr: SocketAddr) -> Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, "API server listening");
    axum::serve(listener, app).await.context("API server error")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::data::SyntheticProvider;
    use crate::engine::JobController;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    const SCAN: &str = "def main(start_date, end_date):\n    df['gap_up'] = (df['gap_pct'] > 8).astype(int)\n    return df[df['gap_up'] == 1]\n";

    fn test_state() -> AppState {
        let cfg = AppConfig::default();
        let controller = JobController::new(&cfg, Arc::new(SyntheticProvider::new(20)));
        Arc::new(ApiState::new(controller, "scanlab-test"))
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 1_000_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = build_router(test_state());
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_submit_and_poll() {
        let state = test_state();
        let app = build_router(Arc::clone(&state));
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/jobs",
                serde_json::json!({"source_text": SCAN, "start_date": "2024-03-04", "end_date": "2024-03-08"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let id = body_json(resp).await["job_id"].as_str().unwrap().to_string();

        state
            .controller
            .wait(id.parse().unwrap(), Duration::from_millis(10))
            .await
            .unwrap();

        let resp = app
            .oneshot(Request::builder().uri(format!("/api/jobs/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "completed");
        assert_eq!(json["progress_percent"], 100);
        assert!(json["results"].is_array());
    }

    #[tokio::test]
    async fn test_bad_request_and_not_found() {
        let app = build_router(test_state());
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/jobs",
                serde_json::json!({"source_text": SCAN, "start_date": "2024-03-08", "end_date": "2024-03-04"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["error"].as_str().unwrap().contains("after"));

        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/jobs/{}", uuid::Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_analyze_endpoint() {
        let app = build_router(test_state());
        let src = r#"self.pattern_assignments = [{"name":"p1","logic":"a>1"},{"name":"p2","logic":"a<-1"}]"#;
        let resp = app
            .oneshot(post_json("/api/analyze", serde_json::json!({"source_text": src})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["classification"]["pattern_kind"], "multi_pattern_assignments");
        assert_eq!(json["units"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_list_jobs() {
        let app = build_router(test_state());
        let resp = app
            .oneshot(Request::builder().uri("/api/jobs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_json(resp).await.as_array().unwrap().is_empty());
    }
}
