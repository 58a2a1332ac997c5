use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use stagewatch_core::{ContinuityReport, TraceView};
use stagewatch_metrics::SloStatus;
use tower_http::trace::TraceLayer;
use tracing::error;

const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_text))
        .route("/metrics/json", get(metrics_json))
        .route("/slos", get(slos))
        .route("/traces", get(continuity))
        .route("/traces/:trace_id", get(trace))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Failure of a handler. Internal details are logged, never returned.
#[derive(Debug)]
pub enum ApiError {
    NotFound,
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found").into_response(),
            ApiError::Internal(err) => {
                error!(error = %err, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}

/// Runs `work` on the blocking thread pool. Snapshots and SLO evaluation
/// lock every series in turn and must not stall the async workers.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("Blocking handler task failed: {}", e)))
}

async fn metrics_text(State(state): State<AppState>) -> Result<Response, ApiError> {
    let body = blocking(move || {
        let snapshot = state.exporter.snapshot(&state.registry);
        state.exporter.render_text(&snapshot)
    })
    .await?;
    Ok(([(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)], body).into_response())
}

async fn metrics_json(State(state): State<AppState>) -> Result<Response, ApiError> {
    let body = blocking(move || {
        let snapshot = state.exporter.snapshot(&state.registry);
        state.exporter.render_json(&snapshot)
    })
    .await??;
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

async fn slos(State(state): State<AppState>) -> Result<Json<Vec<SloStatus>>, ApiError> {
    let statuses = blocking(move || state.evaluator.evaluate_all(&state.registry)).await?;
    Ok(Json(statuses))
}

async fn continuity(State(state): State<AppState>) -> Json<ContinuityReport> {
    Json(state.tracker.query_continuity())
}

async fn trace(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
) -> Result<Json<TraceView>, ApiError> {
    state
        .tracker
        .query_trace(&trace_id)
        .map(Json)
        .ok_or(ApiError::NotFound)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::Value;
    use stagewatch_config::SloDefinition;
    use stagewatch_core::{MetricId, MetricRegistry, Span, SpanStatus, TraceTracker};
    use stagewatch_metrics::{Exporter, SloEvaluator};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn success() -> MetricId {
        MetricId::new("requests_total", [("outcome", "success")]).unwrap()
    }

    fn failure() -> MetricId {
        MetricId::new("requests_total", [("outcome", "failure")]).unwrap()
    }

    fn state() -> AppState {
        let availability = SloDefinition::builder()
            .name("availability")
            .ratio(success(), failure())
            .at_least(0.995)
            .window(Duration::from_secs(300))
            .build()
            .unwrap();

        AppState::new(
            Arc::new(MetricRegistry::default()),
            Arc::new(TraceTracker::default()),
            Arc::new(SloEvaluator::new(vec![availability])),
            Exporter::default(),
        )
    }

    async fn get(state: &AppState, uri: &str) -> (StatusCode, String, Option<String>) {
        let response = router(state.clone())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap(), content_type)
    }

    #[tokio::test]
    async fn test_healthz() {
        let (status, body, _) = get(&state(), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_readyz_waits_for_initialization() {
        let state = state();
        let (status, body, _) = get(&state, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "not ready");

        state.registry.mark_ready();
        let (status, _, _) = get(&state, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        state.tracker.mark_ready();
        let (status, body, _) = get(&state, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_metrics_text() {
        let state = state();
        state.registry.increment_counter(&success(), 1.0).unwrap();

        let (status, body, content_type) = get(&state, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(content_type.unwrap().starts_with("text/plain"));
        assert!(body.contains("# TYPE requests_total counter"));
        assert!(body.contains("requests_total{outcome=\"success\"} 1"));
    }

    #[tokio::test]
    async fn test_metrics_json() {
        let state = state();
        state.registry.set_gauge(&MetricId::unlabeled("queue_depth").unwrap(), 4.0).unwrap();

        let (status, body, content_type) = get(&state, "/metrics/json").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("application/json"));

        let doc: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(doc["total_series"], 1);
        assert_eq!(doc["metrics"][0]["name"], "queue_depth");
        assert_eq!(doc["metrics"][0]["value"], 4.0);
    }

    #[tokio::test]
    async fn test_slos_report_each_definition() {
        let state = state();
        for _ in 0..1000 {
            state.registry.increment_counter(&success(), 1.0).unwrap();
        }
        for _ in 0..3 {
            state.registry.increment_counter(&failure(), 1.0).unwrap();
        }

        let (status, body, _) = get(&state, "/slos").await;
        assert_eq!(status, StatusCode::OK);

        let slos: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(slos[0]["name"], "availability");
        assert_eq!(slos[0]["compliant"], true);
        assert_eq!(slos[0]["status"], "compliant");
        assert_eq!(slos[0]["window"]["seconds"], 300);
    }

    #[tokio::test]
    async fn test_slos_unknown_metric() {
        let (status, body, _) = get(&state(), "/slos").await;
        assert_eq!(status, StatusCode::OK);

        let slos: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(slos[0]["status"], "unknown");
        assert!(slos[0]["compliant"].is_null());
    }

    #[tokio::test]
    async fn test_trace_routes() {
        let state = state();
        let base = Utc::now();
        let stages = state.tracker.stages().to_vec();
        for (i, stage) in stages.iter().enumerate() {
            let start = base + ChronoDuration::milliseconds(i as i64 * 50);
            let span = Span::new("t1", stage.clone(), start, start + ChronoDuration::milliseconds(40), SpanStatus::Ok);
            state.tracker.record_span(span).unwrap();
        }

        let (status, body, _) = get(&state, "/traces/t1").await;
        assert_eq!(status, StatusCode::OK);
        let view: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(view["state"], "complete");
        assert_eq!(view["spans"].as_array().unwrap().len(), stages.len());

        let (status, body, _) = get(&state, "/traces").await;
        assert_eq!(status, StatusCode::OK);
        let report: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(report["complete"], 1);

        let (status, body, _) = get(&state, "/traces/unknown").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "not found");
    }

    #[tokio::test]
    async fn test_panicking_blocking_work_is_internal_error() {
        let result = blocking(|| -> String { panic!("exporter bug") }).await;
        assert!(matches!(result, Err(ApiError::Internal(_))));

        assert_eq!(blocking(|| 7).await.unwrap(), 7);
    }

    #[test]
    fn test_internal_error_hides_detail() {
        let response = ApiError::Internal(anyhow::anyhow!("lock poisoned at registry.rs")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = tokio_test::block_on(to_bytes(response.into_body(), usize::MAX)).unwrap();
        assert_eq!(&body[..], b"internal error");
    }
}
