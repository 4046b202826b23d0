//! Web server module.
//!
//! Serves the Prometheus scrape endpoint plus liveness/readiness probes.
//! The scrape path only ever touches the metric cache (and, in
//! scrape-triggered mode, one bounded refresh pass), never raw device I/O.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::engine::EngineState;
use crate::exporter::PlugExporter;

/// Prometheus text exposition content type.
const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// The scrape-facing collector adapter.
    pub exporter: Arc<PlugExporter>,
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    devices: Option<usize>,
}

/// Create the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    let app_state = Arc::new(state);

    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default()))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

/// Prometheus scrape endpoint.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.exporter.scrape().await {
        Ok(body) => ([(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Scrape failed");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", e)).into_response()
        }
    }
}

/// Liveness probe.
async fn healthz_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        devices: None,
    })
}

/// Readiness probe: the refresh engine must not be stopped.
async fn readyz_handler(State(state): State<Arc<AppState>>) -> Response {
    let engine = state.exporter.engine();
    if engine.state() == EngineState::Stopped {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "not_ready".to_string(),
                devices: None,
            }),
        )
            .into_response();
    }

    Json(HealthResponse {
        status: "ok".to_string(),
        devices: Some(engine.device_count().await),
    })
    .into_response()
}
