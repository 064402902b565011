//! Web server module.
//!
//! Serves the Prometheus scrape endpoint and a liveness check.

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};

use crate::collector::QueryScheduler;
use crate::metrics::MetricsRegistry;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<QueryScheduler>,
    pub registry: Arc<MetricsRegistry>,
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

/// Create the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    let app_state = Arc::new(state);

    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default()))
        .with_state(app_state)
}

/// Liveness check.
async fn healthz_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Scrape endpoint: runs on-demand queries, drops expired series, then
/// renders the registry. Query failures show up in the builtin metrics
/// and never fail the scrape.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    state.scheduler.run_on_demand().await;
    state.registry.sweep_expired();

    match state.registry.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Metrics render failed");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", e)).into_response()
        }
    }
}
