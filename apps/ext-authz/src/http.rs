//! Metrics and health HTTP server.
//!
//! Served on its own port next to the gRPC listener:
//! - `GET /healthz`: JSON service status for load balancer probes
//! - `GET /metrics`: Prometheus text exposition

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use grove_ext_authz::metrics::AuthMetrics;

pub const SERVICE_NAME: &str = "grove-ext-authz";

/// Shared state for the observability endpoints.
#[derive(Clone)]
pub struct HttpState {
    pub metrics: Arc<AuthMetrics>,
    pub version: String,
}

/// JSON response of the health endpoint.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: String,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn healthz_handler(State(state): State<HttpState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: SERVICE_NAME,
        version: state.version,
    })
}

async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
        }
    }
}
