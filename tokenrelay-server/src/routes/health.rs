use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'a str,
}

fn bus_health(connected: bool, endpoint: &'static str, ok: &'static str) -> impl IntoResponse {
    if connected {
        metrics::counter!("health_checks_total", "endpoint" => endpoint, "status" => "ok")
            .increment(1);
        (StatusCode::OK, Json(HealthResponse { status: ok }))
    } else {
        metrics::counter!("health_checks_total", "endpoint" => endpoint, "status" => "error")
            .increment(1);
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse { status: "degraded" }),
        )
    }
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    bus_health(state.bus.is_connected(), "healthz", "ok")
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    bus_health(state.bus.is_connected(), "readyz", "ready")
}

/// Liveness and readiness probes, both tied to the bus connection.
pub fn create_health_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}
