//! Health probes for orchestration systems.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{debug, error, instrument};

use payhook_core::{BatchStore, EventStore};

use crate::server::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall status: `healthy` or `unhealthy`.
    pub status: &'static str,
    /// Whether the event store answered the probe query.
    pub storage: &'static str,
    /// Pending + processing webhook backlog, when storage is reachable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<u64>,
    /// Service version.
    pub version: &'static str,
}

/// Full health check including a storage round trip.
#[instrument(name = "health_check", skip(state))]
pub async fn health_check<S: EventStore, B: BatchStore>(
    State(state): State<AppState<S, B>>,
) -> Response {
    match state.router.store().queue_depth().await {
        Ok(depth) => {
            debug!(queue_depth = depth, "health check passed");
            let body = HealthResponse {
                status: "healthy",
                storage: "up",
                queue_depth: Some(depth),
                version: env!("CARGO_PKG_VERSION"),
            };
            (StatusCode::OK, Json(body)).into_response()
        },
        Err(err) => {
            error!(error = %err, "health check failed");
            let body = HealthResponse {
                status: "unhealthy",
                storage: "down",
                queue_depth: None,
                version: env!("CARGO_PKG_VERSION"),
            };
            (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
        },
    }
}

/// Readiness probe; identical contract to the health check.
#[instrument(name = "readiness_check", skip(state))]
pub async fn readiness_check<S: EventStore, B: BatchStore>(
    state: State<AppState<S, B>>,
) -> Response {
    health_check(state).await
}

/// Liveness probe. No external dependencies; only confirms the HTTP
/// server is responding.
pub async fn liveness_check() -> Response {
    (StatusCode::OK, Json(serde_json::json!({"status": "alive"}))).into_response()
}
