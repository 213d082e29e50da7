//! Router assembly and server lifecycle.
//!
//! Requests flow through middleware in order: request-id injection,
//! request/response tracing, then timeout enforcement. The webhook and
//! batch routes are public (webhooks authenticate via signature); the
//! dead-letter routes sit behind the admin bearer token.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use payhook_batch::BatchProcessor;
use payhook_core::{BatchStore, Clock, EventStore};
use payhook_dispatch::{DeadLetterQueue, EventRouter};

use crate::{
    handlers,
    middleware::{admin_auth, AdminToken},
    verify::Verifier,
};

/// Shared application state injected into every handler.
pub struct AppState<S, B> {
    /// Signature verifier with per-provider secrets.
    pub verifier: Arc<Verifier>,
    /// Webhook router.
    pub router: Arc<EventRouter<S>>,
    /// Dead-letter inspection and replay.
    pub dead_letters: Arc<DeadLetterQueue<S>>,
    /// Batch processor.
    pub batch: Arc<BatchProcessor<B>>,
    /// Injected time source.
    pub clock: Arc<dyn Clock>,
}

impl<S, B> Clone for AppState<S, B> {
    fn clone(&self) -> Self {
        Self {
            verifier: Arc::clone(&self.verifier),
            router: Arc::clone(&self.router),
            dead_letters: Arc::clone(&self.dead_letters),
            batch: Arc::clone(&self.batch),
            clock: Arc::clone(&self.clock),
        }
    }
}

/// Builds the full application router.
///
/// `admin_token` guards the dead-letter routes; an empty token disables
/// them. `request_timeout` bounds every request end to end.
pub fn create_router<S: EventStore, B: BatchStore>(
    state: AppState<S, B>,
    admin_token: &str,
    request_timeout: Duration,
) -> Router {
    let health_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/live", get(handlers::health::liveness_check));

    let admin_routes = Router::new()
        .route("/webhooks/dead-letter", get(handlers::dead_letter::list_dead_letters))
        .route(
            "/webhooks/dead-letter/{event_id}/replay",
            post(handlers::dead_letter::replay_dead_letter),
        )
        .layer(middleware::from_fn_with_state(AdminToken::new(admin_token), admin_auth));

    Router::new()
        .route("/webhooks/{provider}", post(handlers::webhooks::receive_webhook))
        .route("/batch", post(handlers::batch::submit_batch))
        .route("/batch/{job_id}", get(handlers::batch::batch_status))
        .merge(admin_routes)
        .merge(health_routes)
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Injects an `X-Request-Id` header for cross-service tracing.
async fn inject_request_id(req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let mut req = req;
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;
    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", value);
    }
    response
}

/// Serves the router until the cancellation token fires.
///
/// Stops accepting new connections on shutdown and drains in-flight
/// requests before returning.
pub async fn serve(
    router: Router,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    info!("HTTP server stopped");
    Ok(())
}
