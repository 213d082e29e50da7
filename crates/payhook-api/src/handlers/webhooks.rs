//! Webhook ingress handler.
//!
//! Reads the raw body, verifies the `X-Signature` header before parsing
//! anything, and routes the verified event. Verification failures map to
//! 4xx; every routed outcome acknowledges with 200 so the provider stops
//! redelivering. Only infrastructure failures return 5xx.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::Serialize;
use tracing::{error, instrument};

use payhook_core::{BatchStore, EventStore};
use payhook_dispatch::DispatchOutcome;

use crate::{
    handlers::{error_response, storage_error_response},
    server::AppState,
    verify::VerifyError,
};

const SIGNATURE_HEADER: &str = "x-signature";
const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Acknowledgement returned for every accepted delivery.
#[derive(Debug, Serialize)]
pub struct ReceiveResponse {
    /// Always true; the provider can stop redelivering.
    pub received: bool,
    /// Provider-assigned event id.
    pub event_id: String,
    /// What the router did with the event.
    pub disposition: &'static str,
}

const fn disposition(outcome: &DispatchOutcome) -> &'static str {
    match outcome {
        DispatchOutcome::Processed => "processed",
        DispatchOutcome::Duplicate => "duplicate",
        DispatchOutcome::InFlight => "in_flight",
        DispatchOutcome::Ignored => "ignored",
        DispatchOutcome::Scheduled { .. } => "retry_scheduled",
        DispatchOutcome::DeadLettered => "dead_lettered",
    }
}

/// Receives one provider delivery.
#[instrument(name = "receive_webhook", skip(state, headers, body), fields(provider = %provider))]
pub async fn receive_webhook<S: EventStore, B: BatchStore>(
    State(state): State<AppState<S, B>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if body.len() > MAX_PAYLOAD_SIZE {
        return error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload_too_large",
            format!("payload of {} bytes exceeds the {MAX_PAYLOAD_SIZE} byte limit", body.len()),
        );
    }

    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    let event = match state.verifier.verify(&provider, signature, &body) {
        Ok(event) => event,
        Err(err) => return verify_error_response(&err),
    };

    match state.router.dispatch(&event).await {
        Ok(outcome) => {
            let response = ReceiveResponse {
                received: true,
                event_id: event.id.to_string(),
                disposition: disposition(&outcome),
            };
            (StatusCode::OK, Json(response)).into_response()
        },
        Err(err) => {
            // 5xx makes the provider redeliver; the idempotency guard
            // absorbs the repeat once storage recovers.
            error!(event_id = %event.id, error = %err, "dispatch failed");
            storage_error_response(&err)
        },
    }
}

fn verify_error_response(err: &VerifyError) -> Response {
    match err {
        VerifyError::UnknownProvider(provider) => error_response(
            StatusCode::NOT_FOUND,
            "unknown_provider",
            format!("no webhook secret configured for provider '{provider}'"),
        ),
        VerifyError::MissingSignature => error_response(
            StatusCode::UNAUTHORIZED,
            "missing_signature",
            "X-Signature header is required",
        ),
        VerifyError::InvalidSignature(_) => error_response(
            StatusCode::UNAUTHORIZED,
            "invalid_signature",
            "signature verification failed",
        ),
        VerifyError::MalformedPayload(detail) => {
            error_response(StatusCode::BAD_REQUEST, "malformed_payload", detail.clone())
        },
    }
}
