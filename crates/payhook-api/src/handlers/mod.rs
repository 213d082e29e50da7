//! HTTP request handlers.

pub mod batch;
pub mod dead_letter;
pub mod health;
pub mod webhooks;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use payhook_core::CoreError;

/// Error response body with a stable machine-readable code.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details.
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Stable error code, e.g. `invalid_signature`.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

pub(crate) fn error_response(
    status: StatusCode,
    code: &str,
    message: impl Into<String>,
) -> Response {
    let body = ErrorResponse {
        error: ErrorDetail { code: code.to_string(), message: message.into() },
    };
    (status, Json(body)).into_response()
}

/// Maps storage failures onto HTTP statuses. Transient storage trouble is
/// a 503 so callers know to retry; everything else is a 500.
pub(crate) fn storage_error_response(err: &CoreError) -> Response {
    match err {
        CoreError::NotFound(msg) => error_response(StatusCode::NOT_FOUND, "not_found", msg.clone()),
        CoreError::Conflict(msg) => error_response(StatusCode::CONFLICT, "conflict", msg.clone()),
        CoreError::Unavailable(_) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "storage_unavailable",
            "storage temporarily unavailable",
        ),
        CoreError::InvalidInput(msg) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_input", msg.clone())
        },
        CoreError::Database(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "internal error",
        ),
    }
}
