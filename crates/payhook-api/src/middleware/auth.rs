//! Bearer-token authentication for the dead-letter admin endpoints.
//!
//! Webhook ingress authenticates via HMAC signatures instead; this guard
//! only protects the operator surface (inspection and replay).

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::crypto::constant_time_eq;

/// Shared admin token, injected as middleware state.
#[derive(Debug, Clone)]
pub struct AdminToken(Arc<str>);

impl AdminToken {
    /// Wraps the configured token. An empty token disables the admin
    /// endpoints entirely.
    pub fn new(token: &str) -> Self {
        Self(Arc::from(token))
    }
}

/// Admin authentication failures.
#[derive(Debug)]
pub enum AuthError {
    /// No token is configured; the endpoints are switched off.
    Disabled,
    /// The Authorization header is missing.
    MissingHeader,
    /// The presented token does not match.
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Disabled => (StatusCode::NOT_FOUND, "admin endpoints are not enabled"),
            Self::MissingHeader => (StatusCode::UNAUTHORIZED, "missing Authorization header"),
            Self::InvalidToken => (StatusCode::UNAUTHORIZED, "invalid admin token"),
        };
        (status, message).into_response()
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
}

/// Axum middleware guarding the admin routes.
pub async fn admin_auth(
    State(token): State<AdminToken>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    if token.0.is_empty() {
        return Err(AuthError::Disabled);
    }

    let presented = extract_bearer(req.headers()).ok_or(AuthError::MissingHeader)?;
    if !constant_time_eq(presented.as_bytes(), token.0.as_bytes()) {
        return Err(AuthError::InvalidToken);
    }

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer admin-token-1"));
        assert_eq!(extract_bearer(&headers), Some("admin-token-1"));
    }

    #[test]
    fn rejects_non_bearer_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        assert_eq!(extract_bearer(&headers), None);
    }
}
