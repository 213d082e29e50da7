//! Event verification: signature check first, payload parsing second.
//!
//! A [`VerifiedEvent`] can only be constructed here, after the HMAC check
//! against the provider's shared secret passed. Nothing downstream ever
//! parses unauthenticated bytes.

use std::{collections::HashMap, sync::Arc};

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use payhook_core::{Component, EventId, EventKind, Metric, MetricsSink, VerifiedEvent};

use crate::crypto::{self, SignatureError};

/// Rejection of an incoming delivery at the verification boundary.
///
/// None of these are retried: the provider gets a 4xx and decides for
/// itself whether to redeliver.
#[derive(Debug, Clone, Error)]
pub enum VerifyError {
    /// No secret is configured for the provider path segment.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// The signature header was absent.
    #[error("missing signature header")]
    MissingSignature,

    /// The signature was present but failed verification.
    #[error("signature verification failed: {0}")]
    InvalidSignature(SignatureError),

    /// The (authenticated) body was not a usable event document.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    id: String,
    #[serde(rename = "type")]
    kind: String,
}

/// Verifies provider deliveries against per-provider secrets.
#[derive(Debug)]
pub struct Verifier {
    secrets: HashMap<String, String>,
    metrics: Arc<dyn MetricsSink>,
}

impl Verifier {
    /// Creates a verifier from a provider-to-secret map.
    pub fn new(secrets: HashMap<String, String>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { secrets, metrics }
    }

    /// Whether a secret is configured for `provider`.
    pub fn knows_provider(&self, provider: &str) -> bool {
        self.secrets.contains_key(provider)
    }

    /// Verifies one delivery and parses it into a [`VerifiedEvent`].
    ///
    /// The signature covers the raw body exactly as received; parsing
    /// happens only after the check passes.
    pub fn verify(
        &self,
        provider: &str,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<VerifiedEvent, VerifyError> {
        self.metrics.record(Metric::Requests(Component::Verifier), 1.0);

        let result = self.verify_inner(provider, signature, body);
        if let Err(err) = &result {
            self.metrics.record(Metric::Errors(Component::Verifier), 1.0);
            warn!(provider, error = %err, "delivery rejected");
        }
        result
    }

    fn verify_inner(
        &self,
        provider: &str,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<VerifiedEvent, VerifyError> {
        let secret = self
            .secrets
            .get(provider)
            .ok_or_else(|| VerifyError::UnknownProvider(provider.to_string()))?;

        let signature = signature.ok_or(VerifyError::MissingSignature)?;
        crypto::verify_signature(body, signature, secret)
            .map_err(VerifyError::InvalidSignature)?;

        let payload: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| VerifyError::MalformedPayload(e.to_string()))?;
        let envelope: EventEnvelope = serde_json::from_value(payload.clone())
            .map_err(|e| VerifyError::MalformedPayload(e.to_string()))?;

        if envelope.id.is_empty() {
            return Err(VerifyError::MalformedPayload("event id is empty".to_string()));
        }

        Ok(VerifiedEvent {
            id: EventId::new(envelope.id),
            provider: provider.to_string(),
            kind: EventKind::from(envelope.kind.as_str()),
            payload,
        })
    }
}
