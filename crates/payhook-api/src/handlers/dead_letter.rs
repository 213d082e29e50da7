//! Dead-letter administration: inspection and manual replay.
//!
//! Mounted behind the admin bearer-token middleware.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use payhook_core::{BatchStore, EventId, EventStore, WebhookEvent};

use crate::{handlers::storage_error_response, server::AppState};

const DEFAULT_LIST_LIMIT: usize = 50;

/// Query parameters for the dead-letter listing.
#[derive(Debug, Deserialize)]
pub struct ListParams {
    /// Maximum events returned (default 50).
    pub limit: Option<usize>,
}

/// One dead-lettered event in the listing.
#[derive(Debug, Serialize)]
pub struct DeadLetterEntry {
    /// Provider-assigned event id.
    pub event_id: String,
    /// Delivering provider.
    pub provider: String,
    /// Event type.
    pub kind: String,
    /// When the event was first received.
    pub received_at: chrono::DateTime<chrono::Utc>,
    /// Attempts made before giving up.
    pub attempt_count: i32,
    /// The final failure message.
    pub last_error: Option<String>,
}

impl From<WebhookEvent> for DeadLetterEntry {
    fn from(event: WebhookEvent) -> Self {
        Self {
            event_id: event.id.to_string(),
            provider: event.provider,
            kind: event.kind.to_string(),
            received_at: event.received_at,
            attempt_count: event.attempt_count,
            last_error: event.last_error,
        }
    }
}

/// Lists parked events, most recent first.
#[instrument(name = "list_dead_letters", skip(state))]
pub async fn list_dead_letters<S: EventStore, B: BatchStore>(
    State(state): State<AppState<S, B>>,
    Query(params): Query<ListParams>,
) -> Response {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    match state.dead_letters.list(limit).await {
        Ok(events) => {
            let entries: Vec<DeadLetterEntry> =
                events.into_iter().map(DeadLetterEntry::from).collect();
            (StatusCode::OK, Json(entries)).into_response()
        },
        Err(err) => storage_error_response(&err),
    }
}

/// Replays one dead-lettered event through the retry pipeline.
#[instrument(name = "replay_dead_letter", skip(state), fields(event_id = %event_id))]
pub async fn replay_dead_letter<S: EventStore, B: BatchStore>(
    State(state): State<AppState<S, B>>,
    Path(event_id): Path<String>,
) -> Response {
    match state.dead_letters.replay(&EventId::new(event_id)).await {
        Ok(event) => {
            let body = serde_json::json!({
                "event_id": event.id,
                "status": event.status,
                "next_attempt_at": event.next_attempt_at,
            });
            (StatusCode::OK, Json(body)).into_response()
        },
        Err(err) => storage_error_response(&err),
    }
}
