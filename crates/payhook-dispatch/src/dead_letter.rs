//! Dead-letter inspection and manual replay.

use std::sync::Arc;

use tracing::info;

use payhook_core::{Clock, EventId, EventStore, Result, WebhookEvent};

/// Operator-facing view of parked events.
pub struct DeadLetterQueue<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: EventStore> DeadLetterQueue<S> {
    /// Creates a queue view over the event store.
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Lists dead-lettered events, most recent first.
    pub async fn list(&self, limit: usize) -> Result<Vec<WebhookEvent>> {
        self.store.list_dead_lettered(limit).await
    }

    /// Replays one dead-lettered event.
    ///
    /// The event goes back to `Pending` with a fresh attempt budget and an
    /// immediately-due `next_attempt_at`, so the sweeper picks it up on its
    /// next pass. Fails with a conflict if the event is not dead-lettered.
    pub async fn replay(&self, id: &EventId) -> Result<WebhookEvent> {
        let event = self.store.replay(id, self.clock.now_utc()).await?;
        info!(event_id = %id, kind = %event.kind, "dead-lettered event replayed");
        Ok(event)
    }
}

impl<S> std::fmt::Debug for DeadLetterQueue<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue").finish_non_exhaustive()
    }
}
