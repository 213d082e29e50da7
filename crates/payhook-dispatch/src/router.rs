//! Webhook router: idempotency guard, handler invocation, and the
//! failure path into the retry subsystem.
//!
//! Dispatch is exactly-once at the side-effect level: the provider's event
//! id is the idempotency key, and a handler only runs after the event was
//! atomically claimed `Pending -> Processing`. Redeliveries of anything
//! already stored are acknowledged without re-invoking the handler.

use std::{collections::HashMap, sync::Arc, time::Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use payhook_core::{
    Clock, Component, EventKind, EventStatus, EventStore, HandlerError, Metric, MetricsSink,
    Result, VerifiedEvent, WebhookEvent,
};

use crate::retry::{RetryDecision, RetryPolicy};

/// Business logic invoked for one webhook event.
///
/// Implementations must be idempotent at the business level anyway
/// (providers may redeliver after a crash mid-processing), but the router
/// guarantees at most one concurrent invocation per event id.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Applies the event's side effects.
    async fn handle(&self, event: &VerifiedEvent) -> std::result::Result<(), HandlerError>;
}

/// Static mapping from event kind to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventKind, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `kind`, replacing any previous registration.
    pub fn register(&mut self, kind: EventKind, handler: Arc<dyn EventHandler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Looks up the handler for a kind.
    pub fn get(&self, kind: &EventKind) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(kind).cloned()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry").field("kinds", &self.handlers.len()).finish()
    }
}

/// How a dispatched event left the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler ran and succeeded.
    Processed,
    /// The event was already in a terminal state; acknowledged untouched.
    Duplicate,
    /// Another task currently owns the event; acknowledged untouched.
    InFlight,
    /// No handler is registered for the kind; acknowledged and recorded.
    Ignored,
    /// The handler failed transiently; a retry is scheduled.
    Scheduled {
        /// When the retry becomes due.
        at: DateTime<Utc>,
    },
    /// The event was parked for manual review.
    DeadLettered,
}

/// Routes verified events through storage and the registered handlers.
pub struct EventRouter<S> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
}

impl<S: EventStore> EventRouter<S> {
    /// Creates a router.
    pub fn new(
        store: Arc<S>,
        registry: Arc<HandlerRegistry>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self { store, registry, policy, clock, metrics }
    }

    /// Shared access to the event store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Processes a freshly verified delivery.
    ///
    /// Returns an outcome the ingress layer always acknowledges with 200;
    /// only infrastructure errors (`Err`) surface as 500 so the provider
    /// redelivers.
    pub async fn dispatch(&self, event: &VerifiedEvent) -> Result<DispatchOutcome> {
        self.metrics.record(Metric::Requests(Component::Router), 1.0);

        let now = self.clock.now_utc();
        let record = WebhookEvent::from_verified(event, now);

        if !self.store.insert_new(&record).await? {
            let stored = self.store.find(&event.id).await?;
            let outcome = match stored.map(|e| e.status) {
                Some(EventStatus::Succeeded | EventStatus::DeadLettered) => {
                    DispatchOutcome::Duplicate
                },
                _ => DispatchOutcome::InFlight,
            };
            info!(event_id = %event.id, kind = %event.kind, ?outcome, "redelivery acknowledged");
            return Ok(outcome);
        }

        if !self.store.try_claim(&event.id, now).await? {
            // Lost the claim race to a concurrent delivery of the same id.
            return Ok(DispatchOutcome::InFlight);
        }

        self.attempt(event, 1, Component::Router).await
    }

    /// Re-processes an event the sweeper already claimed.
    pub async fn process_claimed(&self, event: &WebhookEvent) -> Result<DispatchOutcome> {
        self.metrics.record(Metric::Requests(Component::Retry), 1.0);
        let attempt = event.attempt_count.saturating_add(1);
        self.attempt(&event.to_verified(), attempt, Component::Retry).await
    }

    /// Runs the handler for an event in `Processing` and applies the
    /// resulting transition.
    async fn attempt(
        &self,
        event: &VerifiedEvent,
        attempt_count: i32,
        component: Component,
    ) -> Result<DispatchOutcome> {
        let Some(handler) = self.registry.get(&event.kind) else {
            info!(event_id = %event.id, kind = %event.kind, "no handler registered, acknowledging");
            self.store.mark_succeeded(&event.id).await?;
            return Ok(DispatchOutcome::Ignored);
        };

        let started = Instant::now();
        let result = handler.handle(event).await;
        self.metrics
            .record(Metric::Latency(component), started.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(()) => {
                self.store.mark_succeeded(&event.id).await?;
                info!(event_id = %event.id, kind = %event.kind, attempt = attempt_count, "event processed");
                Ok(DispatchOutcome::Processed)
            },
            Err(handler_err) => {
                self.metrics.record(Metric::Errors(component), 1.0);
                self.store
                    .mark_failed(&event.id, attempt_count, &handler_err.to_string())
                    .await?;

                let attempt = u32::try_from(attempt_count).unwrap_or(u32::MAX);
                match self.policy.decide(attempt, &handler_err, self.clock.now_utc()) {
                    RetryDecision::Retry { at } => {
                        self.store.schedule_retry(&event.id, at).await?;
                        warn!(
                            event_id = %event.id,
                            attempt = attempt_count,
                            retry_at = %at,
                            error = %handler_err,
                            "attempt failed, retry scheduled"
                        );
                        Ok(DispatchOutcome::Scheduled { at })
                    },
                    RetryDecision::DeadLetter { reason } => {
                        self.store.dead_letter(&event.id).await?;
                        warn!(
                            event_id = %event.id,
                            attempt = attempt_count,
                            reason = %reason,
                            "event dead-lettered"
                        );
                        Ok(DispatchOutcome::DeadLettered)
                    },
                }
            },
        }
    }
}

impl<S> std::fmt::Debug for EventRouter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter").field("policy", &self.policy).finish_non_exhaustive()
    }
}
