//! End-to-end dispatch tests over the in-memory store: idempotent
//! redelivery, retry scheduling, dead-lettering, and manual replay.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;

use payhook_core::{
    Clock, EventId, EventKind, EventStatus, EventStore, HandlerError, InMemoryMetrics, Metric,
    MemoryEventStore, MetricsSink, NoopMetrics, TestClock, VerifiedEvent, WebhookEvent,
};
use payhook_dispatch::{
    DeadLetterQueue, DispatchOutcome, EventHandler, EventRouter, HandlerRegistry, RetryPolicy,
    RetrySweeper, SweeperConfig,
};

/// Handler that fails transiently a configured number of times, then
/// succeeds, counting every invocation.
struct FlakyHandler {
    calls: AtomicUsize,
    failures_remaining: AtomicUsize,
    permanent: bool,
    delay: Duration,
}

impl FlakyHandler {
    fn succeeding() -> Self {
        Self::failing_times(0)
    }

    fn failing_times(n: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failures_remaining: AtomicUsize::new(n),
            permanent: false,
            delay: Duration::ZERO,
        }
    }

    fn permanent() -> Self {
        Self { permanent: true, ..Self::failing_times(usize::MAX) }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for FlakyHandler {
    async fn handle(&self, _event: &VerifiedEvent) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining == 0 {
            return Ok(());
        }
        self.failures_remaining.store(remaining.saturating_sub(1), Ordering::SeqCst);

        if self.permanent {
            Err(HandlerError::permanent("subscription does not exist"))
        } else {
            Err(HandlerError::transient("downstream timeout"))
        }
    }
}

struct Fixture {
    store: Arc<MemoryEventStore>,
    router: Arc<EventRouter<MemoryEventStore>>,
    sweeper: RetrySweeper<MemoryEventStore>,
    clock: TestClock,
    handler: Arc<FlakyHandler>,
}

fn fixture(handler: FlakyHandler, policy: RetryPolicy) -> Fixture {
    fixture_with_metrics(handler, policy, Arc::new(NoopMetrics))
}

fn fixture_with_metrics(
    handler: FlakyHandler,
    policy: RetryPolicy,
    metrics: Arc<dyn MetricsSink>,
) -> Fixture {
    let store = Arc::new(MemoryEventStore::new());
    let clock = TestClock::at(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
    let handler = Arc::new(handler);

    let mut registry = HandlerRegistry::new();
    registry.register(EventKind::InvoicePaid, handler.clone() as Arc<dyn EventHandler>);

    let router = Arc::new(EventRouter::new(
        Arc::clone(&store),
        Arc::new(registry),
        policy,
        Arc::new(clock.clone()),
        Arc::clone(&metrics),
    ));
    let sweeper = RetrySweeper::new(
        Arc::clone(&router),
        Arc::new(clock.clone()),
        metrics,
        SweeperConfig::default(),
    );

    Fixture { store, router, sweeper, clock, handler }
}

fn invoice_paid(id: &str) -> VerifiedEvent {
    VerifiedEvent {
        id: EventId::new(id),
        provider: "stripe".to_string(),
        kind: EventKind::InvoicePaid,
        payload: serde_json::json!({
            "id": id,
            "type": "invoice.paid",
            "data": {"object": {"customer": "cus_1"}}
        }),
    }
}

#[tokio::test]
async fn first_delivery_processes_event() {
    let fx = fixture(FlakyHandler::succeeding(), RetryPolicy::default());

    let outcome = fx.router.dispatch(&invoice_paid("evt_1")).await.unwrap();

    assert_eq!(outcome, DispatchOutcome::Processed);
    assert_eq!(fx.handler.calls(), 1);
    let stored = fx.store.find(&EventId::new("evt_1")).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Succeeded);
}

#[tokio::test]
async fn redelivery_after_success_never_reinvokes_handler() {
    let fx = fixture(FlakyHandler::succeeding(), RetryPolicy::default());
    let event = invoice_paid("evt_1");

    assert_eq!(fx.router.dispatch(&event).await.unwrap(), DispatchOutcome::Processed);
    assert_eq!(fx.router.dispatch(&event).await.unwrap(), DispatchOutcome::Duplicate);
    assert_eq!(fx.router.dispatch(&event).await.unwrap(), DispatchOutcome::Duplicate);

    assert_eq!(fx.handler.calls(), 1);
}

#[tokio::test]
async fn concurrent_deliveries_invoke_handler_once() {
    let fx = fixture(
        FlakyHandler::succeeding().with_delay(Duration::from_millis(20)),
        RetryPolicy::default(),
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let router = Arc::clone(&fx.router);
        let event = invoice_paid("evt_race");
        handles.push(tokio::spawn(async move { router.dispatch(&event).await.unwrap() }));
    }

    let mut processed = 0;
    for handle in handles {
        if handle.await.unwrap() == DispatchOutcome::Processed {
            processed += 1;
        }
    }

    assert_eq!(processed, 1);
    assert_eq!(fx.handler.calls(), 1);
}

#[tokio::test]
async fn transient_failure_schedules_backoff() {
    let fx = fixture(FlakyHandler::failing_times(1), RetryPolicy::default().without_jitter());
    let start = fx.clock.now_utc();

    let outcome = fx.router.dispatch(&invoice_paid("evt_1")).await.unwrap();

    assert_eq!(outcome, DispatchOutcome::Scheduled { at: start + chrono::Duration::seconds(1) });
    let stored = fx.store.find(&EventId::new("evt_1")).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Pending);
    assert_eq!(stored.attempt_count, 1);
    assert_eq!(stored.last_error.as_deref(), Some("transient handler failure: downstream timeout"));
}

#[tokio::test]
async fn sweeper_retries_until_success() {
    let fx = fixture(FlakyHandler::failing_times(2), RetryPolicy::default().without_jitter());

    fx.router.dispatch(&invoice_paid("evt_1")).await.unwrap();

    // Nothing due yet.
    assert_eq!(fx.sweeper.sweep_once().await.unwrap(), 0);

    // First retry after 1s: fails again, rescheduled at +2s.
    fx.clock.advance(Duration::from_secs(1));
    assert_eq!(fx.sweeper.sweep_once().await.unwrap(), 1);
    let stored = fx.store.find(&EventId::new("evt_1")).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Pending);
    assert_eq!(stored.attempt_count, 2);

    // Second retry succeeds.
    fx.clock.advance(Duration::from_secs(2));
    assert_eq!(fx.sweeper.sweep_once().await.unwrap(), 1);
    let stored = fx.store.find(&EventId::new("evt_1")).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Succeeded);
    assert_eq!(fx.handler.calls(), 3);
}

#[tokio::test]
async fn exhausted_retries_dead_letter() {
    let policy = RetryPolicy {
        max_attempts: 3,
        ..RetryPolicy::default().without_jitter()
    };
    let fx = fixture(FlakyHandler::failing_times(usize::MAX), policy);

    fx.router.dispatch(&invoice_paid("evt_1")).await.unwrap();

    fx.clock.advance(Duration::from_secs(1));
    fx.sweeper.sweep_once().await.unwrap();
    fx.clock.advance(Duration::from_secs(2));
    fx.sweeper.sweep_once().await.unwrap();

    let stored = fx.store.find(&EventId::new("evt_1")).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::DeadLettered);
    assert_eq!(stored.attempt_count, 3);
    assert_eq!(fx.handler.calls(), 3);

    // Parked events stay put; the sweeper never reclaims them.
    fx.clock.advance(Duration::from_secs(3600));
    assert_eq!(fx.sweeper.sweep_once().await.unwrap(), 0);
}

#[tokio::test]
async fn permanent_failure_dead_letters_immediately() {
    let fx = fixture(FlakyHandler::permanent(), RetryPolicy::default());

    let outcome = fx.router.dispatch(&invoice_paid("evt_1")).await.unwrap();

    assert_eq!(outcome, DispatchOutcome::DeadLettered);
    assert_eq!(fx.handler.calls(), 1);
}

#[tokio::test]
async fn unknown_kind_is_acked_and_recorded() {
    let fx = fixture(FlakyHandler::succeeding(), RetryPolicy::default());
    let event = VerifiedEvent {
        id: EventId::new("evt_odd"),
        provider: "stripe".to_string(),
        kind: EventKind::Unknown("customer.created".to_string()),
        payload: serde_json::json!({"id": "evt_odd", "type": "customer.created"}),
    };

    assert_eq!(fx.router.dispatch(&event).await.unwrap(), DispatchOutcome::Ignored);
    assert_eq!(fx.handler.calls(), 0);

    // Recorded as handled, so a redelivery short-circuits.
    assert_eq!(fx.router.dispatch(&event).await.unwrap(), DispatchOutcome::Duplicate);
}

#[tokio::test]
async fn replayed_event_is_picked_up_by_the_sweeper() {
    let fx = fixture(FlakyHandler::failing_times(1), RetryPolicy {
        max_attempts: 1,
        ..RetryPolicy::default().without_jitter()
    });

    // One attempt allowed: the first failure dead-letters.
    assert_eq!(
        fx.router.dispatch(&invoice_paid("evt_1")).await.unwrap(),
        DispatchOutcome::DeadLettered
    );

    let dlq = DeadLetterQueue::new(Arc::clone(&fx.store), Arc::new(fx.clock.clone()));
    assert_eq!(dlq.list(10).await.unwrap().len(), 1);

    let replayed = dlq.replay(&EventId::new("evt_1")).await.unwrap();
    assert_eq!(replayed.status, EventStatus::Pending);
    assert_eq!(replayed.attempt_count, 0);

    // The handler's failure budget is spent, so the swept attempt succeeds.
    assert_eq!(fx.sweeper.sweep_once().await.unwrap(), 1);
    let stored = fx.store.find(&EventId::new("evt_1")).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Succeeded);
}

#[tokio::test]
async fn sweeper_reclaims_events_abandoned_mid_processing() {
    let fx = fixture(FlakyHandler::succeeding(), RetryPolicy::default().without_jitter());
    let event = invoice_paid("evt_1");

    // A worker claims the event and dies before recording an outcome.
    let record = WebhookEvent::from_verified(&event, fx.clock.now_utc());
    fx.store.insert_new(&record).await.unwrap();
    assert!(fx.store.try_claim(&event.id, fx.clock.now_utc()).await.unwrap());

    // A redelivery sees the live claim and backs off.
    assert_eq!(fx.router.dispatch(&event).await.unwrap(), DispatchOutcome::InFlight);
    assert_eq!(fx.handler.calls(), 0);

    // Inside the visibility window the sweep leaves the claim alone.
    fx.clock.advance(Duration::from_secs(30));
    assert_eq!(fx.sweeper.sweep_once().await.unwrap(), 0);
    assert_eq!(fx.handler.calls(), 0);

    // Past the window the sweep reclaims the event and finishes it.
    fx.clock.advance(Duration::from_secs(31));
    assert_eq!(fx.sweeper.sweep_once().await.unwrap(), 1);
    assert_eq!(fx.handler.calls(), 1);
    let stored = fx.store.find(&event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Succeeded);
}

#[tokio::test]
async fn sweeps_record_queue_depth() {
    let metrics = Arc::new(InMemoryMetrics::new());
    let fx = fixture_with_metrics(
        FlakyHandler::failing_times(usize::MAX),
        RetryPolicy::default().without_jitter(),
        metrics.clone(),
    );

    fx.router.dispatch(&invoice_paid("evt_1")).await.unwrap();
    fx.router.dispatch(&invoice_paid("evt_2")).await.unwrap();
    fx.sweeper.sweep_once().await.unwrap();

    assert_eq!(metrics.last(Metric::QueueDepth), Some(2.0));
    assert!(metrics.count(Metric::Errors(payhook_core::Component::Router)) >= 2);
}
