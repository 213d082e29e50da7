//! HTTP surface tests over the in-memory stores: signature enforcement,
//! idempotent acknowledgement, batch lifecycle, and admin authentication.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use tower::ServiceExt;

use payhook_api::{create_router, crypto::hmac_hex, AppState, Verifier};
use payhook_batch::{BatchConfig, BatchProcessor, ItemError, ItemExecutor};
use payhook_core::{
    BatchOperation, EventId, EventKind, EventStatus, EventStore, HandlerError, ItemRef,
    MemoryBatchStore, MemoryEventStore, NoopMetrics, TestClock, VerifiedEvent, WebhookEvent,
};
use payhook_dispatch::{
    DeadLetterQueue, EventHandler, EventRouter, HandlerRegistry, RetryPolicy,
};

const STRIPE_SECRET: &str = "whsec_test_secret";
const ADMIN_TOKEN: &str = "admin-token-1";

struct CountingHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl EventHandler for CountingHandler {
    async fn handle(&self, _event: &VerifiedEvent) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fails items whose reference starts with `bad_`.
struct PrefixFailExecutor;

#[async_trait]
impl ItemExecutor for PrefixFailExecutor {
    async fn execute(&self, _operation: BatchOperation, item: &ItemRef) -> Result<(), ItemError> {
        if item.as_str().starts_with("bad_") {
            Err(ItemError::new("record rejected"))
        } else {
            Ok(())
        }
    }
}

struct Fixture {
    app: Router,
    store: Arc<MemoryEventStore>,
    handler: Arc<CountingHandler>,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryEventStore::new());
    let batch_store = Arc::new(MemoryBatchStore::new());
    let clock = Arc::new(TestClock::new());
    let metrics = Arc::new(NoopMetrics);
    let handler = Arc::new(CountingHandler { calls: AtomicUsize::new(0) });

    let mut registry = HandlerRegistry::new();
    registry.register(EventKind::InvoicePaid, handler.clone() as Arc<dyn EventHandler>);

    let router = Arc::new(EventRouter::new(
        Arc::clone(&store),
        Arc::new(registry),
        RetryPolicy::default(),
        clock.clone(),
        metrics.clone(),
    ));

    let mut secrets = HashMap::new();
    secrets.insert("stripe".to_string(), STRIPE_SECRET.to_string());

    let state = AppState {
        verifier: Arc::new(Verifier::new(secrets, metrics.clone())),
        router: Arc::clone(&router),
        dead_letters: Arc::new(DeadLetterQueue::new(Arc::clone(&store), clock.clone())),
        batch: Arc::new(BatchProcessor::new(
            batch_store,
            Arc::new(PrefixFailExecutor),
            BatchConfig { max_items: 10, ..BatchConfig::default() },
            clock.clone(),
            metrics,
        )),
        clock,
    };

    Fixture {
        app: create_router(state, ADMIN_TOKEN, Duration::from_secs(5)),
        store,
        handler,
    }
}

fn invoice_body(id: &str) -> String {
    serde_json::json!({
        "id": id,
        "type": "invoice.paid",
        "data": {"object": {"customer": "cus_1"}}
    })
    .to_string()
}

fn signed_webhook(provider: &str, body: &str, secret: &str) -> Request<Body> {
    let signature = format!("sha256={}", hmac_hex(body.as_bytes(), secret).unwrap());
    Request::builder()
        .method("POST")
        .uri(format!("/webhooks/{provider}"))
        .header("content-type", "application/json")
        .header("x-signature", signature)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn valid_delivery_is_processed_and_acked() {
    let fx = fixture();
    let body = invoice_body("evt_1");

    let response = fx.app.clone().oneshot(signed_webhook("stripe", &body, STRIPE_SECRET)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let json = json_body(response).await;
    assert_eq!(json["received"], true);
    assert_eq!(json["event_id"], "evt_1");
    assert_eq!(json["disposition"], "processed");
    assert_eq!(fx.handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalid_signature_is_rejected_without_side_effects() {
    let fx = fixture();
    let body = invoice_body("evt_1");

    let response = fx.app.clone().oneshot(signed_webhook("stripe", &body, "wrong_secret")).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(fx.handler.calls.load(Ordering::SeqCst), 0);
    assert!(fx.store.find(&EventId::new("evt_1")).await.unwrap().is_none());
}

#[tokio::test]
async fn missing_signature_and_unknown_provider_are_rejected() {
    let fx = fixture();
    let body = invoice_body("evt_1");

    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/stripe")
        .body(Body::from(body.clone()))
        .unwrap();
    let response = fx.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = fx.app.clone().oneshot(signed_webhook("github", &body, STRIPE_SECRET)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn redelivery_is_acked_without_reprocessing() {
    let fx = fixture();
    let body = invoice_body("evt_1");

    let first = fx.app.clone().oneshot(signed_webhook("stripe", &body, STRIPE_SECRET)).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = fx.app.clone().oneshot(signed_webhook("stripe", &body, STRIPE_SECRET)).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let json = json_body(second).await;
    assert_eq!(json["disposition"], "duplicate");

    assert_eq!(fx.handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn authenticated_garbage_is_a_bad_request() {
    let fx = fixture();

    let response =
        fx.app.clone().oneshot(signed_webhook("stripe", "not json", STRIPE_SECRET)).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn batch_submits_runs_and_reports_partial_failure() {
    let fx = fixture();

    let request = Request::builder()
        .method("POST")
        .uri("/batch")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({
                "operation": "update_status",
                "items": ["sub_a", "bad_b", "sub_c"]
            })
            .to_string(),
        ))
        .unwrap();
    let response = fx.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = json_body(response).await;
    let job_id = json["job_id"].as_str().unwrap().to_string();

    // Poll until the background driver finishes.
    let mut last = serde_json::Value::Null;
    for _ in 0..400 {
        let request = Request::builder()
            .method("GET")
            .uri(format!("/batch/{job_id}"))
            .body(Body::empty())
            .unwrap();
        let response = fx.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        last = json_body(response).await;
        if last["status"] != "running" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(last["status"], "completed_with_errors");
    assert_eq!(last["processed_count"], 3);
    assert_eq!(last["succeeded_count"], 2);
    assert_eq!(last["failed_count"], 1);
    assert_eq!(last["item_results"]["bad_b"]["error"]["reason"], "record rejected");
}

#[tokio::test]
async fn empty_batch_is_rejected() {
    let fx = fixture();

    let request = Request::builder()
        .method("POST")
        .uri("/batch")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"operation":"export","items":[]}"#.to_string()))
        .unwrap();
    let response = fx.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = json_body(response).await;
    assert_eq!(json["error"]["code"], "invalid_batch");
}

#[tokio::test]
async fn unknown_batch_operation_is_rejected() {
    let fx = fixture();

    let request = Request::builder()
        .method("POST")
        .uri("/batch")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"operation":"reindex","items":["sub_a"]}"#.to_string()))
        .unwrap();
    let response = fx.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = json_body(response).await;
    assert_eq!(json["error"]["code"], "invalid_operation");
}

#[tokio::test]
async fn unknown_batch_job_is_not_found() {
    let fx = fixture();

    let request = Request::builder()
        .method("GET")
        .uri(format!("/batch/{}", uuid::Uuid::new_v4()))
        .body(Body::empty())
        .unwrap();
    let response = fx.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

async fn seed_dead_letter(store: &MemoryEventStore, id: &str) {
    let event = WebhookEvent {
        id: EventId::new(id),
        provider: "stripe".to_string(),
        kind: EventKind::InvoicePaid,
        payload: serde_json::json!({"id": id, "type": "invoice.paid"}),
        received_at: chrono::Utc::now(),
        status: EventStatus::Pending,
        attempt_count: 0,
        next_attempt_at: None,
        claimed_at: None,
        last_error: None,
    };
    store.insert_new(&event).await.unwrap();
    assert!(store.try_claim(&event.id, chrono::Utc::now()).await.unwrap());
    store.mark_failed(&event.id, 6, "gave up").await.unwrap();
    store.dead_letter(&event.id).await.unwrap();
}

#[tokio::test]
async fn dead_letter_admin_requires_bearer_token() {
    let fx = fixture();
    seed_dead_letter(&fx.store, "evt_dead").await;

    // No token.
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/dead-letter/evt_dead/replay")
        .body(Body::empty())
        .unwrap();
    let response = fx.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Wrong token.
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/dead-letter/evt_dead/replay")
        .header("authorization", "Bearer nope")
        .body(Body::empty())
        .unwrap();
    let response = fx.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // The event is untouched.
    let stored = fx.store.find(&EventId::new("evt_dead")).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::DeadLettered);
}

#[tokio::test]
async fn dead_letter_list_and_replay_roundtrip() {
    let fx = fixture();
    seed_dead_letter(&fx.store, "evt_dead").await;

    let request = Request::builder()
        .method("GET")
        .uri("/webhooks/dead-letter?limit=10")
        .header("authorization", format!("Bearer {ADMIN_TOKEN}"))
        .body(Body::empty())
        .unwrap();
    let response = fx.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json.as_array().unwrap().len(), 1);
    assert_eq!(json[0]["event_id"], "evt_dead");
    assert_eq!(json[0]["last_error"], "gave up");

    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/dead-letter/evt_dead/replay")
        .header("authorization", format!("Bearer {ADMIN_TOKEN}"))
        .body(Body::empty())
        .unwrap();
    let response = fx.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let stored = fx.store.find(&EventId::new("evt_dead")).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Pending);
    assert_eq!(stored.attempt_count, 0);
}

#[tokio::test]
async fn replaying_a_live_event_conflicts() {
    let fx = fixture();
    let body = invoice_body("evt_live");
    fx.app.clone().oneshot(signed_webhook("stripe", &body, STRIPE_SECRET)).await.unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/dead-letter/evt_live/replay")
        .header("authorization", format!("Bearer {ADMIN_TOKEN}"))
        .body(Body::empty())
        .unwrap();
    let response = fx.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn health_endpoints_respond() {
    let fx = fixture();

    for uri in ["/health", "/ready", "/live"] {
        let request = Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap();
        let response = fx.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{uri} should be OK");
    }
}
