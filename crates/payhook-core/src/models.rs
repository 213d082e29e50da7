//! Domain models and strongly-typed identifiers.
//!
//! Defines webhook events, batch jobs, and the status state machines both
//! follow. Status transitions are validated here and enforced as single-row
//! conditional updates in the storage layer, so no component ever performs a
//! read-then-blind-write.

use std::{collections::HashMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Provider-assigned event identifier.
///
/// This is the natural idempotency key: the payment provider guarantees it
/// is unique per event, and redeliveries of the same event carry the same
/// id. It is a string rather than a UUID because providers choose their own
/// formats (e.g. `evt_1NXWPnCZ6qsJgndJ`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    /// Wraps a provider-assigned identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Known billing event types, plus a catch-all for types this service does
/// not handle.
///
/// Routing is a static mapping from `EventKind` to a registered handler;
/// `Unknown` kinds are acknowledged (so the provider stops retrying) but
/// only logged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// An invoice was paid in full.
    InvoicePaid,
    /// An invoice payment attempt failed.
    InvoicePaymentFailed,
    /// A subscription was created.
    SubscriptionCreated,
    /// A subscription changed plan, quantity, or billing period.
    SubscriptionUpdated,
    /// A subscription was canceled.
    SubscriptionCanceled,
    /// A charge was refunded.
    ChargeRefunded,
    /// Any event type without a registered handler.
    Unknown(String),
}

impl EventKind {
    /// Returns the provider wire name for this kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::InvoicePaid => "invoice.paid",
            Self::InvoicePaymentFailed => "invoice.payment_failed",
            Self::SubscriptionCreated => "subscription.created",
            Self::SubscriptionUpdated => "subscription.updated",
            Self::SubscriptionCanceled => "subscription.canceled",
            Self::ChargeRefunded => "charge.refunded",
            Self::Unknown(other) => other,
        }
    }

    /// Whether this service knows the event type.
    pub const fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl From<&str> for EventKind {
    fn from(value: &str) -> Self {
        match value {
            "invoice.paid" => Self::InvoicePaid,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            "subscription.created" => Self::SubscriptionCreated,
            "subscription.updated" => Self::SubscriptionUpdated,
            "subscription.canceled" => Self::SubscriptionCanceled,
            "charge.refunded" => Self::ChargeRefunded,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from(raw.as_str()))
    }
}

/// Webhook event lifecycle status.
///
/// The machine is `Pending -> Processing -> {Succeeded | Failed}` and
/// `Failed -> {Pending | DeadLettered}` (retry scheduled, or retries
/// exhausted / permanent rejection). `Succeeded` and `DeadLettered` are
/// terminal, except that a dead-lettered event may be manually replayed
/// back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Awaiting processing (first receipt or scheduled retry).
    Pending,
    /// Claimed by exactly one task.
    Processing,
    /// Handler side effects applied; redeliveries are no-ops.
    Succeeded,
    /// Last attempt failed; awaiting a retry decision.
    Failed,
    /// Retries exhausted or permanently rejected; awaiting manual review.
    DeadLettered,
}

impl EventStatus {
    /// Returns the storage representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
        }
    }

    /// Whether the event has reached a resting state.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::DeadLettered)
    }

    /// Validates a state machine transition.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Succeeded)
                | (Self::Processing, Self::Failed)
                | (Self::Failed, Self::Pending)
                | (Self::Failed, Self::DeadLettered)
                | (Self::DeadLettered, Self::Pending)
        )
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "dead_lettered" => Ok(Self::DeadLettered),
            other => Err(format!("unknown event status: {other}")),
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted webhook event and its processing state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Provider-assigned unique identifier (idempotency key).
    pub id: EventId,

    /// Which provider delivered the event (path segment of the ingress URL).
    pub provider: String,

    /// Parsed event type; drives handler routing.
    pub kind: EventKind,

    /// The provider's event body, opaque to the router.
    pub payload: serde_json::Value,

    /// When the event was first received.
    pub received_at: DateTime<Utc>,

    /// Current lifecycle status.
    pub status: EventStatus,

    /// Completed processing attempts.
    pub attempt_count: i32,

    /// When the next retry becomes due. Set only while a retry is scheduled.
    pub next_attempt_at: Option<DateTime<Utc>>,

    /// When the current `Processing` claim was taken. A claim older than
    /// the sweeper's visibility timeout is treated as abandoned (the owning
    /// task died) and handed back out.
    pub claimed_at: Option<DateTime<Utc>>,

    /// Message from the most recent failure.
    pub last_error: Option<String>,
}

impl WebhookEvent {
    /// Creates a pending event from a verified delivery.
    pub fn from_verified(event: &VerifiedEvent, received_at: DateTime<Utc>) -> Self {
        Self {
            id: event.id.clone(),
            provider: event.provider.clone(),
            kind: event.kind.clone(),
            payload: event.payload.clone(),
            received_at,
            status: EventStatus::Pending,
            attempt_count: 0,
            next_attempt_at: None,
            claimed_at: None,
            last_error: None,
        }
    }

    /// Rebuilds the verified view of a stored event for re-dispatch.
    pub fn to_verified(&self) -> VerifiedEvent {
        VerifiedEvent {
            id: self.id.clone(),
            provider: self.provider.clone(),
            kind: self.kind.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// A webhook event whose signature has been verified and whose body has
/// been parsed.
///
/// Construction happens only in the verifier, after the HMAC check passed,
/// so downstream code never touches unauthenticated input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedEvent {
    /// Provider-assigned unique identifier.
    pub id: EventId,
    /// Delivering provider.
    pub provider: String,
    /// Parsed event type.
    pub kind: EventKind,
    /// The event body.
    pub payload: serde_json::Value,
}

/// Strongly-typed batch job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Reference to a record targeted by a batch operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemRef(pub String);

impl ItemRef {
    /// Wraps a record reference.
    pub fn new(item: impl Into<String>) -> Self {
        Self(item.into())
    }

    /// Returns the reference as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bulk operations the batch processor can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOperation {
    /// Recompute and persist the status of each referenced record.
    UpdateStatus,
    /// Soft-delete each referenced record.
    Delete,
    /// Export each referenced record to the configured sink.
    Export,
}

impl BatchOperation {
    /// Returns the wire/storage representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UpdateStatus => "update_status",
            Self::Delete => "delete",
            Self::Export => "export",
        }
    }
}

impl FromStr for BatchOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "update_status" => Ok(Self::UpdateStatus),
            "delete" => Ok(Self::Delete),
            "export" => Ok(Self::Export),
            other => Err(format!("unknown batch operation: {other}")),
        }
    }
}

impl fmt::Display for BatchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single batch item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    /// The operation was applied to this item.
    Success,
    /// The operation failed for this item; the batch continued.
    Error {
        /// Why the item failed.
        reason: String,
    },
}

impl ItemOutcome {
    /// Whether the item succeeded.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Batch job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Items are being processed.
    Running,
    /// Every item succeeded.
    Completed,
    /// The job finished but some items failed.
    CompletedWithErrors,
    /// The job could not run at all.
    Failed,
}

impl BatchStatus {
    /// Returns the storage representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Failed => "failed",
        }
    }

    /// Whether the job has finished.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "completed_with_errors" => Ok(Self::CompletedWithErrors),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown batch status: {other}")),
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bulk operation over a bounded list of record references.
///
/// Progress counters update incrementally as items complete, so a status
/// poll observes real-time completion rather than only the terminal state.
/// `processed_count` never exceeds `items.len()` and the job reaches a
/// terminal status only after every item has been attempted exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    /// Unique job identifier.
    pub id: JobId,

    /// The operation applied to every item.
    pub operation: BatchOperation,

    /// Ordered list of target records.
    pub items: Vec<ItemRef>,

    /// Items attempted so far.
    pub processed_count: u32,

    /// Items that succeeded.
    pub succeeded_count: u32,

    /// Items that failed.
    pub failed_count: u32,

    /// Per-item outcomes, keyed by item reference.
    pub item_results: HashMap<ItemRef, ItemOutcome>,

    /// Current job status.
    pub status: BatchStatus,

    /// When the job was submitted.
    pub created_at: DateTime<Utc>,
}

impl BatchJob {
    /// Creates a running job with empty progress.
    pub fn new(operation: BatchOperation, items: Vec<ItemRef>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            operation,
            items,
            processed_count: 0,
            succeeded_count: 0,
            failed_count: 0,
            item_results: HashMap::new(),
            status: BatchStatus::Running,
            created_at,
        }
    }

    /// The terminal status the job should reach given its failure count.
    pub const fn terminal_status(&self) -> BatchStatus {
        if self.failed_count == 0 {
            BatchStatus::Completed
        } else {
            BatchStatus::CompletedWithErrors
        }
    }

    /// Completion fraction in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.items.is_empty() {
            return 1.0;
        }
        f64::from(self.processed_count) / self.items.len() as f64
    }
}
