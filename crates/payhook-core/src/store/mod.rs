//! Storage abstraction for webhook events and batch jobs.
//!
//! Every state transition is expressed as a conditional single-row update:
//! the implementation must verify the stored status matches the expected
//! predecessor and fail with [`CoreError::Conflict`] (or return `false` for
//! the claim operations) when another task won the race. This is the
//! optimistic-concurrency contract that makes the idempotency and
//! at-most-one-active-processing guarantees hold.
//!
//! [`memory`] provides deterministic in-process implementations used across
//! the test suites; [`postgres`] provides the production implementation over
//! the shared connection pool.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    models::{BatchJob, BatchStatus, EventId, ItemOutcome, ItemRef, JobId, WebhookEvent},
};

/// Persistence operations for webhook events.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Inserts a newly received event if its id is not already stored.
    ///
    /// Returns `false` when the id exists (a redelivery); the stored record
    /// is left untouched.
    async fn insert_new(&self, event: &WebhookEvent) -> Result<bool>;

    /// Looks up an event by id.
    async fn find(&self, id: &EventId) -> Result<Option<WebhookEvent>>;

    /// Atomically claims an event: `Pending -> Processing`, stamping
    /// `claimed_at = now`.
    ///
    /// Returns `false` if the event was not in `Pending` (already claimed,
    /// already terminal, or unknown). At most one concurrent caller can
    /// observe `true` for a given id.
    async fn try_claim(&self, id: &EventId, now: DateTime<Utc>) -> Result<bool>;

    /// Records success: `Processing -> Succeeded`.
    async fn mark_succeeded(&self, id: &EventId) -> Result<()>;

    /// Records a failed attempt: `Processing -> Failed`, bumping the
    /// attempt count and storing the error message.
    async fn mark_failed(&self, id: &EventId, attempt_count: i32, last_error: &str) -> Result<()>;

    /// Schedules a retry: `Failed -> Pending` with `next_attempt_at` set.
    async fn schedule_retry(&self, id: &EventId, next_attempt_at: DateTime<Utc>) -> Result<()>;

    /// Gives up on the event: `Failed -> DeadLettered`.
    async fn dead_letter(&self, id: &EventId) -> Result<()>;

    /// Claims up to `limit` events whose scheduled retry is due
    /// (`Pending` with `next_attempt_at <= now`), transitioning each to
    /// `Processing`. Events are returned oldest-due first.
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WebhookEvent>>;

    /// Reclaims up to `limit` events stuck in `Processing` whose claim was
    /// taken at or before `cutoff`, restamping each with `claimed_at = now`.
    /// Oldest claims are reclaimed first.
    ///
    /// A claim that old means the owning task died mid-processing; handing
    /// the event back out is what bounds how long a crash can wedge it.
    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>>;

    /// Manually replays a dead-lettered event: `DeadLettered -> Pending`
    /// with `attempt_count = 0` and `next_attempt_at = now` so the sweeper
    /// re-enters it. Returns the updated record.
    async fn replay(&self, id: &EventId, now: DateTime<Utc>) -> Result<WebhookEvent>;

    /// Lists dead-lettered events for inspection, most recent first.
    async fn list_dead_lettered(&self, limit: usize) -> Result<Vec<WebhookEvent>>;

    /// Number of events currently `Pending` or `Processing`.
    async fn queue_depth(&self) -> Result<u64>;
}

/// Persistence operations for batch jobs.
#[async_trait]
pub trait BatchStore: Send + Sync + 'static {
    /// Persists a newly submitted job in `Running` state.
    async fn create(&self, job: &BatchJob) -> Result<()>;

    /// Returns a point-in-time snapshot of a job, including incremental
    /// progress counters.
    async fn find(&self, id: JobId) -> Result<Option<BatchJob>>;

    /// Records one item's outcome and bumps the progress counters.
    async fn record_item_outcome(
        &self,
        id: JobId,
        item: &ItemRef,
        outcome: ItemOutcome,
    ) -> Result<()>;

    /// Moves a job from `Running` to a terminal status.
    async fn finalize(&self, id: JobId, status: BatchStatus) -> Result<()>;
}
