//! In-memory store implementations.
//!
//! Enforce exactly the same conditional-transition semantics as the
//! PostgreSQL implementations so concurrency properties (single claim,
//! idempotent redelivery, replay) can be tested without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::{
    error::{CoreError, Result},
    models::{BatchJob, BatchStatus, EventId, EventStatus, ItemOutcome, ItemRef, JobId, WebhookEvent},
    store::{BatchStore, EventStore},
};

/// In-memory [`EventStore`].
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: Mutex<HashMap<EventId, WebhookEvent>>,
}

impl MemoryEventStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: number of stored events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Test helper: whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert_new(&self, event: &WebhookEvent) -> Result<bool> {
        let mut events = self.events.lock();
        if events.contains_key(&event.id) {
            return Ok(false);
        }
        events.insert(event.id.clone(), event.clone());
        Ok(true)
    }

    async fn find(&self, id: &EventId) -> Result<Option<WebhookEvent>> {
        Ok(self.events.lock().get(id).cloned())
    }

    async fn try_claim(&self, id: &EventId, now: DateTime<Utc>) -> Result<bool> {
        let mut events = self.events.lock();
        match events.get_mut(id) {
            Some(event) if event.status == EventStatus::Pending => {
                event.status = EventStatus::Processing;
                event.next_attempt_at = None;
                event.claimed_at = Some(now);
                Ok(true)
            },
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn mark_succeeded(&self, id: &EventId) -> Result<()> {
        self.transition(id, EventStatus::Processing, |event| {
            event.status = EventStatus::Succeeded;
            event.next_attempt_at = None;
            event.claimed_at = None;
        })
    }

    async fn mark_failed(&self, id: &EventId, attempt_count: i32, last_error: &str) -> Result<()> {
        self.transition(id, EventStatus::Processing, |event| {
            event.status = EventStatus::Failed;
            event.attempt_count = attempt_count;
            event.last_error = Some(last_error.to_string());
            event.claimed_at = None;
        })
    }

    async fn schedule_retry(&self, id: &EventId, next_attempt_at: DateTime<Utc>) -> Result<()> {
        self.transition(id, EventStatus::Failed, |event| {
            event.status = EventStatus::Pending;
            event.next_attempt_at = Some(next_attempt_at);
        })
    }

    async fn dead_letter(&self, id: &EventId) -> Result<()> {
        self.transition(id, EventStatus::Failed, |event| {
            event.status = EventStatus::DeadLettered;
            event.next_attempt_at = None;
        })
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WebhookEvent>> {
        let mut events = self.events.lock();
        let mut due: Vec<&WebhookEvent> = events
            .values()
            .filter(|e| {
                e.status == EventStatus::Pending
                    && e.next_attempt_at.is_some_and(|at| at <= now)
            })
            .collect();
        due.sort_by_key(|e| e.next_attempt_at);
        let ids: Vec<EventId> = due.into_iter().take(limit).map(|e| e.id.clone()).collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(event) = events.get_mut(&id) {
                event.status = EventStatus::Processing;
                event.next_attempt_at = None;
                event.claimed_at = Some(now);
                claimed.push(event.clone());
            }
        }
        Ok(claimed)
    }

    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>> {
        let mut events = self.events.lock();
        let mut stale: Vec<&WebhookEvent> = events
            .values()
            .filter(|e| {
                e.status == EventStatus::Processing
                    && e.claimed_at.is_some_and(|at| at <= cutoff)
            })
            .collect();
        stale.sort_by_key(|e| e.claimed_at);
        let ids: Vec<EventId> = stale.into_iter().take(limit).map(|e| e.id.clone()).collect();

        let mut reclaimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(event) = events.get_mut(&id) {
                event.claimed_at = Some(now);
                reclaimed.push(event.clone());
            }
        }
        Ok(reclaimed)
    }

    async fn replay(&self, id: &EventId, now: DateTime<Utc>) -> Result<WebhookEvent> {
        let mut events = self.events.lock();
        let event = events
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(format!("event {id} not found")))?;
        if event.status != EventStatus::DeadLettered {
            return Err(CoreError::Conflict(format!(
                "event {id} is {}, only dead_lettered events can be replayed",
                event.status
            )));
        }
        event.status = EventStatus::Pending;
        event.attempt_count = 0;
        event.next_attempt_at = Some(now);
        event.claimed_at = None;
        event.last_error = None;
        Ok(event.clone())
    }

    async fn list_dead_lettered(&self, limit: usize) -> Result<Vec<WebhookEvent>> {
        let events = self.events.lock();
        let mut dead: Vec<WebhookEvent> = events
            .values()
            .filter(|e| e.status == EventStatus::DeadLettered)
            .cloned()
            .collect();
        dead.sort_by_key(|e| std::cmp::Reverse(e.received_at));
        dead.truncate(limit);
        Ok(dead)
    }

    async fn queue_depth(&self) -> Result<u64> {
        let events = self.events.lock();
        Ok(events
            .values()
            .filter(|e| matches!(e.status, EventStatus::Pending | EventStatus::Processing))
            .count() as u64)
    }
}

impl MemoryEventStore {
    fn transition(
        &self,
        id: &EventId,
        expected: EventStatus,
        apply: impl FnOnce(&mut WebhookEvent),
    ) -> Result<()> {
        let mut events = self.events.lock();
        let event = events
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(format!("event {id} not found")))?;
        if event.status != expected {
            return Err(CoreError::Conflict(format!(
                "event {id} is {}, expected {expected}",
                event.status
            )));
        }
        apply(event);
        Ok(())
    }
}

/// In-memory [`BatchStore`].
#[derive(Debug, Default)]
pub struct MemoryBatchStore {
    jobs: Mutex<HashMap<JobId, BatchJob>>,
}

impl MemoryBatchStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchStore for MemoryBatchStore {
    async fn create(&self, job: &BatchJob) -> Result<()> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job.id) {
            return Err(CoreError::Conflict(format!("job {} already exists", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn find(&self, id: JobId) -> Result<Option<BatchJob>> {
        Ok(self.jobs.lock().get(&id).cloned())
    }

    async fn record_item_outcome(
        &self,
        id: JobId,
        item: &ItemRef,
        outcome: ItemOutcome,
    ) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let job =
            jobs.get_mut(&id).ok_or_else(|| CoreError::NotFound(format!("job {id} not found")))?;
        if job.item_results.contains_key(item) {
            return Err(CoreError::Conflict(format!("item {item} already recorded")));
        }
        job.processed_count += 1;
        if outcome.is_success() {
            job.succeeded_count += 1;
        } else {
            job.failed_count += 1;
        }
        job.item_results.insert(item.clone(), outcome);
        Ok(())
    }

    async fn finalize(&self, id: JobId, status: BatchStatus) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let job =
            jobs.get_mut(&id).ok_or_else(|| CoreError::NotFound(format!("job {id} not found")))?;
        if job.status != BatchStatus::Running {
            return Err(CoreError::Conflict(format!("job {id} is already {}", job.status)));
        }
        job.status = status;
        Ok(())
    }
}
