//! PostgreSQL store implementations over the shared connection pool.
//!
//! Every transition is a single `UPDATE ... WHERE status = <expected>`
//! checked via `rows_affected`, and the sweeper's claim uses
//! `FOR UPDATE SKIP LOCKED` so concurrent sweeps never contend on the same
//! rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Connection, Row};

use payhook_pool::{PgConnector, Pool};

use crate::{
    error::{CoreError, Result},
    models::{
        BatchJob, BatchOperation, BatchStatus, EventId, EventKind, ItemOutcome, ItemRef, JobId,
        WebhookEvent,
    },
    store::{BatchStore, EventStore},
};

/// Creates the tables and indexes this core owns.
pub async fn ensure_schema(pool: &Pool<PgConnector>) -> Result<()> {
    let mut conn = pool.acquire().await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS webhook_events (
            id TEXT PRIMARY KEY,
            provider TEXT NOT NULL,
            kind TEXT NOT NULL,
            payload JSONB NOT NULL,
            received_at TIMESTAMPTZ NOT NULL,
            status TEXT NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            next_attempt_at TIMESTAMPTZ,
            claimed_at TIMESTAMPTZ,
            last_error TEXT
        )
        ",
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_webhook_events_due
        ON webhook_events(next_attempt_at)
        WHERE status = 'pending'
        ",
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_webhook_events_claimed
        ON webhook_events(claimed_at)
        WHERE status = 'processing'
        ",
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS batch_jobs (
            id UUID PRIMARY KEY,
            operation TEXT NOT NULL,
            status TEXT NOT NULL,
            processed_count INTEGER NOT NULL DEFAULT 0,
            succeeded_count INTEGER NOT NULL DEFAULT 0,
            failed_count INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL
        )
        ",
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS batch_items (
            job_id UUID NOT NULL REFERENCES batch_jobs(id),
            item_ref TEXT NOT NULL,
            position INTEGER NOT NULL,
            outcome TEXT,
            error TEXT,
            PRIMARY KEY (job_id, item_ref)
        )
        ",
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS subscription_state (
            customer_ref TEXT PRIMARY KEY,
            subscription_ref TEXT,
            state TEXT NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        ",
    )
    .execute(&mut *conn)
    .await?;

    Ok(())
}

fn event_from_row(row: &PgRow) -> Result<WebhookEvent> {
    let status: String = row.try_get("status").map_err(CoreError::from)?;
    let kind: String = row.try_get("kind").map_err(CoreError::from)?;
    Ok(WebhookEvent {
        id: EventId(row.try_get::<String, _>("id").map_err(CoreError::from)?),
        provider: row.try_get("provider").map_err(CoreError::from)?,
        kind: EventKind::from(kind.as_str()),
        payload: row.try_get("payload").map_err(CoreError::from)?,
        received_at: row.try_get("received_at").map_err(CoreError::from)?,
        status: status.parse().map_err(CoreError::Database)?,
        attempt_count: row.try_get("attempt_count").map_err(CoreError::from)?,
        next_attempt_at: row.try_get("next_attempt_at").map_err(CoreError::from)?,
        claimed_at: row.try_get("claimed_at").map_err(CoreError::from)?,
        last_error: row.try_get("last_error").map_err(CoreError::from)?,
    })
}

const EVENT_COLUMNS: &str = "id, provider, kind, payload, received_at, status, attempt_count, \
                             next_attempt_at, claimed_at, last_error";

/// [`EventStore`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PgEventStore {
    pool: Pool<PgConnector>,
}

impl PgEventStore {
    /// Creates a store over the shared pool.
    pub fn new(pool: Pool<PgConnector>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn insert_new(&self, event: &WebhookEvent) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query(
            r"
            INSERT INTO webhook_events
                (id, provider, kind, payload, received_at, status, attempt_count,
                 next_attempt_at, claimed_at, last_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(event.id.as_str())
        .bind(&event.provider)
        .bind(event.kind.as_str())
        .bind(&event.payload)
        .bind(event.received_at)
        .bind(event.status.as_str())
        .bind(event.attempt_count)
        .bind(event.next_attempt_at)
        .bind(event.claimed_at)
        .bind(&event.last_error)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find(&self, id: &EventId) -> Result<Option<WebhookEvent>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM webhook_events WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn try_claim(&self, id: &EventId, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query(
            r"
            UPDATE webhook_events
            SET status = 'processing', next_attempt_at = NULL, claimed_at = $2
            WHERE id = $1 AND status = 'pending'
            ",
        )
        .bind(id.as_str())
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_succeeded(&self, id: &EventId) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query(
            r"
            UPDATE webhook_events
            SET status = 'succeeded', next_attempt_at = NULL, claimed_at = NULL
            WHERE id = $1 AND status = 'processing'
            ",
        )
        .bind(id.as_str())
        .execute(&mut *conn)
        .await?;
        expect_one(result.rows_affected(), || format!("event {id} was not processing"))
    }

    async fn mark_failed(&self, id: &EventId, attempt_count: i32, last_error: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query(
            r"
            UPDATE webhook_events
            SET status = 'failed', attempt_count = $2, last_error = $3, claimed_at = NULL
            WHERE id = $1 AND status = 'processing'
            ",
        )
        .bind(id.as_str())
        .bind(attempt_count)
        .bind(last_error)
        .execute(&mut *conn)
        .await?;
        expect_one(result.rows_affected(), || format!("event {id} was not processing"))
    }

    async fn schedule_retry(&self, id: &EventId, next_attempt_at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query(
            r"
            UPDATE webhook_events
            SET status = 'pending', next_attempt_at = $2
            WHERE id = $1 AND status = 'failed'
            ",
        )
        .bind(id.as_str())
        .bind(next_attempt_at)
        .execute(&mut *conn)
        .await?;
        expect_one(result.rows_affected(), || format!("event {id} was not failed"))
    }

    async fn dead_letter(&self, id: &EventId) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query(
            r"
            UPDATE webhook_events
            SET status = 'dead_lettered', next_attempt_at = NULL
            WHERE id = $1 AND status = 'failed'
            ",
        )
        .bind(id.as_str())
        .execute(&mut *conn)
        .await?;
        expect_one(result.rows_affected(), || format!("event {id} was not failed"))
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WebhookEvent>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&format!(
            r"
            UPDATE webhook_events
            SET status = 'processing', next_attempt_at = NULL, claimed_at = $1
            WHERE id IN (
                SELECT id FROM webhook_events
                WHERE status = 'pending' AND next_attempt_at <= $1
                ORDER BY next_attempt_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {EVENT_COLUMNS}
            "
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&format!(
            r"
            UPDATE webhook_events
            SET claimed_at = $1
            WHERE id IN (
                SELECT id FROM webhook_events
                WHERE status = 'processing' AND claimed_at <= $2
                ORDER BY claimed_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {EVENT_COLUMNS}
            "
        ))
        .bind(now)
        .bind(cutoff)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn replay(&self, id: &EventId, now: DateTime<Utc>) -> Result<WebhookEvent> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&format!(
            r"
            UPDATE webhook_events
            SET status = 'pending', attempt_count = 0, next_attempt_at = $2,
                claimed_at = NULL, last_error = NULL
            WHERE id = $1 AND status = 'dead_lettered'
            RETURNING {EVENT_COLUMNS}
            "
        ))
        .bind(id.as_str())
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => event_from_row(&row),
            None => {
                // Distinguish "no such event" from "not dead-lettered".
                let current = sqlx::query("SELECT status FROM webhook_events WHERE id = $1")
                    .bind(id.as_str())
                    .fetch_optional(&mut *conn)
                    .await?;
                match current {
                    Some(row) => {
                        let status: String = row.try_get("status").map_err(CoreError::from)?;
                        Err(CoreError::Conflict(format!(
                            "event {id} is {status}, only dead_lettered events can be replayed"
                        )))
                    },
                    None => Err(CoreError::NotFound(format!("event {id} not found"))),
                }
            },
        }
    }

    async fn list_dead_lettered(&self, limit: usize) -> Result<Vec<WebhookEvent>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&format!(
            r"
            SELECT {EVENT_COLUMNS} FROM webhook_events
            WHERE status = 'dead_lettered'
            ORDER BY received_at DESC
            LIMIT $1
            "
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn queue_depth(&self) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            "SELECT COUNT(*) AS depth FROM webhook_events WHERE status IN ('pending', 'processing')",
        )
        .fetch_one(&mut *conn)
        .await?;
        let depth: i64 = row.try_get("depth").map_err(CoreError::from)?;
        Ok(u64::try_from(depth).unwrap_or(0))
    }
}

fn expect_one(rows_affected: u64, conflict: impl FnOnce() -> String) -> Result<()> {
    if rows_affected == 1 {
        Ok(())
    } else {
        Err(CoreError::Conflict(conflict()))
    }
}

/// [`BatchStore`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PgBatchStore {
    pool: Pool<PgConnector>,
}

impl PgBatchStore {
    /// Creates a store over the shared pool.
    pub fn new(pool: Pool<PgConnector>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BatchStore for PgBatchStore {
    async fn create(&self, job: &BatchJob) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await.map_err(CoreError::from)?;

        sqlx::query(
            r"
            INSERT INTO batch_jobs
                (id, operation, status, processed_count, succeeded_count, failed_count, created_at)
            VALUES ($1, $2, $3, 0, 0, 0, $4)
            ",
        )
        .bind(job.id.0)
        .bind(job.operation.as_str())
        .bind(job.status.as_str())
        .bind(job.created_at)
        .execute(&mut *tx)
        .await?;

        for (position, item) in job.items.iter().enumerate() {
            sqlx::query(
                "INSERT INTO batch_items (job_id, item_ref, position) VALUES ($1, $2, $3)",
            )
            .bind(job.id.0)
            .bind(item.as_str())
            .bind(i32::try_from(position).unwrap_or(i32::MAX))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.map_err(CoreError::from)?;
        Ok(())
    }

    async fn find(&self, id: JobId) -> Result<Option<BatchJob>> {
        let mut conn = self.pool.acquire().await?;

        let Some(job_row) = sqlx::query(
            r"
            SELECT operation, status, processed_count, succeeded_count, failed_count, created_at
            FROM batch_jobs WHERE id = $1
            ",
        )
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await?
        else {
            return Ok(None);
        };

        let item_rows = sqlx::query(
            "SELECT item_ref, outcome, error FROM batch_items WHERE job_id = $1 ORDER BY position",
        )
        .bind(id.0)
        .fetch_all(&mut *conn)
        .await?;

        let operation: String = job_row.try_get("operation").map_err(CoreError::from)?;
        let status: String = job_row.try_get("status").map_err(CoreError::from)?;

        let mut items = Vec::with_capacity(item_rows.len());
        let mut item_results = std::collections::HashMap::new();
        for row in &item_rows {
            let item = ItemRef(row.try_get::<String, _>("item_ref").map_err(CoreError::from)?);
            let outcome: Option<String> = row.try_get("outcome").map_err(CoreError::from)?;
            if let Some(outcome) = outcome {
                let result = if outcome == "success" {
                    ItemOutcome::Success
                } else {
                    let reason: Option<String> = row.try_get("error").map_err(CoreError::from)?;
                    ItemOutcome::Error { reason: reason.unwrap_or_default() }
                };
                item_results.insert(item.clone(), result);
            }
            items.push(item);
        }

        Ok(Some(BatchJob {
            id,
            operation: operation
                .parse::<BatchOperation>()
                .map_err(CoreError::Database)?,
            items,
            processed_count: fetch_count(&job_row, "processed_count")?,
            succeeded_count: fetch_count(&job_row, "succeeded_count")?,
            failed_count: fetch_count(&job_row, "failed_count")?,
            item_results,
            status: status.parse::<BatchStatus>().map_err(CoreError::Database)?,
            created_at: job_row.try_get("created_at").map_err(CoreError::from)?,
        }))
    }

    async fn record_item_outcome(
        &self,
        id: JobId,
        item: &ItemRef,
        outcome: ItemOutcome,
    ) -> Result<()> {
        let (outcome_str, error) = match &outcome {
            ItemOutcome::Success => ("success", None),
            ItemOutcome::Error { reason } => ("error", Some(reason.clone())),
        };

        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await.map_err(CoreError::from)?;

        let updated = sqlx::query(
            r"
            UPDATE batch_items SET outcome = $3, error = $4
            WHERE job_id = $1 AND item_ref = $2 AND outcome IS NULL
            ",
        )
        .bind(id.0)
        .bind(item.as_str())
        .bind(outcome_str)
        .bind(&error)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() != 1 {
            return Err(CoreError::Conflict(format!(
                "item {item} of job {id} already recorded or unknown"
            )));
        }

        sqlx::query(
            r"
            UPDATE batch_jobs
            SET processed_count = processed_count + 1,
                succeeded_count = succeeded_count + CASE WHEN $2 THEN 1 ELSE 0 END,
                failed_count = failed_count + CASE WHEN $2 THEN 0 ELSE 1 END
            WHERE id = $1
            ",
        )
        .bind(id.0)
        .bind(outcome.is_success())
        .execute(&mut *tx)
        .await?;

        tx.commit().await.map_err(CoreError::from)?;
        Ok(())
    }

    async fn finalize(&self, id: JobId, status: BatchStatus) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query(
            "UPDATE batch_jobs SET status = $2 WHERE id = $1 AND status = 'running'",
        )
        .bind(id.0)
        .bind(status.as_str())
        .execute(&mut *conn)
        .await?;
        expect_one(result.rows_affected(), || format!("job {id} is not running"))
    }
}

fn fetch_count(row: &PgRow, column: &str) -> Result<u32> {
    let value: i32 = row.try_get(column).map_err(CoreError::from)?;
    Ok(u32::try_from(value).unwrap_or(0))
}
