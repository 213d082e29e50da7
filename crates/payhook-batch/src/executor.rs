//! Item execution: the operation applied to one record.

use async_trait::async_trait;
use sqlx::Connection;
use thiserror::Error;
use tracing::info;

use payhook_core::{BatchOperation, ItemRef};
use payhook_pool::{PgConnector, Pool};

/// Failure of a single batch item. Stays isolated to that item.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ItemError(pub String);

impl ItemError {
    /// Creates an item error from any displayable cause.
    pub fn new(reason: impl std::fmt::Display) -> Self {
        Self(reason.to_string())
    }
}

/// Applies one batch operation to one record.
#[async_trait]
pub trait ItemExecutor: Send + Sync + 'static {
    /// Executes `operation` against the referenced record.
    async fn execute(
        &self,
        operation: BatchOperation,
        item: &ItemRef,
    ) -> Result<(), ItemError>;
}

/// Production executor over the billing tables.
#[derive(Debug, Clone)]
pub struct BillingItemExecutor {
    pool: Pool<PgConnector>,
}

impl BillingItemExecutor {
    /// Creates an executor over the shared pool.
    pub fn new(pool: Pool<PgConnector>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ItemExecutor for BillingItemExecutor {
    async fn execute(&self, operation: BatchOperation, item: &ItemRef) -> Result<(), ItemError> {
        let mut conn = self.pool.acquire().await.map_err(ItemError::new)?;

        match operation {
            BatchOperation::UpdateStatus => {
                let result = sqlx::query(
                    "UPDATE subscription_state SET updated_at = NOW() WHERE customer_ref = $1",
                )
                .bind(item.as_str())
                .execute(&mut *conn)
                .await
                .map_err(ItemError::new)?;
                if result.rows_affected() == 0 {
                    return Err(ItemError::new(format!("record {item} not found")));
                }
            },
            BatchOperation::Delete => {
                let mut tx = conn.begin().await.map_err(ItemError::new)?;
                let result = sqlx::query(
                    r"
                    UPDATE subscription_state
                    SET state = 'deleted', updated_at = NOW()
                    WHERE customer_ref = $1 AND state <> 'deleted'
                    ",
                )
                .bind(item.as_str())
                .execute(&mut *tx)
                .await
                .map_err(ItemError::new)?;
                if result.rows_affected() == 0 {
                    return Err(ItemError::new(format!("record {item} not found or already deleted")));
                }
                tx.commit().await.map_err(ItemError::new)?;
            },
            BatchOperation::Export => {
                let row = sqlx::query(
                    "SELECT state FROM subscription_state WHERE customer_ref = $1",
                )
                .bind(item.as_str())
                .fetch_optional(&mut *conn)
                .await
                .map_err(ItemError::new)?;
                match row {
                    Some(_) => info!(item = %item, "record exported"),
                    None => return Err(ItemError::new(format!("record {item} not found"))),
                }
            },
        }

        Ok(())
    }
}
