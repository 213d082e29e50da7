//! Error taxonomy for webhook and batch processing.
//!
//! Failures split into four families with different propagation rules:
//! verification failures are rejected at the boundary and never retried,
//! transient failures are retried with backoff, permanent failures are
//! dead-lettered immediately, and batch item failures stay isolated to
//! their item. Verification and item errors live with their components
//! (`payhook-api`, `payhook-batch`); this module defines the storage-level
//! and handler-level halves.

use thiserror::Error;

/// Result type alias using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Storage-level error type.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A conditional status transition did not match the stored row.
    ///
    /// Signals that another task already moved the record, never corrupt
    /// state; callers treat it as losing an optimistic-concurrency race.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backing store is temporarily unreachable (pool exhausted,
    /// connection refused). Retryable by the caller's own retry logic.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Whether a later retry of the same operation could succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::Conflict(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => {
                Self::Unavailable(err.to_string())
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<payhook_pool::PoolError> for CoreError {
    fn from(err: payhook_pool::PoolError) -> Self {
        if err.is_transient() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Database(err.to_string())
        }
    }
}

/// Error returned by a business event handler.
///
/// The variant decides the event's fate: `Transient` hands it to the retry
/// subsystem (backoff, then dead-letter once attempts are exhausted),
/// `Permanent` dead-letters it immediately with no retries.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// A downstream dependency failed in a way that may heal.
    #[error("transient handler failure: {0}")]
    Transient(String),

    /// The event itself is invalid for this business state; retrying can
    /// never succeed.
    #[error("permanent handler failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    /// Whether the retry subsystem should schedule another attempt.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Convenience constructor for transient failures.
    pub fn transient(reason: impl std::fmt::Display) -> Self {
        Self::Transient(reason.to_string())
    }

    /// Convenience constructor for permanent failures.
    pub fn permanent(reason: impl std::fmt::Display) -> Self {
        Self::Permanent(reason.to_string())
    }
}
