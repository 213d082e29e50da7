//! Pool error types.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using [`PoolError`].
pub type Result<T> = std::result::Result<T, PoolError>;

/// Error raised by a [`Connector`](crate::Connector) implementation.
#[derive(Debug, Clone, Error)]
#[error("connection error: {0}")]
pub struct ConnectError(pub String);

impl ConnectError {
    /// Creates a connect error from any displayable cause.
    pub fn new(cause: impl std::fmt::Display) -> Self {
        Self(cause.to_string())
    }
}

/// Errors surfaced by pool operations.
///
/// `AcquireTimeout` is the typed exhaustion signal required by the pool
/// contract: callers must not retry acquisition silently but propagate the
/// failure into their own retry logic (webhook retry scheduling or batch
/// item failure).
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool was at capacity and no connection was released in time.
    #[error("timed out after {waited:?} waiting for a pooled connection")]
    AcquireTimeout {
        /// How long the caller waited before giving up.
        waited: Duration,
    },

    /// Opening a new connection failed.
    #[error("failed to open connection: {0}")]
    Connect(#[from] ConnectError),

    /// The pool has been shut down.
    #[error("connection pool is closed")]
    Closed,
}

impl PoolError {
    /// Whether the caller's retry logic may reasonably try again later.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::AcquireTimeout { .. } | Self::Connect(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_timeout_is_transient() {
        let err = PoolError::AcquireTimeout { waited: Duration::from_secs(5) };
        assert!(err.is_transient());
        assert!(!PoolError::Closed.is_transient());
    }
}
