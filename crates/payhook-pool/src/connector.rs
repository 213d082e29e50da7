//! Connection factory abstraction.
//!
//! The pool does not know how to open or validate connections; a
//! [`Connector`] supplies both. Production uses [`PgConnector`], tests
//! supply fakes with injectable failures.

use async_trait::async_trait;
use sqlx::{Connection, PgConnection};

use crate::error::ConnectError;

/// Factory for pooled connections.
///
/// `ping` is invoked by the pool's periodic health check against idle
/// connections; a failure marks the connection unhealthy and it is
/// destroyed rather than handed out again.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The connection type managed by the pool.
    type Conn: Send + 'static;

    /// Opens a new connection.
    async fn connect(&self) -> Result<Self::Conn, ConnectError>;

    /// Validates that an existing connection is still usable.
    async fn ping(&self, conn: &mut Self::Conn) -> Result<(), ConnectError>;
}

/// PostgreSQL connector over a raw `sqlx::PgConnection`.
///
/// The pool manages individual connections rather than delegating to an
/// opaque driver pool, so pool policy (sizing, health, idle expiry) lives
/// in one place and is observable.
#[derive(Debug, Clone)]
pub struct PgConnector {
    url: String,
}

impl PgConnector {
    /// Creates a connector for the given database URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Conn = PgConnection;

    async fn connect(&self) -> Result<PgConnection, ConnectError> {
        PgConnection::connect(&self.url).await.map_err(ConnectError::new)
    }

    async fn ping(&self, conn: &mut PgConnection) -> Result<(), ConnectError> {
        conn.ping().await.map_err(ConnectError::new)
    }
}
