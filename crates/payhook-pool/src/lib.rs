//! Bounded database connection pool with health checking.
//!
//! This crate implements the shared connection pool used by every payhook
//! component. Connections are created lazily up to a configured maximum,
//! callers block (with a timeout) when the pool is exhausted, and a
//! maintenance task recycles idle-expired or unhealthy connections while
//! keeping the pool at its configured minimum size.
//!
//! The pool is generic over a [`Connector`] so that tests can run against an
//! in-process fake while production uses [`PgConnector`] over a raw
//! `sqlx::PgConnection`.
//!
//! # Example
//!
//! ```no_run
//! use payhook_pool::{PgConnector, Pool, PoolConfig};
//!
//! # async fn example() -> Result<(), payhook_pool::PoolError> {
//! let connector = PgConnector::new("postgresql://localhost/payhook");
//! let pool = Pool::new(connector, PoolConfig::default());
//!
//! let conn = pool.acquire().await?;
//! // use `conn` as a `&mut sqlx::PgConnection`, released on drop
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod connector;
pub mod error;
pub mod pool;

pub use connector::{Connector, PgConnector};
pub use error::{ConnectError, PoolError};
pub use pool::{Pool, PoolConfig, PoolConn, PoolStats};
