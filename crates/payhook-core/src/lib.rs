//! Core domain models and shared infrastructure for payhook.
//!
//! Provides strongly-typed domain primitives (webhook events, batch jobs),
//! the error taxonomy, clock and metrics abstractions, and the storage
//! traits every other crate builds on. Storage ships with an in-memory
//! implementation for tests and a PostgreSQL implementation for production.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod metrics;
pub mod models;
pub mod store;
pub mod time;

pub use error::{CoreError, HandlerError, Result};
pub use metrics::{
    Alert, AlertKind, AlertNotifier, AlertPolicy, Component, InMemoryMetrics, LogNotifier, Metric,
    MetricsSink, Monitor, NoopMetrics, NullNotifier,
};
pub use models::{
    BatchJob, BatchOperation, BatchStatus, EventId, EventKind, EventStatus, ItemOutcome, ItemRef,
    JobId, VerifiedEvent, WebhookEvent,
};
pub use store::{
    memory::{MemoryBatchStore, MemoryEventStore},
    postgres::{ensure_schema, PgBatchStore, PgEventStore},
    BatchStore, EventStore,
};
pub use time::{Clock, SystemClock, TestClock};
