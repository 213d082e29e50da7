//! Batch operation processing with bounded concurrency and per-item
//! failure isolation.
//!
//! A submitted job is validated, persisted as `Running`, and driven to
//! completion by a background task that executes items under a semaphore.
//! One failing item never aborts the batch: its error is recorded and the
//! remaining items proceed. Progress counters update as items finish, so
//! a status poll mid-run sees live completion.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod executor;
pub mod processor;

pub use executor::{BillingItemExecutor, ItemError, ItemExecutor};
pub use processor::{BatchConfig, BatchProcessor, SubmitError};
