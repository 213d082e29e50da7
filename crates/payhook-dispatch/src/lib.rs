//! Webhook dispatch: routing, retries, and the dead-letter queue.
//!
//! [`EventRouter`] drives a verified event through the storage state
//! machine and the registered [`EventHandler`]. Failed attempts are graded
//! by [`RetryPolicy`] into a scheduled retry or a dead-letter; the
//! [`RetrySweeper`] later claims due retries and re-dispatches them.
//! [`DeadLetterQueue`] exposes inspection and manual replay.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dead_letter;
pub mod handlers;
pub mod retry;
pub mod router;
pub mod sweeper;

pub use dead_letter::DeadLetterQueue;
pub use handlers::billing_registry;
pub use retry::{RetryDecision, RetryPolicy};
pub use router::{DispatchOutcome, EventHandler, EventRouter, HandlerRegistry};
pub use sweeper::{RetrySweeper, SweeperConfig};
