//! HTTP ingress for payhook.
//!
//! Receives provider webhooks, verifies their HMAC signatures before any
//! payload parsing, and hands verified events to the dispatch layer. Also
//! exposes batch submission/polling, dead-letter administration, and
//! health probes. Configuration loads from defaults, `payhook.toml`, and
//! environment overrides.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod crypto;
pub mod handlers;
pub mod middleware;
pub mod server;
pub mod verify;

pub use config::Config;
pub use server::{create_router, serve, AppState};
pub use verify::{Verifier, VerifyError};
