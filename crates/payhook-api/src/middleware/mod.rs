//! Request middleware.

pub mod auth;

pub use auth::{admin_auth, AdminToken};
