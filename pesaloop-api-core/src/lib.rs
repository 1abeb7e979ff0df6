//! Wire types and error kinds shared by the pesaloop client.

/// Auth tokens and `/auth` request/response types.
pub mod auth;
/// Error kinds and response classification.
pub mod error;
/// User data models.
pub mod models;
