//! The pesaloop mobile client's authenticated request pipeline: secure token
//! storage, single-flight token refresh, retry-once response handling, and
//! session teardown on logout or backgrounding.

/// Cached user data, balance, contacts and device preferences.
pub mod app_data;
/// The `/auth` endpoints.
pub mod auth_api;
/// Binds the access token to outbound requests.
pub mod auth_header;
/// The authenticated API client.
pub mod client;
/// API endpoint and header config.
pub mod config;
/// Session transition notifications.
pub mod events;
/// App foreground/background tracking.
pub mod lifecycle;
/// Single-flight access token refresh.
pub mod refresh;
/// Platform secret storage.
pub mod secret_store;
/// The application root.
pub mod session;
/// The session and its persisted copy.
pub mod session_store;
/// A scripted in-memory backend.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
/// The HTTP seam.
pub mod transport;

pub use crate::{
    client::ApiClient,
    config::ApiConfig,
    session::SessionManager,
};
