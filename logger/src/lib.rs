//! Global `tracing` subscriber setup for the pesaloop client and its tests.
//!
//! Session code logs through the `tracing` macros only; whoever hosts the
//! client (the mobile shell, a test, a dev binary) decides whether and how
//! those events get printed by calling into this crate once at startup.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    filter::Targets,
    layer::{Layer, SubscriberExt},
    util::{SubscriberInitExt, TryInitError},
};

/// HTTP internals that are far too chatty at INFO when the host didn't ask
/// for them explicitly.
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls"];

/// Install the global logger for tests.
///
/// Does nothing unless `RUST_LOG` is set, and tolerates another test having
/// installed a logger first.
pub fn init_for_testing() {
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }

    let _ = try_init();
}

/// Try to install a global logger printing to stdout. Returns an `Err` if a
/// global logger is already set.
///
/// The filter comes from `RUST_LOG` using the `Targets` syntax
/// (`warn,pesaloop_client=debug`). If it's unset or fails to parse we log
/// INFO and above, with HTTP internals held to WARN.
pub fn try_init() -> Result<(), TryInitError> {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|rust_log| Targets::from_str(&rust_log).ok())
        .unwrap_or_else(default_filter);

    let stdout_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_level(true)
        .with_target(true)
        .with_ansi(true)
        .with_filter(filter);

    tracing_subscriber::registry().with(stdout_log).try_init()
}

fn default_filter() -> Targets {
    QUIET_TARGETS
        .iter()
        .fold(Targets::new().with_default(Level::INFO), |targets, target| {
            targets.with_target(*target, Level::WARN)
        })
}
