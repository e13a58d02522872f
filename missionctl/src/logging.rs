//! Tracing setup for the control plane.
//!
//! Structured events go to stderr in the compact format. Task state and
//! activity notes are product data and live in the task store instead.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `missionctl=info` if unset.
///
/// # Example
/// ```bash
/// RUST_LOG=missionctl=debug missionctl run
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("missionctl=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
