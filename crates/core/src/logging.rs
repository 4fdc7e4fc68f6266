//! Structured logging infrastructure for RescueNet.
//!
//! This module provides centralized logging initialization with support
//! for structured JSON output and environment-based configuration.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Initialize the logging system with human-readable output.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
/// If not set, `default_directive` is used (e.g. `"info"`).
///
/// Calling this more than once is harmless; later calls are ignored.
///
/// # Example
/// ```no_run
/// use rescuenet_core::logging;
///
/// logging::init("info");
/// tracing::info!("Coordinator started");
/// ```
pub fn init(default_directive: &str) {
    let _ = tracing_subscriber::registry()
        .with(filter(default_directive))
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .try_init();
}

/// Initialize the logging system with JSON output for field deployments.
///
/// Suitable for shipping coordinator logs off the ground station after a
/// mission for replay and analysis.
///
/// # Example
/// ```no_run
/// use rescuenet_core::logging;
///
/// logging::init_json("debug");
/// tracing::info!(participant = 1, "Vehicle registered");
/// ```
pub fn init_json(default_directive: &str) {
    let _ = tracing_subscriber::registry()
        .with(filter(default_directive))
        .with(fmt::layer().json().with_target(true).with_thread_ids(true))
        .try_init();
}
