//! Tracing setup.
//!
//! The library only emits `tracing` events. Hosting processes opt in to
//! output by calling [`init_tracing`] once at startup.

use anyhow::Result;

/// Install a global subscriber: `RUST_LOG` if set, else `level`.
///
/// Fails if a global subscriber is already installed.
#[cfg(feature = "telemetry")]
pub fn init_tracing(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))
}

/// No-op without the `telemetry` feature.
#[cfg(not(feature = "telemetry"))]
pub fn init_tracing(_level: &str) -> Result<()> {
    Ok(())
}
