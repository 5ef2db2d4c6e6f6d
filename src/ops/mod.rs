//! Operations and observability.
//!
//! - [`monitoring`] - Event counts, handler timings and pool memory usage
//! - [`telemetry`] - Tracing subscriber setup

pub mod monitoring;
pub mod telemetry;

pub use monitoring::{HandlerStats, Monitor, TimedHandler};
pub use telemetry::init_tracing;
