//! Core infrastructure.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`error`] - Error taxonomy shared by every layer
//! - [`time`] - Timestamps and pluggable clocks

pub mod config;
pub mod error;
pub mod time;
