//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use mvent::core::config::Config;
use mvent::core::time::{ManualClock, Timestamp};
use mvent::pool::store::{PoolOptions, SharedMemoryPool};
use mvent::rpc::client::RpcOptions;
use mvent::watch::manager::WatchOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};

/// Create a minimal valid configuration file.
pub fn create_minimal_config() -> NamedTempFile {
    let config_content = r#"
[pool]
name = "test_pool"
"#;

    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(config_content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Create a configuration with custom settings.
pub fn create_config_with_settings(name: &str, poll_interval_ms: u64, log_level: &str) -> NamedTempFile {
    let config_content = format!(
        r#"
[pool]
name = "{}"

[watch]
poll_interval_ms = {}
stop_timeout_ms = 2000

[telemetry]
log_level = "{}"
"#,
        name, poll_interval_ms, log_level
    );

    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(config_content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Load a configuration file, panicking on error.
pub fn load_config(file: &NamedTempFile) -> Config {
    Config::from_file(file.path()).expect("Failed to load config")
}

/// Create a temporary segment directory.
pub fn temp_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

/// Attach to a plain pool in `dir`.
pub fn open_pool(dir: &Path, name: &str) -> Arc<SharedMemoryPool> {
    Arc::new(
        SharedMemoryPool::open_with(name, PoolOptions::new().dir(dir))
            .expect("Failed to open pool"),
    )
}

/// Attach to an encrypted pool in `dir`.
pub fn open_encrypted_pool(dir: &Path, name: &str, secret: &str) -> Arc<SharedMemoryPool> {
    Arc::new(
        SharedMemoryPool::open_with(name, PoolOptions::new().dir(dir).secret(secret))
            .expect("Failed to open encrypted pool"),
    )
}

/// Attach to a pool driven by a manual clock starting at 1000s.
pub fn open_pool_with_clock(dir: &Path, name: &str) -> (Arc<SharedMemoryPool>, ManualClock) {
    let clock = ManualClock::new(Timestamp::new(1_000_000));
    let pool = SharedMemoryPool::open_with(
        name,
        PoolOptions::new().dir(dir).clock(Arc::new(clock.clone())),
    )
    .expect("Failed to open pool");
    (Arc::new(pool), clock)
}

/// Watch options with a short poll interval.
pub fn fast_watch() -> WatchOptions {
    WatchOptions {
        poll_interval: Duration::from_millis(10),
        stop_timeout: Duration::from_secs(2),
        max_consecutive_faults: 2,
    }
}

/// RPC options with a short poll interval.
pub fn fast_rpc() -> RpcOptions {
    RpcOptions {
        poll_interval: Duration::from_millis(5),
        ..RpcOptions::default()
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Unwrap a result, panicking with a descriptive message.
pub fn assert_ok<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
}

/// Unwrap an error, panicking if the result was Ok.
pub fn assert_err<T: std::fmt::Debug, E>(result: Result<T, E>) -> E {
    match result {
        Ok(v) => panic!("Expected Err, got Ok: {:?}", v),
        Err(e) => e,
    }
}
