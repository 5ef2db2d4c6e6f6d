//! Core infrastructure tests.

mod common;

use mvent::codec::{decode, encode, Value};
use mvent::core::config::{Config, ConfigOverrides};
use mvent::core::error::PoolError;
use mvent::core::time::{Clock, ManualClock, Timestamp};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::NamedTempFile;

// ============================================================================
// Config tests
// ============================================================================

#[test]
fn parse_minimal_config() {
    let file = common::create_minimal_config();
    let config = common::load_config(&file);

    assert_eq!(config.pool.name, "test_pool");
    assert_eq!(config.watch.poll_interval_ms, 50);
    assert_eq!(config.watch.stop_timeout_ms, 1000);
    assert_eq!(config.watch.max_consecutive_faults, 2);
    assert_eq!(config.rpc.request_ttl_ms, 30_000);
    assert_eq!(config.rpc.poll_interval_ms, 10);
    assert_eq!(config.rpc.max_consecutive_faults, 2);
    assert_eq!(config.telemetry.log_level, "info");
}

#[test]
fn empty_document_is_valid() {
    let config = Config::from_toml("").unwrap();
    assert_eq!(config.pool.name, "mvent");
    assert!(config.pool.dir.is_none());
    assert!(config.validate().is_ok());
}

#[test]
fn parse_config_with_settings() {
    let file = common::create_config_with_settings("rooms", 20, "debug");
    let config = common::load_config(&file);

    assert_eq!(config.pool.name, "rooms");
    let watch = config.watch_options();
    assert_eq!(watch.poll_interval, Duration::from_millis(20));
    assert_eq!(watch.stop_timeout, Duration::from_secs(2));
    assert_eq!(config.telemetry.log_level, "debug");
}

#[test]
fn validate_invalid_pool_name() {
    let result = Config::from_toml(
        r#"
[pool]
name = "bad/name"
"#,
    );
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("pool.name"));
}

#[test]
fn validate_zero_interval() {
    let result = Config::from_toml(
        r#"
[rpc]
poll_interval_ms = 0
"#,
    );
    assert!(result.unwrap_err().to_string().contains("rpc.poll_interval_ms"));
}

#[test]
fn validate_stop_timeout_below_poll_interval() {
    let result = Config::from_toml(
        r#"
[watch]
poll_interval_ms = 500
stop_timeout_ms = 100
"#,
    );
    assert!(result.unwrap_err().to_string().contains("stop_timeout_ms"));
}

#[test]
fn validate_zero_fault_streak() {
    let result = Config::from_toml(
        r#"
[watch]
max_consecutive_faults = 0
"#,
    );
    assert!(result.is_err());

    let result = Config::from_toml(
        r#"
[rpc]
max_consecutive_faults = 0
"#,
    );
    assert!(result
        .unwrap_err()
        .to_string()
        .contains("rpc.max_consecutive_faults"));
}

#[test]
fn validate_invalid_log_level() {
    let config_content = r#"
[telemetry]
log_level = "verbose"
"#;

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(config_content.as_bytes()).unwrap();

    let result = Config::from_file(file.path());
    assert!(result.unwrap_err().to_string().contains("log_level"));
}

#[test]
fn missing_config_file_reports_path() {
    let result = Config::from_file(&PathBuf::from("/nonexistent/mvent.toml"));
    assert!(result.unwrap_err().to_string().contains("mvent.toml"));
}

#[test]
fn apply_overrides() {
    let mut config = Config::default();
    config.apply_overrides(&ConfigOverrides {
        pool_name: Some("other".to_string()),
        pool_dir: Some(PathBuf::from("/tmp/elsewhere")),
        log_level: Some("warn".to_string()),
        watch_poll_interval_ms: Some(5),
    });

    assert_eq!(config.pool.name, "other");
    assert_eq!(config.pool.dir, Some(PathBuf::from("/tmp/elsewhere")));
    assert_eq!(config.telemetry.log_level, "warn");
    assert_eq!(config.watch.poll_interval_ms, 5);
}

#[test]
fn pool_options_read_secret_from_env() {
    std::env::set_var("MVENT_TEST_SECRET_PRESENT", "s3cret");
    let config = Config::from_toml(
        r#"
[pool]
dir = "/tmp/mvent-test"
secret_env = "MVENT_TEST_SECRET_PRESENT"
"#,
    )
    .unwrap();

    let options = config.pool_options().unwrap();
    assert_eq!(options.secret.as_deref(), Some(b"s3cret".as_slice()));
    assert_eq!(options.resolved_dir(), PathBuf::from("/tmp/mvent-test"));
}

#[test]
fn pool_options_fail_on_unset_secret() {
    std::env::remove_var("MVENT_TEST_SECRET_ABSENT");
    let config = Config::from_toml(
        r#"
[pool]
secret_env = "MVENT_TEST_SECRET_ABSENT"
"#,
    )
    .unwrap();

    assert!(config.pool_options().is_err());
}

#[test]
fn rpc_options_from_config() {
    let config = Config::from_toml(
        r#"
[rpc]
request_ttl_ms = 1000
response_ttl_ms = 2000
default_timeout_ms = 250
max_consecutive_faults = 4
"#,
    )
    .unwrap();

    let rpc = config.rpc_options();
    assert_eq!(rpc.request_ttl, Duration::from_secs(1));
    assert_eq!(rpc.response_ttl, Duration::from_secs(2));
    assert_eq!(rpc.default_timeout, Duration::from_millis(250));
    assert_eq!(rpc.max_consecutive_faults, 4);
    assert_eq!(config.sweep_interval(), Duration::from_secs(1));
}

// ============================================================================
// Error tests
// ============================================================================

#[test]
fn error_display_names_kind() {
    let err = PoolError::storage("segment missing");
    assert!(err.to_string().starts_with("StorageFault"));
    assert_eq!(err.kind(), "StorageFault");

    let err = PoolError::timeout("abc", 500);
    assert!(err.to_string().contains("abc"));
    assert!(err.is_timeout());
}

#[test]
fn error_loop_classification() {
    assert!(PoolError::storage("x").is_transient());
    assert!(!PoolError::storage("x").is_fatal_for_loop());
    assert!(PoolError::decryption("x").is_fatal_for_loop());
    assert!(!PoolError::decryption("x").is_transient());
    assert!(!PoolError::route_not_found("/p").is_fatal_for_loop());
}

#[test]
fn io_error_becomes_storage_fault() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let err = PoolError::io("cannot open /x", io);
    assert!(matches!(err, PoolError::StorageFault { .. }));
    assert!(err.to_string().contains("denied"));
}

// ============================================================================
// Time tests
// ============================================================================

#[test]
fn timestamp_float_seconds() {
    let ts = Timestamp::from_secs_f64(1.25);
    assert_eq!(ts.ms, 1250);
    assert_eq!(ts.as_secs_f64(), 1.25);
    assert_eq!(Timestamp::from_secs_f64(-3.0), Timestamp::zero());
    assert_eq!(Timestamp::from_secs_f64(f64::NAN), Timestamp::zero());
}

#[test]
fn timestamp_arithmetic_saturates() {
    let ts = Timestamp::new(u64::MAX - 1);
    assert_eq!(ts.add(Duration::from_secs(10)).ms, u64::MAX);
    assert_eq!(Timestamp::new(100).ms_until(Timestamp::new(50)), 0);
    assert_eq!(Timestamp::new(50).ms_until(Timestamp::new(100)), 50);
}

#[test]
fn manual_clock_clones_share_time() {
    let clock = ManualClock::new(Timestamp::new(10));
    let other = clock.clone();
    clock.advance(Duration::from_millis(5));
    assert_eq!(other.now(), Timestamp::new(15));

    other.set(Timestamp::new(1));
    assert_eq!(clock.now(), Timestamp::new(1));
}

// ============================================================================
// Codec tests
// ============================================================================

#[test]
fn codec_preserves_structured_values() {
    let value = Value::from(json!({
        "user": {"name": "ada", "tags": ["a", "b"]},
        "n": -7,
        "ratio": 0.5,
        "ok": true,
        "none": null
    }));
    let bytes = encode(&value).unwrap();
    assert_eq!(decode(&bytes).unwrap(), value);
}

#[test]
fn codec_rejects_garbage() {
    assert!(decode(&[0xff]).is_err());
    assert!(decode(&[]).is_err());
}

// ============================================================================
// Telemetry tests
// ============================================================================

#[test]
fn init_tracing_installs_once() {
    assert!(mvent::ops::init_tracing("debug").is_ok());
    assert!(mvent::ops::init_tracing("debug").is_err());
}
