//! Configuration parsing and validation.
//!
//! Configuration is loaded from TOML with optional overrides. Every section
//! and field has a default, so an empty document is a valid configuration.

use crate::pool::store::PoolOptions;
use crate::rpc::client::RpcOptions;
use crate::watch::manager::WatchOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Pool identity and location.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Background expiry sweeping.
    #[serde(default)]
    pub expiry: ExpiryConfig,

    /// Watch loop tuning.
    #[serde(default)]
    pub watch: WatchConfig,

    /// Request/response tuning.
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Logging configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool name shared by every attached process.
    #[serde(default = "default_pool_name")]
    pub name: String,

    /// Segment directory. Defaults to `/dev/shm/mvent`, or `$TMPDIR/mvent`
    /// where `/dev/shm` is missing.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Environment variable holding the encryption secret.
    #[serde(default)]
    pub secret_env: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: default_pool_name(),
            dir: None,
            secret_env: None,
        }
    }
}

/// Expiry sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiryConfig {
    /// Interval between sweeps in milliseconds.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

/// Watch loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Poll interval in milliseconds.
    #[serde(default = "default_watch_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Bound on waiting for a loop to stop, in milliseconds.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Consecutive storage faults that stop a loop.
    #[serde(default = "default_max_consecutive_faults")]
    pub max_consecutive_faults: u32,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_watch_poll_interval_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            max_consecutive_faults: default_max_consecutive_faults(),
        }
    }
}

/// Request/response configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Request record ttl in milliseconds.
    #[serde(default = "default_record_ttl_ms")]
    pub request_ttl_ms: u64,

    /// Response record ttl in milliseconds.
    #[serde(default = "default_record_ttl_ms")]
    pub response_ttl_ms: u64,

    /// Response poll and broker pass interval in milliseconds.
    #[serde(default = "default_rpc_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Request deadline used when the caller gives none, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Consecutive failed broker passes that stop the broker.
    #[serde(default = "default_max_consecutive_faults")]
    pub max_consecutive_faults: u32,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_ttl_ms: default_record_ttl_ms(),
            response_ttl_ms: default_record_ttl_ms(),
            poll_interval_ms: default_rpc_poll_interval_ms(),
            default_timeout_ms: default_request_timeout_ms(),
            max_consecutive_faults: default_max_consecutive_faults(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_pool_name() -> String {
    "mvent".to_string()
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_watch_poll_interval_ms() -> u64 {
    50
}

fn default_stop_timeout_ms() -> u64 {
    1000
}

fn default_max_consecutive_faults() -> u32 {
    2
}

fn default_record_ttl_ms() -> u64 {
    30_000
}

fn default_rpc_poll_interval_ms() -> u64 {
    10
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref name) = overrides.pool_name {
            self.pool.name = name.clone();
        }
        if let Some(ref dir) = overrides.pool_dir {
            self.pool.dir = Some(dir.clone());
        }
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(poll_interval_ms) = overrides.watch_poll_interval_ms {
            self.watch.poll_interval_ms = poll_interval_ms;
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_pool()?;
        self.validate_intervals()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_pool(&self) -> Result<()> {
        crate::storage::segment::Segment::validate_name(&self.pool.name)
            .with_context(|| "pool.name is invalid")?;

        if let Some(ref var) = self.pool.secret_env {
            if var.is_empty() {
                anyhow::bail!("pool.secret_env must not be empty when set");
            }
        }
        Ok(())
    }

    fn validate_intervals(&self) -> Result<()> {
        let positive = [
            ("expiry.sweep_interval_ms", self.expiry.sweep_interval_ms),
            ("watch.poll_interval_ms", self.watch.poll_interval_ms),
            ("rpc.request_ttl_ms", self.rpc.request_ttl_ms),
            ("rpc.response_ttl_ms", self.rpc.response_ttl_ms),
            ("rpc.poll_interval_ms", self.rpc.poll_interval_ms),
            ("rpc.default_timeout_ms", self.rpc.default_timeout_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                anyhow::bail!("{} must be > 0", field);
            }
        }

        // Stop latency is bounded by one poll interval.
        if self.watch.stop_timeout_ms < self.watch.poll_interval_ms {
            anyhow::bail!(
                "watch.stop_timeout_ms ({}) cannot be less than watch.poll_interval_ms ({})",
                self.watch.stop_timeout_ms,
                self.watch.poll_interval_ms
            );
        }

        if self.watch.max_consecutive_faults == 0 {
            anyhow::bail!("watch.max_consecutive_faults must be >= 1");
        }
        if self.rpc.max_consecutive_faults == 0 {
            anyhow::bail!("rpc.max_consecutive_faults must be >= 1");
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }

    /// Pool attach options, with the secret read from `pool.secret_env`.
    ///
    /// A configured variable that is unset is an error rather than a silent
    /// fall back to a plain pool.
    pub fn pool_options(&self) -> Result<PoolOptions> {
        let mut options = PoolOptions::new();
        if let Some(ref dir) = self.pool.dir {
            options = options.dir(dir.clone());
        }
        if let Some(ref var) = self.pool.secret_env {
            let secret = std::env::var(var)
                .with_context(|| format!("pool secret variable {} is not set", var))?;
            options = options.secret(secret);
        }
        Ok(options)
    }

    /// Watch loop options.
    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            poll_interval: Duration::from_millis(self.watch.poll_interval_ms),
            stop_timeout: Duration::from_millis(self.watch.stop_timeout_ms),
            max_consecutive_faults: self.watch.max_consecutive_faults,
        }
    }

    /// Request/response options.
    pub fn rpc_options(&self) -> RpcOptions {
        RpcOptions {
            request_ttl: Duration::from_millis(self.rpc.request_ttl_ms),
            response_ttl: Duration::from_millis(self.rpc.response_ttl_ms),
            poll_interval: Duration::from_millis(self.rpc.poll_interval_ms),
            default_timeout: Duration::from_millis(self.rpc.default_timeout_ms),
            max_consecutive_faults: self.rpc.max_consecutive_faults,
        }
    }

    /// Expiry sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.expiry.sweep_interval_ms)
    }
}

/// Override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override pool name.
    pub pool_name: Option<String>,
    /// Override segment directory.
    pub pool_dir: Option<PathBuf>,
    /// Override log level.
    pub log_level: Option<String>,
    /// Override watch poll interval.
    pub watch_poll_interval_ms: Option<u64>,
}
