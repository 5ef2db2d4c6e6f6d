//! Time utilities.
//!
//! All expiry decisions compare a [`Timestamp`] sampled from a [`Clock`].
//! Pools attached from different processes use [`SystemClock`]; tests swap in
//! [`ManualClock`] to step time deterministically.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Wall-clock instant in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Milliseconds since the Unix epoch.
    pub ms: u64,
}

impl Timestamp {
    /// Create a timestamp from milliseconds.
    pub const fn new(ms: u64) -> Self {
        Self { ms }
    }

    /// The Unix epoch.
    pub const fn zero() -> Self {
        Self { ms: 0 }
    }

    /// Create a timestamp from float epoch seconds (the wire representation).
    ///
    /// Negative and non-finite inputs clamp to the epoch.
    pub fn from_secs_f64(secs: f64) -> Self {
        if !secs.is_finite() || secs <= 0.0 {
            return Self::zero();
        }
        Self {
            ms: (secs * 1000.0).round() as u64,
        }
    }

    /// Float epoch seconds (the wire representation).
    pub fn as_secs_f64(self) -> f64 {
        self.ms as f64 / 1000.0
    }

    /// Add a duration, saturating.
    pub fn add(self, duration: Duration) -> Self {
        let add_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Self {
            ms: self.ms.saturating_add(add_ms),
        }
    }

    /// Check if this instant is at or after the given deadline.
    pub const fn is_at_or_after(self, deadline: Timestamp) -> bool {
        self.ms >= deadline.ms
    }

    /// Milliseconds until a deadline; 0 if already passed.
    pub fn ms_until(self, deadline: Timestamp) -> u64 {
        deadline.ms.saturating_sub(self.ms)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}s", self.as_secs_f64())
    }
}

/// Source of the current time for expiry evaluation.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> Timestamp;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Timestamp::new(ms)
    }
}

/// Manually advanced clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    ms: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock frozen at the given instant.
    pub fn new(start: Timestamp) -> Self {
        Self {
            ms: Arc::new(AtomicU64::new(start.ms)),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let by_ms = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.ms.fetch_add(by_ms, Ordering::AcqRel);
    }

    /// Jump to an absolute instant.
    pub fn set(&self, at: Timestamp) {
        self.ms.store(at.ms, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.ms.load(Ordering::Acquire))
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// The default clock for pool handles.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
