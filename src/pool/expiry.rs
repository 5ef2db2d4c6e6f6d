//! Expiry Policy: physical eviction of expired entries.
//!
//! Reads already treat expired entries as absent. Sweeping reclaims the
//! space they occupy. A sweep first finds candidates in a shared-lock
//! snapshot, then re-checks each candidate inside the exclusive lock right
//! before removing it, so a concurrent `set` on the same key always wins.

use crate::core::error::{PoolError, PoolResult};
use crate::pool::store::SharedMemoryPool;
use crate::watch::task::{
    FaultStreak, PeriodicTask, TaskState, TickOutcome, DEFAULT_MAX_CONSECUTIVE_FAULTS,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Keys that looked expired in the snapshot.
    pub candidates: usize,
    /// Keys actually removed after the re-check.
    pub removed: Vec<String>,
}

impl SweepReport {
    /// Candidates that were rewritten between snapshot and removal.
    pub fn spared(&self) -> usize {
        self.candidates - self.removed.len()
    }
}

/// Remove expired entries from `pool`.
pub fn sweep_expired(pool: &SharedMemoryPool) -> PoolResult<SweepReport> {
    let snapshot = pool.segment().read()?;
    let seen_at = pool.now();
    let candidates: Vec<String> = snapshot
        .iter()
        .filter(|(_, entry)| entry.is_expired_at(seen_at))
        .map(|(key, _)| key.clone())
        .collect();
    drop(snapshot);

    if candidates.is_empty() {
        return Ok(SweepReport::default());
    }

    let removed = pool.segment().mutate(|image| {
        let now = pool.now();
        let mut removed = Vec::new();
        for key in &candidates {
            let still_expired = image.get(key).is_some_and(|e| e.is_expired_at(now));
            if still_expired {
                image.remove(key);
                removed.push(key.clone());
            }
        }
        Ok(removed)
    })?;

    let report = SweepReport {
        candidates: candidates.len(),
        removed,
    };
    tracing::debug!(
        pool = %pool.name(),
        removed = report.removed.len(),
        spared = report.spared(),
        "swept expired entries"
    );
    Ok(report)
}

impl SharedMemoryPool {
    /// Physically remove expired entries. See [`sweep_expired`].
    pub fn sweep_expired(&self) -> PoolResult<SweepReport> {
        sweep_expired(self)
    }
}

/// Background sweeper owned by the pool's caller.
pub struct ExpirySweeper {
    task: PeriodicTask,
    sweeps: Arc<AtomicU64>,
    removed: Arc<AtomicU64>,
    faults: Arc<FaultStreak>,
}

impl ExpirySweeper {
    /// Start sweeping `pool` every `interval`, stopping after
    /// [`DEFAULT_MAX_CONSECUTIVE_FAULTS`] failed sweeps in a row.
    pub fn start(pool: Arc<SharedMemoryPool>, interval: Duration) -> PoolResult<Self> {
        Self::start_with_limit(pool, interval, DEFAULT_MAX_CONSECUTIVE_FAULTS)
    }

    /// Start sweeping `pool` every `interval`.
    ///
    /// A failed sweep is retried next interval until `max_consecutive_faults`
    /// sweeps in a row have failed; a decryption fault stops the sweeper at
    /// once.
    pub fn start_with_limit(
        pool: Arc<SharedMemoryPool>,
        interval: Duration,
        max_consecutive_faults: u32,
    ) -> PoolResult<Self> {
        let name = format!("sweep:{}", pool.name());
        let task = PeriodicTask::new(name.clone(), interval);
        let sweeps = Arc::new(AtomicU64::new(0));
        let removed = Arc::new(AtomicU64::new(0));
        let faults = Arc::new(FaultStreak::new(name, max_consecutive_faults));

        {
            let sweeps = sweeps.clone();
            let removed = removed.clone();
            let faults = faults.clone();
            task.start(move || match sweep_expired(&pool) {
                Ok(report) => {
                    faults.succeeded();
                    sweeps.fetch_add(1, Ordering::Relaxed);
                    removed.fetch_add(report.removed.len() as u64, Ordering::Relaxed);
                    TickOutcome::Continue
                }
                Err(e) => faults.failed(e),
            })?;
        }

        Ok(Self {
            task,
            sweeps,
            removed,
            faults,
        })
    }

    /// Completed sweeps.
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    /// Entries removed across all sweeps.
    pub fn removed_total(&self) -> u64 {
        self.removed.load(Ordering::Relaxed)
    }

    /// Sweeper state.
    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    /// Fault that stopped the sweeper, if any.
    pub fn fault(&self) -> Option<PoolError> {
        self.faults.fault()
    }

    /// Stop sweeping and wait up to `timeout`.
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.task.stop(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::core::time::{ManualClock, Timestamp};
    use crate::pool::store::PoolOptions;

    fn pool_with_clock(dir: &std::path::Path, clock: &ManualClock) -> SharedMemoryPool {
        SharedMemoryPool::open_with(
            "sweep",
            PoolOptions::new().dir(dir).clock(Arc::new(clock.clone())),
        )
        .unwrap()
    }

    #[test]
    fn sweep_removes_only_expired() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(Timestamp::new(10_000));
        let pool = pool_with_clock(dir.path(), &clock);

        pool.set("short", 1i64, Some(Duration::from_secs(1))).unwrap();
        pool.set("long", 2i64, Some(Duration::from_secs(60))).unwrap();
        pool.set("forever", 3i64, None).unwrap();
        clock.advance(Duration::from_secs(5));

        let report = pool.sweep_expired().unwrap();
        assert_eq!(report.removed, vec!["short".to_string()]);

        let stats = pool.get_stats().unwrap();
        assert_eq!(stats.entry_count, 2);
        assert_eq!(stats.expired_pending, 0);
    }

    #[test]
    fn rewritten_key_survives_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(Timestamp::new(10_000));
        let pool = pool_with_clock(dir.path(), &clock);

        pool.set("k", "old", Some(Duration::from_secs(1))).unwrap();
        clock.advance(Duration::from_secs(2));
        pool.set("k", "new", None).unwrap();

        let report = pool.sweep_expired().unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(pool.get("k").unwrap(), Some(Value::from("new")));
    }

    #[tokio::test]
    async fn sweeper_runs_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(Timestamp::new(10_000));
        let pool = Arc::new(pool_with_clock(dir.path(), &clock));

        pool.set("k", 1i64, Some(Duration::from_millis(10))).unwrap();
        clock.advance(Duration::from_secs(1));

        let sweeper = ExpirySweeper::start(pool.clone(), Duration::from_millis(5)).unwrap();
        for _ in 0..200 {
            if sweeper.removed_total() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(sweeper.removed_total(), 1);
        assert!(sweeper.stop(Duration::from_secs(1)).await);
        assert_eq!(sweeper.state(), TaskState::Stopped);
    }
}
