//! Cancellable periodic task.
//!
//! A [`PeriodicTask`] runs one unit of blocking work per interval on the
//! tokio blocking pool until it is told to stop or the work asks to stop.
//!
//! # States
//!
//! ```text
//! Idle --start--> Watching --stop--> Stopping --loop exits--> Stopped
//!                    |                                          ^
//!                    +------------- work returns Stop ----------+
//! ```
//!
//! The stop signal is checked once per interval, so stop latency is bounded
//! by one interval plus the tick in flight.
//!
//! Loops whose work can fail pair the task with a [`FaultStreak`], which
//! turns a run of failing ticks into [`TickOutcome::Stop`] and keeps the
//! error that ended the loop.

use crate::core::error::{PoolError, PoolResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Lifecycle state of a periodic task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Created, not started.
    Idle,
    /// Loop running.
    Watching,
    /// Stop requested, loop not yet exited.
    Stopping,
    /// Loop exited. Terminal.
    Stopped,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Watching,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Watching => 1,
            Self::Stopping => 2,
            Self::Stopped => 3,
        }
    }
}

/// Outcome of one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Keep looping.
    Continue,
    /// Exit the loop.
    Stop,
}

/// Consecutive failing ticks that end a background loop by default.
pub const DEFAULT_MAX_CONSECUTIVE_FAULTS: u32 = 2;

/// Failure accounting for one background loop.
///
/// Errors that [`PoolError::is_fatal_for_loop`] flags stop the loop on the
/// first occurrence. Any other error is retried until `limit` ticks in a row
/// have failed. A successful tick resets the streak.
#[derive(Debug)]
pub struct FaultStreak {
    task: String,
    limit: u32,
    streak: AtomicU32,
    fault: Mutex<Option<PoolError>>,
}

impl FaultStreak {
    /// Create a tracker for the loop named `task`. A zero limit acts as one.
    pub fn new(task: impl Into<String>, limit: u32) -> Self {
        Self {
            task: task.into(),
            limit: limit.max(1),
            streak: AtomicU32::new(0),
            fault: Mutex::new(None),
        }
    }

    /// Record a successful tick.
    pub fn succeeded(&self) {
        self.streak.store(0, Ordering::Relaxed);
    }

    /// Record a failed tick and decide whether the loop goes on.
    pub fn failed(&self, error: PoolError) -> TickOutcome {
        let streak = self.streak.fetch_add(1, Ordering::Relaxed) + 1;

        if error.is_fatal_for_loop() || streak >= self.limit {
            tracing::error!(
                task = %self.task,
                error = %error,
                streak,
                "loop stopped by fault"
            );
            *self.fault.lock() = Some(error);
            return TickOutcome::Stop;
        }

        tracing::warn!(task = %self.task, error = %error, streak, "tick failed, retrying");
        TickOutcome::Continue
    }

    /// Failing ticks since the last success.
    pub fn streak(&self) -> u32 {
        self.streak.load(Ordering::Relaxed)
    }

    /// Error that stopped the loop, if it stopped on a fault.
    pub fn fault(&self) -> Option<PoolError> {
        self.fault.lock().clone()
    }
}

/// Periodic background task with cooperative cancellation.
pub struct PeriodicTask {
    name: String,
    interval: Duration,
    state: Arc<AtomicU8>,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    /// Create an idle task.
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            interval,
            state: Arc::new(AtomicU8::new(TaskState::Idle.as_u8())),
            stop_tx,
            handle: Mutex::new(None),
        }
    }

    /// Task name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Polling interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Check if the loop is running and not asked to stop.
    pub fn is_watching(&self) -> bool {
        self.state() == TaskState::Watching
    }

    /// Start the loop on the current tokio runtime.
    ///
    /// `work` runs on the blocking pool, at most one invocation at a time.
    pub fn start<F>(&self, work: F) -> PoolResult<()>
    where
        F: FnMut() -> TickOutcome + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            PoolError::invalid(format!(
                "task {} needs a tokio runtime to start",
                self.name
            ))
        })?;

        if self
            .state
            .compare_exchange(
                TaskState::Idle.as_u8(),
                TaskState::Watching.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(PoolError::invalid(format!(
                "task {} already started",
                self.name
            )));
        }

        let name = self.name.clone();
        let interval = self.interval;
        let state = self.state.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        let work = Arc::new(Mutex::new(work));

        let handle = runtime.spawn(async move {
            tracing::debug!(task = %name, interval_ms = interval.as_millis() as u64, "task started");

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                if *stop_rx.borrow() {
                    break;
                }

                let work = work.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    let mut work = work.lock();
                    (*work)()
                })
                .await;

                match outcome {
                    Ok(TickOutcome::Continue) => {}
                    Ok(TickOutcome::Stop) => break,
                    Err(e) => {
                        tracing::error!(task = %name, error = %e, "task work panicked");
                        break;
                    }
                }
            }

            state.store(TaskState::Stopped.as_u8(), Ordering::Release);
            tracing::debug!(task = %name, "task stopped");
        });

        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Ask the loop to stop without waiting.
    pub fn signal_stop(&self) {
        let _ = self.state.compare_exchange(
            TaskState::Watching.as_u8(),
            TaskState::Stopping.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = self.state.compare_exchange(
            TaskState::Idle.as_u8(),
            TaskState::Stopped.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.stop_tx.send_replace(true);
    }

    /// Stop the loop and wait up to `timeout` for it to exit.
    ///
    /// Returns whether the loop exited in time. A loop that misses the
    /// deadline is left to finish on its own.
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.signal_stop();
        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return true;
        };

        match tokio::time::timeout(timeout, handle).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(
                    task = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "task did not stop in time"
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn runs_until_stopped() {
        let task = PeriodicTask::new("counter", Duration::from_millis(5));
        let ticks = Arc::new(AtomicUsize::new(0));
        {
            let ticks = ticks.clone();
            task.start(move || {
                ticks.fetch_add(1, Ordering::SeqCst);
                TickOutcome::Continue
            })
            .unwrap();
        }
        assert_eq!(task.state(), TaskState::Watching);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(task.stop(Duration::from_secs(1)).await);
        assert_eq!(task.state(), TaskState::Stopped);

        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen > 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn work_can_stop_the_loop() {
        let task = PeriodicTask::new("once", Duration::from_millis(5));
        task.start(|| TickOutcome::Stop).unwrap();

        for _ in 0..100 {
            if task.state() == TaskState::Stopped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(task.state(), TaskState::Stopped);
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let task = PeriodicTask::new("dup", Duration::from_millis(5));
        task.start(|| TickOutcome::Continue).unwrap();
        assert!(task.start(|| TickOutcome::Continue).is_err());
        task.stop(Duration::from_secs(1)).await;
    }

    #[test]
    fn start_without_runtime_is_invalid() {
        let task = PeriodicTask::new("bare", Duration::from_millis(5));
        let err = task.start(|| TickOutcome::Continue).unwrap_err();
        assert!(matches!(err, PoolError::InvalidRequest { .. }));
        assert_eq!(task.state(), TaskState::Idle);
    }

    #[test]
    fn storage_fault_streak_stops_at_limit() {
        let faults = FaultStreak::new("t", 2);
        assert_eq!(
            faults.failed(PoolError::storage("gone")),
            TickOutcome::Continue
        );
        assert!(faults.fault().is_none());
        assert_eq!(faults.failed(PoolError::storage("gone")), TickOutcome::Stop);
        assert_eq!(faults.streak(), 2);
        assert!(matches!(faults.fault(), Some(PoolError::StorageFault { .. })));
    }

    #[test]
    fn success_resets_streak() {
        let faults = FaultStreak::new("t", 2);
        faults.failed(PoolError::storage("blip"));
        faults.succeeded();
        assert_eq!(faults.streak(), 0);
        assert_eq!(
            faults.failed(PoolError::storage("blip")),
            TickOutcome::Continue
        );
    }

    #[test]
    fn fatal_fault_stops_on_first_tick() {
        let faults = FaultStreak::new("t", 5);
        assert_eq!(
            faults.failed(PoolError::decryption("wrong key")),
            TickOutcome::Stop
        );
        assert!(matches!(faults.fault(), Some(PoolError::DecryptionFault { .. })));
    }

    #[tokio::test]
    async fn stopping_idle_task_is_terminal() {
        let task = PeriodicTask::new("idle", Duration::from_millis(5));
        assert!(task.stop(Duration::from_millis(10)).await);
        assert_eq!(task.state(), TaskState::Stopped);
    }
}
