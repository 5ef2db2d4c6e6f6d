//! Subscription manager.
//!
//! A [`WatchManager`] owns one watch loop per subscription key. Every loop
//! polls its [`WatchSource`], delivers items newer than its cursor to each
//! registered callback in ascending index order, then advances the cursor.
//!
//! # Delivery Contract
//!
//! - A new subscription instance starts its cursor at the highest index
//!   present when it is created; earlier items are read through history
//! - A callback joining a running loop receives only indices above the head
//!   observed when it joined, even if the loop's cursor is further behind
//! - Each index is delivered at most once per subscription instance
//! - A failing or panicking callback is logged and counted, and delivery to
//!   the remaining callbacks continues
//! - A decryption fault stops the loop at once; storage faults stop it after
//!   a streak of failing cycles, and [`WatchManager::fault`] reports why

use crate::codec::Value;
use crate::core::error::{PoolError, PoolResult};
use crate::pool::store::SharedMemoryPool;
use crate::watch::source::WatchSource;
use crate::watch::task::{
    FaultStreak, PeriodicTask, TaskState, TickOutcome, DEFAULT_MAX_CONSECUTIVE_FAULTS,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Subscriber callback.
pub type Callback = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// Identifier of a registered callback, unique per manager.
pub type CallbackId = u64;

/// Watch loop tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    /// Delay between polls.
    pub poll_interval: Duration,
    /// Bound on waiting for a loop to exit.
    pub stop_timeout: Duration,
    /// Consecutive failing cycles that stop a loop.
    pub max_consecutive_faults: u32,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            stop_timeout: Duration::from_millis(1000),
            max_consecutive_faults: DEFAULT_MAX_CONSECUTIVE_FAULTS,
        }
    }
}

/// Delivery counters for one subscription instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchStats {
    /// Completed poll cycles.
    pub cycles: u64,
    /// Items delivered (counted once per item, not per callback).
    pub delivered: u64,
    /// Callback invocations that failed or panicked.
    pub callback_faults: u64,
    /// Poll cycles that failed to read the source.
    pub poll_faults: u64,
}

#[derive(Default)]
struct Counters {
    cycles: AtomicU64,
    delivered: AtomicU64,
    callback_faults: AtomicU64,
    poll_faults: AtomicU64,
}

struct Registered {
    id: CallbackId,
    callback: Callback,
    // Head seen when the callback joined a running loop.
    joined_at: Option<u64>,
}

impl Registered {
    fn wants(&self, index: u64) -> bool {
        self.joined_at.map_or(true, |head| index > head)
    }
}

struct SubscriptionShared {
    key: String,
    callbacks: RwLock<Vec<Arc<Registered>>>,
    cursor: Mutex<Option<u64>>,
    faults: FaultStreak,
    counters: Counters,
}

impl SubscriptionShared {
    fn stats(&self) -> WatchStats {
        WatchStats {
            cycles: self.counters.cycles.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            callback_faults: self.counters.callback_faults.load(Ordering::Relaxed),
            poll_faults: self.counters.poll_faults.load(Ordering::Relaxed),
        }
    }

    fn deliver(&self, index: u64, payload: &Value) {
        let callbacks = self.callbacks.read().clone();
        for registered in callbacks.iter().filter(|r| r.wants(index)) {
            let outcome = catch_unwind(AssertUnwindSafe(|| (registered.callback)(payload)));
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(panic) => panic_message(panic.as_ref()),
            };
            self.counters.callback_faults.fetch_add(1, Ordering::Relaxed);
            let fault = PoolError::callback(&self.key, message);
            tracing::warn!(
                subscription = %self.key,
                callback = registered.id,
                index,
                error = %fault,
                "callback failed"
            );
        }
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

struct Subscription {
    shared: Arc<SubscriptionShared>,
    task: PeriodicTask,
}

/// Owner of watch loops for one pool.
///
/// Dropping the manager signals every loop to stop without waiting.
pub struct WatchManager {
    pool: Arc<SharedMemoryPool>,
    options: WatchOptions,
    subscriptions: RwLock<HashMap<String, Subscription>>,
    next_id: AtomicU64,
}

impl WatchManager {
    /// Create a manager with default options.
    pub fn new(pool: Arc<SharedMemoryPool>) -> Self {
        Self::with_options(pool, WatchOptions::default())
    }

    /// Create a manager with the given options.
    pub fn with_options(pool: Arc<SharedMemoryPool>, options: WatchOptions) -> Self {
        Self {
            pool,
            options,
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Pool being watched.
    pub fn pool(&self) -> &Arc<SharedMemoryPool> {
        &self.pool
    }

    /// Loop tuning.
    pub fn options(&self) -> &WatchOptions {
        &self.options
    }

    /// Register `callback` on `source`, starting its loop if none is running.
    ///
    /// Subscribing to an already-watched key joins the existing loop and
    /// receives items above the current head only. A key whose loop has
    /// stopped gets a fresh instance with a fresh cursor. Must be called
    /// within a tokio runtime.
    pub fn subscribe<F>(&self, source: Arc<dyn WatchSource>, callback: F) -> PoolResult<CallbackId>
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let key = source.subscription_key();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: Callback = Arc::new(callback);

        // Storage read stays outside the subscriptions lock.
        let head = source.head(&self.pool)?;

        let mut subscriptions = self.subscriptions.write();
        if let Some(existing) = subscriptions.get(&key) {
            if existing.task.is_watching() {
                existing.shared.callbacks.write().push(Arc::new(Registered {
                    id,
                    callback,
                    joined_at: head,
                }));
                tracing::debug!(subscription = %key, callback = id, head = ?head, "joined watch loop");
                return Ok(id);
            }
        }

        let cursor = head;
        let task_name = format!("watch:{}", key);
        let shared = Arc::new(SubscriptionShared {
            key: key.clone(),
            callbacks: RwLock::new(vec![Arc::new(Registered {
                id,
                callback,
                joined_at: None,
            })]),
            cursor: Mutex::new(cursor),
            faults: FaultStreak::new(task_name.clone(), self.options.max_consecutive_faults),
            counters: Counters::default(),
        });

        let task = PeriodicTask::new(task_name, self.options.poll_interval);
        task.start(poll_loop(self.pool.clone(), source, shared.clone()))?;

        tracing::info!(
            subscription = %key,
            cursor = ?cursor,
            interval_ms = self.options.poll_interval.as_millis() as u64,
            "watch loop started"
        );

        // Replacing a stopped instance drops its task, which is already terminal.
        subscriptions.insert(key, Subscription { shared, task });
        Ok(id)
    }

    /// Remove one callback. Returns whether it was registered.
    ///
    /// Removing the last callback signals the loop to stop.
    pub fn unsubscribe(&self, key: &str, id: CallbackId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let Some(sub) = subscriptions.get(key) else {
            return false;
        };

        let (removed, now_empty) = {
            let mut callbacks = sub.shared.callbacks.write();
            let before = callbacks.len();
            callbacks.retain(|r| r.id != id);
            (callbacks.len() != before, callbacks.is_empty())
        };

        if removed && now_empty {
            if let Some(sub) = subscriptions.remove(key) {
                sub.task.signal_stop();
                tracing::debug!(subscription = %key, "last callback removed, loop stopping");
            }
        }
        removed
    }

    /// Stop the loop for `key` and wait for it to exit.
    ///
    /// Returns whether a subscription existed.
    pub async fn disconnect(&self, key: &str) -> bool {
        let sub = self.subscriptions.write().remove(key);
        match sub {
            Some(sub) => {
                sub.task.stop(self.options.stop_timeout).await;
                tracing::info!(subscription = %key, "watch loop disconnected");
                true
            }
            None => false,
        }
    }

    /// Stop every loop owned by this manager.
    pub async fn cleanup(&self) {
        let drained: Vec<(String, Subscription)> = self.subscriptions.write().drain().collect();
        for (_, sub) in &drained {
            sub.task.signal_stop();
        }
        for (key, sub) in drained {
            if !sub.task.stop(self.options.stop_timeout).await {
                tracing::warn!(subscription = %key, "watch loop outlived cleanup");
            }
        }
    }

    /// Keys with a registered subscription instance.
    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.subscriptions.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Loop state for `key`.
    pub fn state(&self, key: &str) -> Option<TaskState> {
        self.subscriptions.read().get(key).map(|s| s.task.state())
    }

    /// Number of callbacks registered on `key`.
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.subscriptions
            .read()
            .get(key)
            .map_or(0, |s| s.shared.callbacks.read().len())
    }

    /// Last delivered index for `key`.
    pub fn cursor(&self, key: &str) -> Option<u64> {
        self.subscriptions
            .read()
            .get(key)
            .and_then(|s| *s.shared.cursor.lock())
    }

    /// Fault that stopped the loop for `key`, if any.
    pub fn fault(&self, key: &str) -> Option<PoolError> {
        self.subscriptions
            .read()
            .get(key)
            .and_then(|s| s.shared.faults.fault())
    }

    /// Delivery counters for `key`.
    pub fn stats(&self, key: &str) -> Option<WatchStats> {
        self.subscriptions.read().get(key).map(|s| s.shared.stats())
    }
}

impl std::fmt::Debug for WatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchManager")
            .field("pool", &self.pool.name())
            .field("subscriptions", &self.active_keys())
            .finish()
    }
}

fn poll_loop(
    pool: Arc<SharedMemoryPool>,
    source: Arc<dyn WatchSource>,
    shared: Arc<SubscriptionShared>,
) -> impl FnMut() -> TickOutcome + Send + 'static {
    move || {
        let cursor = *shared.cursor.lock();
        let items = match source.fetch_after(&pool, cursor) {
            Ok(items) => items,
            Err(e) => {
                shared.counters.poll_faults.fetch_add(1, Ordering::Relaxed);
                return shared.faults.failed(e);
            }
        };
        shared.faults.succeeded();

        for item in items {
            shared.deliver(item.index, &item.payload);
            *shared.cursor.lock() = Some(item.index);
        }
        shared.counters.cycles.fetch_add(1, Ordering::Relaxed);
        TickOutcome::Continue
    }
}
