//! Event and handler metrics.
//!
//! A [`Monitor`] counts named events and times handler executions in this
//! process, and reports the pool's memory usage from [`SharedMemoryPool::get_stats`].

use crate::codec::Value;
use crate::core::error::PoolResult;
use crate::pool::store::{PoolStats, SharedMemoryPool};
use crate::rpc::message::Request;
use crate::rpc::route::Handler;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Timing summary for one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerStats {
    /// Completed calls.
    pub calls: u64,
    /// Total execution time.
    pub total: Duration,
    /// Mean execution time.
    pub avg: Duration,
}

#[derive(Debug, Default)]
struct HandlerTiming {
    calls: AtomicU64,
    total_nanos: AtomicU64,
}

impl HandlerTiming {
    fn record(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HandlerStats {
        let calls = self.calls.load(Ordering::Relaxed);
        let total = Duration::from_nanos(self.total_nanos.load(Ordering::Relaxed));
        let avg = if calls == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(total.as_nanos() as u64 / calls)
        };
        HandlerStats { calls, total, avg }
    }
}

/// Process-local metrics attached to a pool.
#[derive(Debug)]
pub struct Monitor {
    pool: Arc<SharedMemoryPool>,
    events: RwLock<HashMap<String, AtomicU64>>,
    handlers: RwLock<HashMap<String, HandlerTiming>>,
}

impl Monitor {
    /// Create a monitor reporting on `pool`.
    pub fn new(pool: Arc<SharedMemoryPool>) -> Self {
        Self {
            pool,
            events: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Count one occurrence of `event`.
    pub fn record_event(&self, event: &str) {
        let events = self.events.read();
        if let Some(counter) = events.get(event) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        drop(events);

        self.events
            .write()
            .entry(event.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record one execution of `handler` taking `elapsed`.
    pub fn record_handler(&self, handler: &str, elapsed: Duration) {
        let handlers = self.handlers.read();
        if let Some(timing) = handlers.get(handler) {
            timing.record(elapsed);
            return;
        }
        drop(handlers);

        self.handlers
            .write()
            .entry(handler.to_string())
            .or_default()
            .record(elapsed);
    }

    /// Event counts by name.
    pub fn event_stats(&self) -> BTreeMap<String, u64> {
        self.events
            .read()
            .iter()
            .map(|(name, count)| (name.clone(), count.load(Ordering::Relaxed)))
            .collect()
    }

    /// Handler timings by name.
    pub fn handler_stats(&self) -> BTreeMap<String, HandlerStats> {
        self.handlers
            .read()
            .iter()
            .map(|(name, timing)| (name.clone(), timing.snapshot()))
            .collect()
    }

    /// Pool memory usage.
    pub fn memory_stats(&self) -> PoolResult<PoolStats> {
        self.pool.get_stats()
    }

    /// Wrap `handler` so every call is timed under `name`.
    pub fn wrap_handler<H>(self: &Arc<Self>, name: &str, handler: H) -> TimedHandler<H>
    where
        H: Handler,
    {
        TimedHandler {
            monitor: self.clone(),
            name: name.to_string(),
            inner: handler,
        }
    }
}

/// Handler wrapper created by [`Monitor::wrap_handler`].
///
/// Failed calls are timed too.
pub struct TimedHandler<H> {
    monitor: Arc<Monitor>,
    name: String,
    inner: H,
}

impl<H: Handler> Handler for TimedHandler<H> {
    fn call(&self, request: &Request) -> anyhow::Result<Value> {
        let start = Instant::now();
        let result = self.inner.call(request);
        self.monitor.record_handler(&self.name, start.elapsed());
        result
    }
}
