//! Broker: services pending requests for locally registered routes.
//!
//! A servicing pass scans `http_request:` keys, and for every request whose
//! path this process can handle it atomically takes the request record. Only
//! the broker whose take returned the record runs the handler, so among any
//! number of racing brokers a request is served at most once.

use crate::core::error::{PoolError, PoolResult};
use crate::pool::store::SharedMemoryPool;
use crate::rpc::client::RpcOptions;
use crate::rpc::message::{response_key, Request, REQUEST_PREFIX};
use crate::rpc::route::RouteTable;
use crate::watch::task::{FaultStreak, PeriodicTask, TaskState, TickOutcome};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one servicing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Requests this broker took and answered.
    pub served: usize,
    /// Requests another broker took first.
    pub lost_races: usize,
    /// Request records that could not be decoded.
    pub malformed: usize,
}

struct BrokerCore {
    pool: Arc<SharedMemoryPool>,
    routes: Arc<RouteTable>,
    options: RpcOptions,
    served: AtomicU64,
    faults: FaultStreak,
}

impl BrokerCore {
    fn poll_requests(&self) -> PoolResult<PassReport> {
        let mut report = PassReport::default();

        for (key, record) in self.pool.scan_prefix(REQUEST_PREFIX)? {
            let request = match Request::from_value(&record) {
                Ok(request) => request,
                Err(e) => {
                    report.malformed += 1;
                    tracing::debug!(key = %key, error = %e, "skipping malformed request");
                    continue;
                }
            };
            let Some(route) = self.routes.get(&request.path) else {
                continue;
            };

            // Claim. Whoever takes the record owns the request.
            let Some(claimed) = self.pool.take(&key)? else {
                report.lost_races += 1;
                tracing::debug!(request_id = %request.id, "request already claimed");
                continue;
            };
            let request = match Request::from_value(&claimed) {
                Ok(request) => request,
                Err(e) => {
                    report.malformed += 1;
                    tracing::warn!(key = %key, error = %e, "claimed request is malformed");
                    continue;
                }
            };

            tracing::debug!(
                request_id = %request.id,
                path = %request.path,
                method = %request.method,
                handler = %route.name,
                "dispatching request"
            );
            let response = route.dispatch(&request, self.pool.now());
            self.pool.set(
                &response_key(&request.id),
                response.to_value(),
                Some(self.options.response_ttl),
            )?;

            report.served += 1;
            self.served.fetch_add(1, Ordering::Relaxed);
        }

        Ok(report)
    }
}

/// Request servicing loop for one process.
pub struct Broker {
    core: Arc<BrokerCore>,
    task: PeriodicTask,
}

impl Broker {
    /// Create a broker over `routes`. Nothing runs until [`Broker::serve`]
    /// or [`Broker::poll_requests`] is called.
    pub fn new(pool: Arc<SharedMemoryPool>, routes: Arc<RouteTable>, options: RpcOptions) -> Self {
        let name = format!("broker:{}", pool.name());
        let task = PeriodicTask::new(name.clone(), options.poll_interval);
        Self {
            core: Arc::new(BrokerCore {
                pool,
                routes,
                options,
                served: AtomicU64::new(0),
                faults: FaultStreak::new(name, options.max_consecutive_faults),
            }),
            task,
        }
    }

    /// Run one servicing pass.
    pub fn poll_requests(&self) -> PoolResult<PassReport> {
        self.core.poll_requests()
    }

    /// Run servicing passes every poll interval in the background.
    ///
    /// A failed pass is retried until `max_consecutive_faults` passes in a
    /// row have failed; a decryption fault stops the broker at once. The
    /// stopping error is kept in [`Broker::fault`].
    pub fn serve(&self) -> PoolResult<()> {
        let core = self.core.clone();
        self.task.start(move || match core.poll_requests() {
            Ok(_) => {
                core.faults.succeeded();
                TickOutcome::Continue
            }
            Err(e) => core.faults.failed(e),
        })?;
        tracing::info!(
            pool = %self.core.pool.name(),
            routes = ?self.core.routes.paths(),
            "broker serving"
        );
        Ok(())
    }

    /// Requests served by this broker.
    pub fn served(&self) -> u64 {
        self.core.served.load(Ordering::Relaxed)
    }

    /// Background loop state.
    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    /// Fault that stopped the background loop, if any.
    pub fn fault(&self) -> Option<PoolError> {
        self.core.faults.fault()
    }

    /// Stop serving and wait up to `timeout`.
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.task.stop(timeout).await
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("pool", &self.core.pool.name())
            .field("state", &self.task.state())
            .field("served", &self.served())
            .finish()
    }
}
