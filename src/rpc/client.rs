//! HTTP-style request/response over the pool.
//!
//! [`HttpManager`] holds this process's route table and is both sides of the
//! exchange: it registers handlers, dispatches local calls, issues
//! cross-process requests and creates the [`Broker`] that serves them.
//!
//! Async calls run their pool operations on the blocking pool, since every
//! pool call may wait on the cross-process lock.

use crate::codec::Value;
use crate::core::error::{PoolError, PoolResult};
use crate::facade::stream::StreamChannel;
use crate::pool::store::SharedMemoryPool;
use crate::rpc::broker::Broker;
use crate::rpc::message::{
    request_key, response_key, route_key, Request, Response, RouteDirectoryEntry, ROUTE_PREFIX,
};
use crate::rpc::route::{Handler, LocalRoute, RouteTable, StreamHandler, StreamRoute};
use crate::watch::task::DEFAULT_MAX_CONSECUTIVE_FAULTS;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Request/response tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcOptions {
    /// Lifetime of request records.
    pub request_ttl: Duration,
    /// Lifetime of response records.
    pub response_ttl: Duration,
    /// Delay between response polls and broker passes.
    pub poll_interval: Duration,
    /// Deadline used when the caller passes none.
    pub default_timeout: Duration,
    /// Consecutive failed broker passes that stop a serving broker.
    pub max_consecutive_faults: u32,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            request_ttl: Duration::from_secs(30),
            response_ttl: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            default_timeout: Duration::from_secs(5),
            max_consecutive_faults: DEFAULT_MAX_CONSECUTIVE_FAULTS,
        }
    }
}

/// Route registry and request client for one process.
pub struct HttpManager {
    pool: Arc<SharedMemoryPool>,
    routes: Arc<RouteTable>,
    streams: RwLock<HashMap<String, StreamRoute>>,
    options: RpcOptions,
}

impl HttpManager {
    /// Create a manager with default options.
    pub fn new(pool: Arc<SharedMemoryPool>) -> Self {
        Self::with_options(pool, RpcOptions::default())
    }

    /// Create a manager with the given options.
    pub fn with_options(pool: Arc<SharedMemoryPool>, options: RpcOptions) -> Self {
        Self {
            pool,
            routes: Arc::new(RouteTable::new()),
            streams: RwLock::new(HashMap::new()),
            options,
        }
    }

    /// Request/response tuning.
    pub fn options(&self) -> &RpcOptions {
        &self.options
    }

    /// Local route table.
    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    // ========================================================================
    // Routes
    // ========================================================================

    fn publish_route(&self, path: &str, name: &str, module: &str) -> PoolResult<()> {
        let entry = RouteDirectoryEntry {
            registered_by: std::process::id(),
            handler_name: name.to_string(),
            handler_module: module.to_string(),
            timestamp: self.pool.now(),
        };
        self.pool.set(&route_key(path), entry.to_value(), None)
    }

    /// Register `handler` for `path` in this process and publish a directory
    /// entry for discovery. Replaces a streaming route at the same path.
    pub fn route<H>(&self, path: &str, name: &str, handler: H) -> PoolResult<()>
    where
        H: Handler + 'static,
    {
        let module = std::any::type_name::<H>();
        self.publish_route(path, name, module)?;
        self.streams.write().remove(path);

        let replaced = self.routes.insert(
            path,
            LocalRoute {
                name: name.to_string(),
                module,
                handler: Arc::new(handler),
            },
        );
        tracing::info!(
            path = %path,
            handler = %name,
            replaced = replaced.is_some(),
            "route registered"
        );
        Ok(())
    }

    /// Register a streaming `handler` for `path`. See [`HttpManager::handle_stream`].
    ///
    /// Replaces a plain route at the same path. Brokers never serve
    /// streaming routes.
    pub fn route_stream<H>(&self, path: &str, name: &str, handler: H) -> PoolResult<()>
    where
        H: StreamHandler + 'static,
    {
        let module = std::any::type_name::<H>();
        self.publish_route(path, name, module)?;
        self.routes.remove(path);

        let replaced = self.streams.write().insert(
            path.to_string(),
            StreamRoute {
                name: name.to_string(),
                module,
                handler: Arc::new(handler),
            },
        );
        tracing::info!(
            path = %path,
            handler = %name,
            replaced = replaced.is_some(),
            "streaming route registered"
        );
        Ok(())
    }

    /// Paths with a local streaming handler, sorted.
    pub fn stream_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.streams.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Remove the local handler for `path`. The directory entry is removed
    /// only if this process wrote it. Returns whether a handler was removed.
    pub fn unregister(&self, path: &str) -> PoolResult<bool> {
        let plain = self.routes.remove(path).is_some();
        let streaming = self.streams.write().remove(path).is_some();
        let removed = plain || streaming;
        let pid = std::process::id();
        let key = route_key(path);

        self.pool.transaction(|tx| {
            let ours = tx
                .get(&key)?
                .and_then(|record| RouteDirectoryEntry::from_value(&record).ok())
                .is_some_and(|entry| entry.registered_by == pid);
            if ours {
                tx.delete(&key);
            }
            Ok(())
        })?;

        if removed {
            tracing::info!(path = %path, "route unregistered");
        }
        Ok(removed)
    }

    /// Routes published by any process.
    pub fn directory(&self) -> PoolResult<Vec<(String, RouteDirectoryEntry)>> {
        Ok(self
            .pool
            .scan_prefix(ROUTE_PREFIX)?
            .into_iter()
            .filter_map(|(key, record)| {
                let entry = RouteDirectoryEntry::from_value(&record).ok()?;
                Some((key[ROUTE_PREFIX.len()..].to_string(), entry))
            })
            .collect())
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Dispatch to a local handler without touching the pool.
    pub fn handle_request(&self, path: &str, method: &str, data: impl Into<Value>) -> PoolResult<Response> {
        let route = self
            .routes
            .get(path)
            .ok_or_else(|| PoolError::route_not_found(path))?;
        let request = Request::new(path, method, data, self.pool.now());
        Ok(route.dispatch(&request, self.pool.now()))
    }

    /// Dispatch to a local streaming handler.
    ///
    /// The handler publishes into a stream named after the request id, and
    /// the channel is returned for reading its chunks or subscribing to
    /// later ones. A handler failure or panic is a `CallbackFault` naming
    /// the path; chunks published before it stay readable.
    pub fn handle_stream(
        &self,
        path: &str,
        method: &str,
        data: impl Into<Value>,
    ) -> PoolResult<StreamChannel> {
        let route = self
            .streams
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| PoolError::route_not_found(path))?;
        let request = Request::new(path, method, data, self.pool.now());
        let channel = StreamChannel::new(self.pool.clone(), &request.id)?;

        tracing::debug!(
            request_id = %request.id,
            path = %path,
            handler = %route.name,
            "dispatching streaming request"
        );
        if let Err(e) = route.dispatch(&request, &channel) {
            tracing::warn!(
                path = %path,
                handler = %route.name,
                request_id = %request.id,
                error = %e,
                "streaming handler failed"
            );
            return Err(PoolError::callback(path, format!("{:#}", e)));
        }
        Ok(channel)
    }

    /// Send a request through the pool and wait for a broker's response.
    ///
    /// Returns `Ok` for handler failures too (see [`Response::is_error`]);
    /// `Err(Timeout)` means no response arrived within `timeout`.
    pub async fn send_request(
        &self,
        path: &str,
        method: &str,
        data: impl Into<Value>,
        timeout: Option<Duration>,
    ) -> PoolResult<Response> {
        let request = Request::new(path, method, data, self.pool.now());
        let key = request_key(&request.id);
        let record = request.to_value();
        let ttl = self.options.request_ttl;
        self.blocking(move |pool| pool.set(&key, record, Some(ttl)))
            .await?;
        tracing::debug!(request_id = %request.id, path = %request.path, "request submitted");

        self.await_response(&request.id, timeout.unwrap_or(self.options.default_timeout))
            .await
    }

    async fn blocking<R, F>(&self, f: F) -> PoolResult<R>
    where
        F: FnOnce(&SharedMemoryPool) -> PoolResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || f(&pool))
            .await
            .map_err(|e| PoolError::storage(format!("pool call did not complete: {}", e)))?
    }

    /// Write a request record. Returns its correlation id.
    pub fn submit(&self, request: &Request) -> PoolResult<String> {
        self.pool.set(
            &request_key(&request.id),
            request.to_value(),
            Some(self.options.request_ttl),
        )?;
        tracing::debug!(request_id = %request.id, path = %request.path, "request submitted");
        Ok(request.id.clone())
    }

    /// Poll for the response to `id` until it appears or `timeout` elapses.
    ///
    /// On timeout the request record is withdrawn if no broker has claimed it.
    pub async fn await_response(&self, id: &str, timeout: Duration) -> PoolResult<Response> {
        let key = response_key(id);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let taken = {
                let key = key.clone();
                self.blocking(move |pool| pool.take(&key)).await?
            };
            if let Some(record) = taken {
                return Response::from_value(&record).map_err(|e| {
                    PoolError::storage(format!("malformed response {}: {}", id, e))
                });
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                let request = request_key(id);
                let withdrawn = self.blocking(move |pool| pool.delete(&request)).await?;
                tracing::debug!(
                    request_id = %id,
                    waited_ms = timeout.as_millis() as u64,
                    withdrawn,
                    "request timed out"
                );
                return Err(PoolError::timeout(id, timeout.as_millis() as u64));
            }

            let nap = self.options.poll_interval.min(deadline - now);
            tokio::time::sleep(nap).await;
        }
    }

    /// Create a broker serving this manager's routes.
    pub fn broker(&self) -> Broker {
        Broker::new(self.pool.clone(), self.routes.clone(), self.options)
    }
}

impl std::fmt::Debug for HttpManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpManager")
            .field("pool", &self.pool.name())
            .field("routes", &self.routes.paths())
            .field("streams", &self.stream_paths())
            .finish()
    }
}
