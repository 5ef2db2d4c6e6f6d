//! Local route dispatch.
//!
//! The [`RouteTable`] maps a path to a handler living in this process. It is
//! deliberately separate from the `http_route:` directory written to the
//! pool: the directory is for discovery only, and a broker serves a request
//! only if its own table holds the path.
//!
//! Streaming routes answer through a [`StreamChannel`] named after the
//! request id instead of a single response body. They are dispatched
//! locally only.

use crate::codec::Value;
use crate::core::time::Timestamp;
use crate::facade::stream::StreamChannel;
use crate::rpc::message::{Request, Response};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// A route handler.
pub trait Handler: Send + Sync {
    /// Handle a request, returning the response body.
    fn call(&self, request: &Request) -> anyhow::Result<Value>;
}

impl<F> Handler for F
where
    F: Fn(&Request) -> anyhow::Result<Value> + Send + Sync,
{
    fn call(&self, request: &Request) -> anyhow::Result<Value> {
        self(request)
    }
}

/// A streaming route handler.
pub trait StreamHandler: Send + Sync {
    /// Handle a request by publishing chunks to `stream`.
    fn call(&self, request: &Request, stream: &StreamChannel) -> anyhow::Result<()>;
}

impl<F> StreamHandler for F
where
    F: Fn(&Request, &StreamChannel) -> anyhow::Result<()> + Send + Sync,
{
    fn call(&self, request: &Request, stream: &StreamChannel) -> anyhow::Result<()> {
        self(request, stream)
    }
}

/// A handler registered in the local table.
#[derive(Clone)]
pub struct LocalRoute {
    /// Human-readable handler name.
    pub name: String,
    /// Type path of the handler.
    pub module: &'static str,
    /// The handler.
    pub handler: Arc<dyn Handler>,
}

impl LocalRoute {
    /// Run the handler, turning failures and panics into an error response.
    pub fn dispatch(&self, request: &Request, now: Timestamp) -> Response {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.handler.call(request)));
        match outcome {
            Ok(Ok(body)) => Response::ok(&request.id, body, now),
            Ok(Err(e)) => {
                tracing::warn!(
                    path = %request.path,
                    handler = %self.name,
                    request_id = %request.id,
                    error = %e,
                    "handler failed"
                );
                Response::error(&request.id, format!("{:#}", e), now)
            }
            Err(_) => {
                tracing::warn!(
                    path = %request.path,
                    handler = %self.name,
                    request_id = %request.id,
                    "handler panicked"
                );
                Response::error(&request.id, format!("handler {} panicked", self.name), now)
            }
        }
    }
}

impl std::fmt::Debug for LocalRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRoute")
            .field("name", &self.name)
            .field("module", &self.module)
            .finish()
    }
}

/// A streaming handler registered in the local table.
#[derive(Clone)]
pub struct StreamRoute {
    /// Human-readable handler name.
    pub name: String,
    /// Type path of the handler.
    pub module: &'static str,
    /// The handler.
    pub handler: Arc<dyn StreamHandler>,
}

impl StreamRoute {
    /// Run the handler against `stream`, turning a panic into an error.
    pub fn dispatch(&self, request: &Request, stream: &StreamChannel) -> anyhow::Result<()> {
        match catch_unwind(AssertUnwindSafe(|| self.handler.call(request, stream))) {
            Ok(outcome) => outcome,
            Err(_) => anyhow::bail!("handler {} panicked", self.name),
        }
    }
}

impl std::fmt::Debug for StreamRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRoute")
            .field("name", &self.name)
            .field("module", &self.module)
            .finish()
    }
}

/// Path to handler mapping for this process.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<HashMap<String, LocalRoute>>,
}

impl RouteTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `route` at `path`, returning any route it replaced.
    pub fn insert(&self, path: impl Into<String>, route: LocalRoute) -> Option<LocalRoute> {
        self.routes.write().insert(path.into(), route)
    }

    /// Remove the route at `path`.
    pub fn remove(&self, path: &str) -> Option<LocalRoute> {
        self.routes.write().remove(path)
    }

    /// Route registered at `path`.
    pub fn get(&self, path: &str) -> Option<LocalRoute> {
        self.routes.read().get(path).cloned()
    }

    /// Check if `path` has a local handler.
    pub fn contains(&self, path: &str) -> bool {
        self.routes.read().contains_key(path)
    }

    /// Registered paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.routes.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    /// Check if no routes are registered.
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}
