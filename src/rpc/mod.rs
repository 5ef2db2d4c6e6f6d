//! Request/Response Correlation.
//!
//! Built only from the Entry Store and periodic polling:
//! - [`message`] - Request, response and route directory records
//! - [`route`] - Local path to handler table
//! - [`client`] - Route registration and request issuing
//! - [`broker`] - At-most-once servicing of pending requests

pub mod broker;
pub mod client;
pub mod message;
pub mod route;

pub use broker::{Broker, PassReport};
pub use client::{HttpManager, RpcOptions};
pub use message::{Request, Response, ResponseStatus, RouteDirectoryEntry};
pub use route::{Handler, LocalRoute, RouteTable, StreamHandler, StreamRoute};
