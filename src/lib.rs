//! mvent - same-host coordination through a shared key-value pool.
//!
//! Independent OS processes attach to a named pool and exchange key-value
//! data without sockets. On top of the pool sit thin facades: room pub/sub,
//! sequenced streams and HTTP-style request/response.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Facades                               │
//! │   RoomManager   │   StreamChannel   │   HttpManager / Broker    │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Watch Discipline                          │
//! │        WatchManager │ WatchSource │ PeriodicTask (cursor)       │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       SharedMemoryPool                          │
//! │      Entry Store │ Expiry Policy │ Encryption │ Transactions    │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Segment                               │
//! │       N.pool image (header + codec payload) │ N.lock flock      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::error`] - Error taxonomy
//! - [`core::time`] - Timestamps and clocks
//!
//! ## Codec
//! - [`codec::value`] - Portable value model
//! - [`codec::wire`] - Tagged, length-prefixed encoding
//!
//! ## Storage
//! - [`storage::segment`] - Named segment image and teardown
//! - [`storage::lock`] - Cross-process lock
//!
//! ## Pool
//! - [`pool::store`] - Entry Store and transactions
//! - [`pool::expiry`] - Expiry sweeping
//! - [`pool::cipher`] - Value encryption
//!
//! ## Watch
//! - [`watch::manager`] - Subscriptions and delivery
//! - [`watch::source`] - Pollable sources
//! - [`watch::task`] - Cancellable periodic task
//!
//! ## RPC
//! - [`rpc::client`] - Route registration and requests
//! - [`rpc::broker`] - Request servicing
//!
//! ## Facades
//! - [`facade::rooms`] - Room messaging
//! - [`facade::stream`] - Sequenced streams
//!
//! ## Operations
//! - [`ops::monitoring`] - Event and handler metrics
//! - [`ops::telemetry`] - Tracing setup
//!
//! # Guarantees
//!
//! - A reader never observes a partially written entry
//! - Expired entries read as absent on every path
//! - Watch callbacks see items in ascending index order
//! - A request is served by at most one broker

// Core infrastructure
pub mod core;

// Portable values
pub mod codec;

// Segment files and locking
pub mod storage;

// The pool
pub mod pool;

// Change notification
pub mod watch;

// Request/response
pub mod rpc;

// Rooms and streams
pub mod facade;

// Operations and observability
pub mod ops;

// Re-exports for convenience
pub use self::core::config::Config;
pub use self::core::error::{PoolError, PoolResult};
pub use self::core::time::{Clock, ManualClock, SystemClock, Timestamp};
pub use codec::Value;
pub use facade::{RoomManager, StreamChannel};
pub use ops::Monitor;
pub use pool::{ExpirySweeper, PoolOptions, PoolStats, SharedMemoryPool};
pub use rpc::{Broker, HttpManager, Request, Response};
pub use watch::{TaskState, WatchManager, WatchOptions};
