//! The shared-memory coordination pool.
//!
//! - [`entry`] - Stored entries and their wire shape
//! - [`store`] - Entry Store: `set`/`get`/`delete`/`get_all`/`get_stats` and transactions
//! - [`expiry`] - Sweeping of expired entries
//! - [`cipher`] - Optional transparent value encryption

pub mod cipher;
pub mod entry;
pub mod expiry;
pub mod store;

pub use cipher::ValueCipher;
pub use entry::Entry;
pub use expiry::{sweep_expired, ExpirySweeper, SweepReport};
pub use store::{PoolOptions, PoolStats, SharedMemoryPool, Transaction};
