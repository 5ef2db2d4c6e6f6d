//! Storage layer.
//!
//! This module owns the bytes behind a pool: the named segment image and the
//! cross-process lock that serializes access to it.
//!
//! # Modules
//!
//! - [`lock`] - Advisory `flock(2)` lock, shared or exclusive
//! - [`segment`] - Segment image, header, attach and teardown
//!
//! # Guarantees
//!
//! - Every mutation holds the exclusive lock for its full read-modify-write span
//! - Readers hold the shared lock and see either the previous or the next image
//! - Dropping a handle never removes the segment; teardown is explicit

pub mod lock;
pub mod segment;

// Re-exports for convenience
pub use lock::{LockMode, SegmentLock};
pub use segment::{Segment, SegmentFlags, SegmentHeader, SegmentIdentity, SegmentImage};
