//! Watch Discipline: polling-based change notification.
//!
//! The pool has no push channel. Consumers register callbacks with a
//! [`WatchManager`], which runs one [`PeriodicTask`] per subscription key
//! and polls a [`WatchSource`] for items past its cursor.
//!
//! - [`task`] - Cancellable periodic task and its state machine
//! - [`source`] - Room history and sequenced-key sources
//! - [`manager`] - Subscriptions, delivery and fault isolation

pub mod manager;
pub mod source;
pub mod task;

pub use manager::{Callback, CallbackId, WatchManager, WatchOptions, WatchStats};
pub use source::{history_key, RoomHistorySource, SequenceSource, WatchItem, WatchSource};
pub use task::{
    FaultStreak, PeriodicTask, TaskState, TickOutcome, DEFAULT_MAX_CONSECUTIVE_FAULTS,
};
