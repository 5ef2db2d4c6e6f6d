//! Messaging facades built on the pool and the watch discipline.
//!
//! - [`rooms`] - Room pub/sub with retained history
//! - [`stream`] - Sequenced chunk streams

pub mod rooms;
pub mod stream;

pub use rooms::{RoomManager, RoomMessage};
pub use stream::{StreamChannel, StreamChunk};
