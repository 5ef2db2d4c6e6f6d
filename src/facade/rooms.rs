//! Room messaging.
//!
//! A room is the key `<room>:history` holding an append-only list of
//! `{index, message, timestamp}` records. Appends run inside one pool
//! transaction, so indices are unique and strictly increasing across every
//! process sending to the room.

use crate::codec::Value;
use crate::core::error::{PoolError, PoolResult};
use crate::core::time::Timestamp;
use crate::pool::store::SharedMemoryPool;
use crate::watch::manager::{CallbackId, WatchManager, WatchOptions};
use crate::watch::source::{history_key, RoomHistorySource, WatchSource};
use std::sync::Arc;

/// One message in a room's history.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomMessage {
    /// Position in the room; starts at 0.
    pub index: u64,
    /// Message payload.
    pub message: Value,
    /// When the message was appended.
    pub timestamp: Timestamp,
}

impl RoomMessage {
    fn to_value(&self) -> Value {
        Value::from_pairs([
            ("index", Value::from(self.index)),
            ("message", self.message.clone()),
            ("timestamp", Value::Float(self.timestamp.as_secs_f64())),
        ])
    }

    fn from_value(record: &Value) -> Option<Self> {
        Some(Self {
            index: record.get("index").and_then(Value::as_u64)?,
            message: record.get("message").cloned().unwrap_or_default(),
            timestamp: record
                .get("timestamp")
                .and_then(Value::as_f64)
                .map(Timestamp::from_secs_f64)
                .unwrap_or_else(Timestamp::zero),
        })
    }
}

fn check_room(room: &str) -> PoolResult<()> {
    if room.is_empty() {
        return Err(PoolError::invalid("room name must not be empty"));
    }
    Ok(())
}

fn subscription_key(room: &str) -> String {
    RoomHistorySource::new(room).subscription_key()
}

/// Room pub/sub over a pool.
pub struct RoomManager {
    pool: Arc<SharedMemoryPool>,
    watch: WatchManager,
}

impl RoomManager {
    /// Create a manager with default watch options.
    pub fn new(pool: Arc<SharedMemoryPool>) -> Self {
        Self::with_options(pool, WatchOptions::default())
    }

    /// Create a manager with the given watch options.
    pub fn with_options(pool: Arc<SharedMemoryPool>, options: WatchOptions) -> Self {
        let watch = WatchManager::with_options(pool.clone(), options);
        Self { pool, watch }
    }

    /// Underlying watch manager.
    pub fn watcher(&self) -> &WatchManager {
        &self.watch
    }

    /// Ensure the room's history exists.
    pub fn connect(&self, room: &str) -> PoolResult<()> {
        check_room(room)?;
        let key = history_key(room);
        self.pool.transaction(|tx| {
            if !matches!(tx.get(&key)?, Some(Value::List(_))) {
                tx.set(&key, Value::List(Vec::new()), None)?;
            }
            Ok(())
        })
    }

    /// Append `message` to the room. Returns its index.
    pub fn send(&self, room: &str, message: impl Into<Value>) -> PoolResult<u64> {
        check_room(room)?;
        let key = history_key(room);
        let message = message.into();

        let index = self.pool.transaction(|tx| {
            let mut history = match tx.get(&key)? {
                Some(Value::List(items)) => items,
                _ => Vec::new(),
            };
            let index = history
                .iter()
                .filter_map(|r| r.get("index").and_then(Value::as_u64))
                .max()
                .map_or(0, |last| last + 1);

            let record = RoomMessage {
                index,
                message,
                timestamp: tx.now(),
            };
            history.push(record.to_value());
            tx.set(&key, Value::List(history), None)?;
            Ok(index)
        })?;

        tracing::debug!(room = %room, index, "message sent");
        Ok(index)
    }

    /// Deliver messages sent after this call to `callback`.
    pub fn subscribe<F>(&self, room: &str, callback: F) -> PoolResult<CallbackId>
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        check_room(room)?;
        self.watch
            .subscribe(Arc::new(RoomHistorySource::new(room)), callback)
    }

    /// Remove one callback from the room.
    pub fn unsubscribe(&self, room: &str, id: CallbackId) -> bool {
        self.watch.unsubscribe(&subscription_key(room), id)
    }

    /// Full history of the room, oldest first.
    pub fn history(&self, room: &str) -> PoolResult<Vec<RoomMessage>> {
        check_room(room)?;
        let Some(Value::List(items)) = self.pool.get(&history_key(room))? else {
            return Ok(Vec::new());
        };
        let mut messages: Vec<RoomMessage> =
            items.iter().filter_map(RoomMessage::from_value).collect();
        messages.sort_by_key(|m| m.index);
        Ok(messages)
    }

    /// Stop watching the room. The history stays in the pool.
    pub async fn disconnect(&self, room: &str) -> bool {
        self.watch.disconnect(&subscription_key(room)).await
    }

    /// Stop watching every room.
    pub async fn cleanup(&self) {
        self.watch.cleanup().await;
    }
}

impl std::fmt::Debug for RoomManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomManager")
            .field("pool", &self.pool.name())
            .field("watch", &self.watch)
            .finish()
    }
}
