//! Indexed views over pool keys that a watch loop can poll.

use crate::codec::Value;
use crate::core::error::PoolResult;
use crate::pool::store::SharedMemoryPool;

/// One deliverable item.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchItem {
    /// Position in the source; strictly increasing.
    pub index: u64,
    /// Value handed to callbacks.
    pub payload: Value,
}

/// Something a watch loop can poll for new items.
pub trait WatchSource: Send + Sync {
    /// Subscription key this source serves.
    fn subscription_key(&self) -> String;

    /// Highest index currently present, if any.
    fn head(&self, pool: &SharedMemoryPool) -> PoolResult<Option<u64>>;

    /// Items with index greater than `cursor` (all items for `None`), in
    /// ascending index order.
    fn fetch_after(&self, pool: &SharedMemoryPool, cursor: Option<u64>)
        -> PoolResult<Vec<WatchItem>>;
}

fn is_after(index: u64, cursor: Option<u64>) -> bool {
    cursor.map_or(true, |c| index > c)
}

// ============================================================================
// Room history
// ============================================================================

/// Key holding a room's history sequence.
pub fn history_key(room: &str) -> String {
    format!("{}:history", room)
}

/// A room's `<room>:history` list of `{index, message, timestamp}` records.
#[derive(Debug, Clone)]
pub struct RoomHistorySource {
    room: String,
}

impl RoomHistorySource {
    /// Watch `room`.
    pub fn new(room: impl Into<String>) -> Self {
        Self { room: room.into() }
    }

    fn records(&self, pool: &SharedMemoryPool) -> PoolResult<Vec<(u64, Value)>> {
        let history = pool.get(&history_key(&self.room))?;
        let Some(Value::List(records)) = history else {
            return Ok(Vec::new());
        };

        let mut out: Vec<(u64, Value)> = records
            .into_iter()
            .filter_map(|record| {
                let index = record.get("index").and_then(Value::as_u64)?;
                let message = record.get("message").cloned().unwrap_or_default();
                Some((index, message))
            })
            .collect();
        out.sort_by_key(|(index, _)| *index);
        Ok(out)
    }
}

impl WatchSource for RoomHistorySource {
    fn subscription_key(&self) -> String {
        format!("room:{}", self.room)
    }

    fn head(&self, pool: &SharedMemoryPool) -> PoolResult<Option<u64>> {
        Ok(self.records(pool)?.last().map(|(index, _)| *index))
    }

    fn fetch_after(
        &self,
        pool: &SharedMemoryPool,
        cursor: Option<u64>,
    ) -> PoolResult<Vec<WatchItem>> {
        Ok(self
            .records(pool)?
            .into_iter()
            .filter(|(index, _)| is_after(*index, cursor))
            .map(|(index, payload)| WatchItem { index, payload })
            .collect())
    }
}

// ============================================================================
// Sequenced keys
// ============================================================================

/// Keys `<stream>:<seq>` holding `{seq, timestamp, data}` chunks.
///
/// Non-numeric suffixes such as the `<stream>:head` counter are ignored.
#[derive(Debug, Clone)]
pub struct SequenceSource {
    stream: String,
}

impl SequenceSource {
    /// Watch `stream`.
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
        }
    }

    fn chunks(&self, pool: &SharedMemoryPool) -> PoolResult<Vec<(u64, Value)>> {
        let prefix = format!("{}:", self.stream);
        let mut out: Vec<(u64, Value)> = pool
            .scan_prefix(&prefix)?
            .into_iter()
            .filter_map(|(key, chunk)| {
                let seq = key[prefix.len()..].parse::<u64>().ok()?;
                let data = chunk.get("data").cloned().unwrap_or_default();
                Some((seq, data))
            })
            .collect();
        out.sort_by_key(|(seq, _)| *seq);
        Ok(out)
    }
}

impl WatchSource for SequenceSource {
    fn subscription_key(&self) -> String {
        format!("stream:{}", self.stream)
    }

    fn head(&self, pool: &SharedMemoryPool) -> PoolResult<Option<u64>> {
        Ok(self.chunks(pool)?.last().map(|(seq, _)| *seq))
    }

    fn fetch_after(
        &self,
        pool: &SharedMemoryPool,
        cursor: Option<u64>,
    ) -> PoolResult<Vec<WatchItem>> {
        Ok(self
            .chunks(pool)?
            .into_iter()
            .filter(|(seq, _)| is_after(*seq, cursor))
            .map(|(index, payload)| WatchItem { index, payload })
            .collect())
    }
}
