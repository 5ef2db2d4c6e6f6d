//! Sequenced streams.
//!
//! A stream named `s` stores chunks under `s:<seq>` as `{seq, timestamp,
//! data}` and its last allocated sequence number under `s:head`. Publishing
//! bumps the head and writes the chunk in the same transaction, so a chunk
//! becomes visible only together with every chunk before it.

use crate::codec::Value;
use crate::core::error::{PoolError, PoolResult};
use crate::core::time::Timestamp;
use crate::pool::store::SharedMemoryPool;
use crate::watch::manager::{CallbackId, WatchManager, WatchOptions};
use crate::watch::source::{SequenceSource, WatchSource};
use crate::watch::task::TaskState;
use std::sync::Arc;
use std::time::Duration;

/// One published chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    /// Sequence number; starts at 1.
    pub seq: u64,
    /// When the chunk was published.
    pub timestamp: Timestamp,
    /// Chunk payload.
    pub data: Value,
}

impl StreamChunk {
    fn to_value(&self) -> Value {
        Value::from_pairs([
            ("seq", Value::from(self.seq)),
            ("timestamp", Value::Float(self.timestamp.as_secs_f64())),
            ("data", self.data.clone()),
        ])
    }

    fn from_value(record: &Value) -> Option<Self> {
        Some(Self {
            seq: record.get("seq").and_then(Value::as_u64)?,
            timestamp: record
                .get("timestamp")
                .and_then(Value::as_f64)
                .map(Timestamp::from_secs_f64)
                .unwrap_or_else(Timestamp::zero),
            data: record.get("data").cloned().unwrap_or_default(),
        })
    }
}

/// Publisher and subscriber handle for one stream.
pub struct StreamChannel {
    pool: Arc<SharedMemoryPool>,
    stream: String,
    chunk_ttl: Option<Duration>,
    source: Arc<SequenceSource>,
    watch: WatchManager,
}

impl StreamChannel {
    /// Open `stream` with default watch options.
    pub fn new(pool: Arc<SharedMemoryPool>, stream: &str) -> PoolResult<Self> {
        Self::with_options(pool, stream, WatchOptions::default())
    }

    /// Open `stream` with the given watch options.
    pub fn with_options(
        pool: Arc<SharedMemoryPool>,
        stream: &str,
        options: WatchOptions,
    ) -> PoolResult<Self> {
        if stream.is_empty() || stream.contains(':') {
            return Err(PoolError::invalid(format!(
                "invalid stream name {:?}",
                stream
            )));
        }
        Ok(Self {
            watch: WatchManager::with_options(pool.clone(), options),
            source: Arc::new(SequenceSource::new(stream)),
            pool,
            stream: stream.to_string(),
            chunk_ttl: None,
        })
    }

    /// Expire published chunks after `ttl`.
    pub fn chunk_ttl(mut self, ttl: Duration) -> Self {
        self.chunk_ttl = Some(ttl);
        self
    }

    /// Stream name.
    pub fn name(&self) -> &str {
        &self.stream
    }

    fn head_key(&self) -> String {
        format!("{}:head", self.stream)
    }

    /// Last allocated sequence number; 0 before the first publish.
    pub fn head(&self) -> PoolResult<u64> {
        Ok(self
            .pool
            .get(&self.head_key())?
            .and_then(|v| v.as_u64())
            .unwrap_or(0))
    }

    /// Publish a chunk. Returns its sequence number.
    pub fn publish(&self, data: impl Into<Value>) -> PoolResult<u64> {
        let data = data.into();
        let head_key = self.head_key();

        let seq = self.pool.transaction(|tx| {
            let seq = tx.get(&head_key)?.and_then(|v| v.as_u64()).unwrap_or(0) + 1;
            let chunk = StreamChunk {
                seq,
                timestamp: tx.now(),
                data,
            };
            tx.set(&head_key, Value::from(seq), None)?;
            tx.set(
                &format!("{}:{}", self.stream, seq),
                chunk.to_value(),
                self.chunk_ttl,
            )?;
            Ok(seq)
        })?;

        tracing::debug!(stream = %self.stream, seq, "chunk published");
        Ok(seq)
    }

    /// Deliver chunks published after this call to `callback`.
    pub fn subscribe<F>(&self, callback: F) -> PoolResult<CallbackId>
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.watch.subscribe(self.source.clone(), callback)
    }

    /// Remove one callback.
    pub fn unsubscribe(&self, id: CallbackId) -> bool {
        self.watch.unsubscribe(&self.source.subscription_key(), id)
    }

    /// Chunks still present in the pool, in sequence order.
    pub fn chunks(&self) -> PoolResult<Vec<StreamChunk>> {
        let prefix = format!("{}:", self.stream);
        let mut chunks: Vec<StreamChunk> = self
            .pool
            .scan_prefix(&prefix)?
            .iter()
            .filter(|(key, _)| key[prefix.len()..].parse::<u64>().is_ok())
            .filter_map(|(_, record)| StreamChunk::from_value(record))
            .collect();
        chunks.sort_by_key(|c| c.seq);
        Ok(chunks)
    }

    /// Watch loop state, if subscribed.
    pub fn state(&self) -> Option<TaskState> {
        self.watch.state(&self.source.subscription_key())
    }

    /// Stop delivering to subscribers.
    pub async fn stop(&self) -> bool {
        self.watch.disconnect(&self.source.subscription_key()).await
    }
}

impl std::fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamChannel")
            .field("pool", &self.pool.name())
            .field("stream", &self.stream)
            .field("chunk_ttl", &self.chunk_ttl)
            .finish()
    }
}
