//! Entry Store.
//!
//! [`SharedMemoryPool`] is a handle on a named segment. Any handle opened with
//! the same name, directory and secret observes the same entries, whichever
//! process it lives in.
//!
//! # Visibility
//!
//! - A mutation is visible to every handle once the call returns
//! - Expired entries read as absent on every path, swept or not
//! - `get_all` and `scan_prefix` are point-in-time snapshots

use crate::codec::Value;
use crate::core::error::{PoolError, PoolResult};
use crate::core::time::{system_clock, SharedClock, Timestamp};
use crate::pool::cipher::ValueCipher;
use crate::pool::entry::Entry;
use crate::storage::segment::{Segment, SegmentIdentity, SegmentImage};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Options for attaching to a pool.
#[derive(Clone)]
pub struct PoolOptions {
    /// Segment directory; `None` selects [`Segment::default_dir`].
    pub dir: Option<PathBuf>,

    /// Encryption secret; `None` for a plain pool.
    pub secret: Option<Vec<u8>>,

    /// Clock used for expiry decisions.
    pub clock: SharedClock,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            dir: None,
            secret: None,
            clock: system_clock(),
        }
    }
}

impl PoolOptions {
    /// Create default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the segment directory.
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Set the encryption secret.
    pub fn secret(mut self, secret: impl AsRef<[u8]>) -> Self {
        self.secret = Some(secret.as_ref().to_vec());
        self
    }

    /// Set the clock.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Resolved segment directory.
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(Segment::default_dir)
    }
}

impl std::fmt::Debug for PoolOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolOptions")
            .field("dir", &self.dir)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Pool statistics for external monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Pool name.
    pub name: String,
    /// Unexpired entries.
    pub entry_count: usize,
    /// Expired entries still occupying the segment.
    pub expired_pending: usize,
    /// Segment image size in bytes.
    pub approx_bytes: u64,
    /// Whether values are sealed.
    pub encrypted: bool,
}

/// Handle on a shared pool.
///
/// Dropping the handle detaches it; the segment survives until
/// [`SharedMemoryPool::destroy`] is called by its owner.
pub struct SharedMemoryPool {
    segment: Segment,
    cipher: Option<ValueCipher>,
    clock: SharedClock,
}

impl SharedMemoryPool {
    /// Attach to `name` with default options, creating it if absent.
    pub fn open(name: &str) -> PoolResult<Self> {
        Self::open_with(name, PoolOptions::default())
    }

    /// Attach to `name`, creating it if absent.
    ///
    /// Fails with a decryption fault if the secret does not match the
    /// secret the pool was created with (or its absence).
    pub fn open_with(name: &str, options: PoolOptions) -> PoolResult<Self> {
        let cipher = options.secret.as_deref().map(ValueCipher::from_secret);
        let identity = match &cipher {
            Some(c) => SegmentIdentity::encrypted(c.key_check()),
            None => SegmentIdentity::plain(),
        };
        let segment = Segment::attach(&options.resolved_dir(), name, identity)?;

        Ok(Self {
            segment,
            cipher,
            clock: options.clock,
        })
    }

    /// Remove a pool's segment. Returns whether it existed.
    ///
    /// Only the designated owner should call this; attached handles in other
    /// processes fail with a storage fault afterwards.
    pub fn destroy(dir: &Path, name: &str) -> PoolResult<bool> {
        Segment::destroy(dir, name)
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Segment directory.
    pub fn dir(&self) -> &Path {
        self.segment.dir()
    }

    /// Check if values are sealed.
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Current time on this handle's clock.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub(crate) fn segment(&self) -> &Segment {
        &self.segment
    }

    // ========================================================================
    // Entry Store
    // ========================================================================

    /// Insert or overwrite `key`. A `ttl` sets a fresh expiry; `None` clears it.
    pub fn set(&self, key: &str, value: impl Into<Value>, ttl: Option<Duration>) -> PoolResult<()> {
        let value = value.into();
        self.transaction(|tx| tx.set(key, value, ttl))
    }

    /// Current value of `key`, or `None` if absent or expired.
    pub fn get(&self, key: &str) -> PoolResult<Option<Value>> {
        let image = self.segment.read()?;
        let now = self.now();
        match image.get(key) {
            Some(entry) if !entry.is_expired_at(now) => self.reveal(key, &entry.value).map(Some),
            _ => Ok(None),
        }
    }

    /// Current value of `key`, or `default` if absent or expired.
    pub fn get_or(&self, key: &str, default: impl Into<Value>) -> PoolResult<Value> {
        Ok(self.get(key)?.unwrap_or_else(|| default.into()))
    }

    /// Remove `key`. Returns whether a live entry was removed.
    ///
    /// Removing an absent key is not an error.
    pub fn delete(&self, key: &str) -> PoolResult<bool> {
        self.transaction(|tx| Ok(tx.delete(key)))
    }

    /// Snapshot of every unexpired key and its value.
    pub fn get_all(&self) -> PoolResult<BTreeMap<String, Value>> {
        let image = self.segment.read()?;
        let now = self.now();
        image
            .iter()
            .filter(|(_, entry)| !entry.is_expired_at(now))
            .map(|(key, entry)| Ok((key.clone(), self.reveal(key, &entry.value)?)))
            .collect()
    }

    /// Entry count and approximate byte usage.
    pub fn get_stats(&self) -> PoolResult<PoolStats> {
        let image = self.segment.read()?;
        let now = self.now();
        let expired_pending = image
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .count();

        Ok(PoolStats {
            name: self.name().to_string(),
            entry_count: image.len() - expired_pending,
            expired_pending,
            approx_bytes: image.byte_len(),
            encrypted: self.is_encrypted(),
        })
    }

    // ========================================================================
    // Extras
    // ========================================================================

    /// Check if `key` holds an unexpired entry.
    pub fn contains(&self, key: &str) -> PoolResult<bool> {
        let image = self.segment.read()?;
        let now = self.now();
        Ok(image.get(key).is_some_and(|e| !e.is_expired_at(now)))
    }

    /// Unexpired keys in lexical order.
    pub fn keys(&self) -> PoolResult<Vec<String>> {
        let image = self.segment.read()?;
        let now = self.now();
        Ok(image
            .iter()
            .filter(|(_, entry)| !entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect())
    }

    /// Snapshot of unexpired entries whose key starts with `prefix`.
    pub fn scan_prefix(&self, prefix: &str) -> PoolResult<Vec<(String, Value)>> {
        let image = self.segment.read()?;
        let now = self.now();
        image
            .iter_prefix(prefix)
            .filter(|(_, entry)| !entry.is_expired_at(now))
            .map(|(key, entry)| Ok((key.clone(), self.reveal(key, &entry.value)?)))
            .collect()
    }

    /// Atomically read and remove `key`.
    ///
    /// Of several racing callers exactly one receives the value.
    pub fn take(&self, key: &str) -> PoolResult<Option<Value>> {
        self.transaction(|tx| tx.take(key))
    }

    /// Atomically replace the value of `key` with `f(current)`.
    ///
    /// The new value is written with `ttl`, like [`SharedMemoryPool::set`].
    pub fn update<F>(&self, key: &str, ttl: Option<Duration>, f: F) -> PoolResult<Value>
    where
        F: FnOnce(Option<Value>) -> PoolResult<Value>,
    {
        self.transaction(|tx| {
            let next = f(tx.get(key)?)?;
            tx.set(key, next.clone(), ttl)?;
            Ok(next)
        })
    }

    /// Run a multi-key mutation under one exclusive lock acquisition.
    ///
    /// Nothing is written if `f` fails.
    pub fn transaction<R, F>(&self, f: F) -> PoolResult<R>
    where
        F: FnOnce(&mut Transaction<'_>) -> PoolResult<R>,
    {
        let now = self.now();
        self.segment.mutate(|image| {
            let mut tx = Transaction {
                image,
                cipher: self.cipher.as_ref(),
                now,
            };
            f(&mut tx)
        })
    }

    /// Remove every entry. Returns how many were present.
    pub fn clear(&self) -> PoolResult<usize> {
        self.segment.mutate(|image| Ok(image.retain(|_, _| false).len()))
    }

    fn reveal(&self, key: &str, stored: &Value) -> PoolResult<Value> {
        match &self.cipher {
            Some(cipher) => cipher.open(key, stored),
            None => Ok(stored.clone()),
        }
    }
}

impl std::fmt::Debug for SharedMemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryPool")
            .field("name", &self.name())
            .field("dir", &self.dir())
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}

impl Drop for SharedMemoryPool {
    fn drop(&mut self) {
        tracing::debug!(pool = %self.name(), "detached from pool");
    }
}

/// Multi-key mutation scope. See [`SharedMemoryPool::transaction`].
pub struct Transaction<'a> {
    image: &'a mut SegmentImage,
    cipher: Option<&'a ValueCipher>,
    now: Timestamp,
}

impl Transaction<'_> {
    /// Time the transaction started.
    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Current value of `key`, or `None` if absent or expired.
    pub fn get(&self, key: &str) -> PoolResult<Option<Value>> {
        match self.image.get(key) {
            Some(entry) if !entry.is_expired_at(self.now) => match self.cipher {
                Some(cipher) => cipher.open(key, &entry.value).map(Some),
                None => Ok(Some(entry.value.clone())),
            },
            _ => Ok(None),
        }
    }

    /// Insert or overwrite `key`.
    pub fn set(&mut self, key: &str, value: impl Into<Value>, ttl: Option<Duration>) -> PoolResult<()> {
        if key.is_empty() {
            return Err(PoolError::invalid("key must not be empty"));
        }
        let value = value.into();
        let stored = match self.cipher {
            Some(cipher) => cipher.seal(key, &value)?,
            None => value,
        };
        self.image
            .insert(key.to_string(), Entry::new(stored, self.now, ttl));
        Ok(())
    }

    /// Remove `key`. Returns whether a live entry was removed.
    pub fn delete(&mut self, key: &str) -> bool {
        self.image
            .remove(key)
            .is_some_and(|entry| !entry.is_expired_at(self.now))
    }

    /// Read and remove `key`.
    pub fn take(&mut self, key: &str) -> PoolResult<Option<Value>> {
        let value = self.get(key)?;
        self.image.remove(key);
        Ok(value)
    }

    /// Check if `key` holds an unexpired entry.
    pub fn contains(&self, key: &str) -> bool {
        self.image
            .get(key)
            .is_some_and(|entry| !entry.is_expired_at(self.now))
    }
}
