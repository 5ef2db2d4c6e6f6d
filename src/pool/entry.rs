//! Pool entries.
//!
//! On the segment an entry is the map `{value, ttl, created_at}` with `ttl`
//! and `created_at` as float seconds. `expires_at` is derived, never stored.

use crate::codec::Value;
use crate::core::time::Timestamp;
use std::time::Duration;

/// A value stored under a pool key.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Stored payload. Sealed bytes when the pool is encrypted.
    pub value: Value,

    /// When the entry was written.
    pub created_at: Timestamp,

    /// Time-to-live from `created_at`; `None` means no expiry.
    pub ttl: Option<Duration>,
}

impl Entry {
    /// Create a new entry.
    pub fn new(value: Value, created_at: Timestamp, ttl: Option<Duration>) -> Self {
        Self {
            value,
            created_at,
            ttl,
        }
    }

    /// Instant after which the entry is logically absent.
    pub fn expires_at(&self) -> Option<Timestamp> {
        self.ttl.map(|ttl| self.created_at.add(ttl))
    }

    /// Check if the entry has expired at `now`.
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.expires_at()
            .is_some_and(|deadline| now.is_at_or_after(deadline))
    }

    /// Encode to the segment wire shape.
    pub fn to_value(&self) -> Value {
        let ttl = match self.ttl {
            Some(ttl) => Value::Float(ttl.as_secs_f64()),
            None => Value::Null,
        };
        Value::from_pairs([
            ("value", self.value.clone()),
            ("ttl", ttl),
            ("created_at", Value::Float(self.created_at.as_secs_f64())),
        ])
    }

    /// Decode from the segment wire shape.
    pub fn from_value(raw: Value) -> Result<Self, String> {
        let Value::Map(mut map) = raw else {
            return Err(format!("entry must be a map, got {}", raw.type_name()));
        };

        let value = map.remove("value").ok_or("entry has no value field")?;

        let created_at = map
            .get("created_at")
            .and_then(Value::as_f64)
            .map(Timestamp::from_secs_f64)
            .ok_or("entry has no numeric created_at")?;

        let ttl = match map.get("ttl") {
            None | Some(Value::Null) => None,
            Some(v) => {
                let secs = v.as_f64().ok_or("entry ttl is not numeric")?;
                if !secs.is_finite() || secs < 0.0 {
                    return Err(format!("entry ttl out of range: {}", secs));
                }
                Some(Duration::from_millis((secs * 1000.0).round() as u64))
            }
        };

        Ok(Self {
            value,
            created_at,
            ttl,
        })
    }
}
