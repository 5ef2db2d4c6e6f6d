//! Request and response records exchanged through the pool.
//!
//! ```text
//! http_request:<id>   {id, path, method, data, meta, timestamp, reply_to_pid}
//! http_response:<id>  {id, status, body, error, handled_by, timestamp}
//! http_route:<path>   {registered_by, handler_name, handler_module, timestamp}
//! ```

use crate::codec::Value;
use crate::core::time::Timestamp;
use std::collections::BTreeMap;

/// Prefix of request keys.
pub const REQUEST_PREFIX: &str = "http_request:";
/// Prefix of response keys.
pub const RESPONSE_PREFIX: &str = "http_response:";
/// Prefix of route directory keys.
pub const ROUTE_PREFIX: &str = "http_route:";

/// Key of the request record for `id`.
pub fn request_key(id: &str) -> String {
    format!("{}{}", REQUEST_PREFIX, id)
}

/// Key of the response record for `id`.
pub fn response_key(id: &str) -> String {
    format!("{}{}", RESPONSE_PREFIX, id)
}

/// Key of the directory entry for `path`.
pub fn route_key(path: &str) -> String {
    format!("{}{}", ROUTE_PREFIX, path)
}

fn field_str(record: &Value, field: &str) -> Result<String, String> {
    record
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("record has no string field {:?}", field))
}

fn field_time(record: &Value, field: &str) -> Timestamp {
    record
        .get(field)
        .and_then(Value::as_f64)
        .map(Timestamp::from_secs_f64)
        .unwrap_or_else(Timestamp::zero)
}

fn field_pid(record: &Value, field: &str) -> u32 {
    record
        .get(field)
        .and_then(Value::as_u64)
        .and_then(|pid| u32::try_from(pid).ok())
        .unwrap_or(0)
}

// ============================================================================
// Request
// ============================================================================

/// A request addressed to a route.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlation id.
    pub id: String,
    /// Route path.
    pub path: String,
    /// Method name, e.g. `GET`.
    pub method: String,
    /// Request body.
    pub data: Value,
    /// Free-form metadata map.
    pub meta: BTreeMap<String, Value>,
    /// When the request was issued.
    pub timestamp: Timestamp,
    /// Process id of the caller.
    pub reply_to_pid: u32,
}

impl Request {
    /// Create a request with a fresh UUID v4 correlation id.
    pub fn new(
        path: impl Into<String>,
        method: impl Into<String>,
        data: impl Into<Value>,
        timestamp: Timestamp,
    ) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), path, method, data, timestamp)
    }

    /// Create a request with an explicit correlation id.
    pub fn with_id(
        id: impl Into<String>,
        path: impl Into<String>,
        method: impl Into<String>,
        data: impl Into<Value>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            method: method.into(),
            data: data.into(),
            meta: BTreeMap::new(),
            timestamp,
            reply_to_pid: std::process::id(),
        }
    }

    /// Attach a metadata field.
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Encode to the pool record shape.
    pub fn to_value(&self) -> Value {
        Value::from_pairs([
            ("id", Value::from(self.id.as_str())),
            ("path", Value::from(self.path.as_str())),
            ("method", Value::from(self.method.as_str())),
            ("data", self.data.clone()),
            ("meta", Value::Map(self.meta.clone())),
            ("timestamp", Value::Float(self.timestamp.as_secs_f64())),
            ("reply_to_pid", Value::from(self.reply_to_pid)),
        ])
    }

    /// Decode from the pool record shape.
    pub fn from_value(record: &Value) -> Result<Self, String> {
        Ok(Self {
            id: field_str(record, "id")?,
            path: field_str(record, "path")?,
            method: field_str(record, "method").unwrap_or_else(|_| "GET".to_string()),
            data: record.get("data").cloned().unwrap_or_default(),
            meta: record
                .get("meta")
                .and_then(Value::as_map)
                .cloned()
                .unwrap_or_default(),
            timestamp: field_time(record, "timestamp"),
            reply_to_pid: field_pid(record, "reply_to_pid"),
        })
    }
}

// ============================================================================
// Response
// ============================================================================

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    /// Handler returned a body.
    Ok,
    /// Handler failed; see [`Response::error`].
    Error,
}

impl ResponseStatus {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

/// A handler's answer to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Correlation id of the request.
    pub id: String,
    /// Outcome.
    pub status: ResponseStatus,
    /// Handler result; `Null` on error.
    pub body: Value,
    /// Handler failure message.
    pub error: Option<String>,
    /// Process id that ran the handler.
    pub handled_by: u32,
    /// When the response was produced.
    pub timestamp: Timestamp,
}

impl Response {
    /// Successful response.
    pub fn ok(id: impl Into<String>, body: Value, timestamp: Timestamp) -> Self {
        Self {
            id: id.into(),
            status: ResponseStatus::Ok,
            body,
            error: None,
            handled_by: std::process::id(),
            timestamp,
        }
    }

    /// Error-shaped response.
    pub fn error(id: impl Into<String>, message: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            id: id.into(),
            status: ResponseStatus::Error,
            body: Value::Null,
            error: Some(message.into()),
            handled_by: std::process::id(),
            timestamp,
        }
    }

    /// Check if the handler failed.
    pub fn is_error(&self) -> bool {
        self.status == ResponseStatus::Error
    }

    /// Encode to the pool record shape.
    pub fn to_value(&self) -> Value {
        Value::from_pairs([
            ("id", Value::from(self.id.as_str())),
            ("status", Value::from(self.status.as_str())),
            ("body", self.body.clone()),
            ("error", Value::from(self.error.clone())),
            ("handled_by", Value::from(self.handled_by)),
            ("timestamp", Value::Float(self.timestamp.as_secs_f64())),
        ])
    }

    /// Decode from the pool record shape.
    pub fn from_value(record: &Value) -> Result<Self, String> {
        let status = match field_str(record, "status")?.as_str() {
            "ok" => ResponseStatus::Ok,
            "error" => ResponseStatus::Error,
            other => return Err(format!("unknown response status {:?}", other)),
        };
        Ok(Self {
            id: field_str(record, "id")?,
            status,
            body: record.get("body").cloned().unwrap_or_default(),
            error: record
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string),
            handled_by: field_pid(record, "handled_by"),
            timestamp: field_time(record, "timestamp"),
        })
    }
}

// ============================================================================
// Route directory
// ============================================================================

/// Discovery record for a route. Presence does not imply the reader can
/// dispatch to it.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDirectoryEntry {
    /// Process that registered the route.
    pub registered_by: u32,
    /// Human-readable handler name.
    pub handler_name: String,
    /// Type path of the handler.
    pub handler_module: String,
    /// When the route was registered.
    pub timestamp: Timestamp,
}

impl RouteDirectoryEntry {
    /// Encode to the pool record shape.
    pub fn to_value(&self) -> Value {
        Value::from_pairs([
            ("registered_by", Value::from(self.registered_by)),
            ("handler_name", Value::from(self.handler_name.as_str())),
            ("handler_module", Value::from(self.handler_module.as_str())),
            ("timestamp", Value::Float(self.timestamp.as_secs_f64())),
        ])
    }

    /// Decode from the pool record shape.
    pub fn from_value(record: &Value) -> Result<Self, String> {
        Ok(Self {
            registered_by: field_pid(record, "registered_by"),
            handler_name: field_str(record, "handler_name")?,
            handler_module: field_str(record, "handler_module").unwrap_or_default(),
            timestamp: field_time(record, "timestamp"),
        })
    }
}
