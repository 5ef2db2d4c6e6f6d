//! Error types for pool operations.
//!
//! Every synchronous pool call surfaces its failure to the immediate caller.
//! Background loops classify faults with [`PoolError::is_fatal_for_loop`] to
//! decide between skip-and-retry and stopping the loop.

use thiserror::Error;

/// Common pool error conditions.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// The segment is unreachable or its contents are corrupted.
    #[error("StorageFault: {message}")]
    StorageFault { message: String },

    /// Secret missing, mismatched, or a sealed value failed authentication.
    #[error("DecryptionFault: {message}")]
    DecryptionFault { message: String },

    /// No handler is registered locally for the requested path.
    #[error("RouteNotFound: {path}")]
    RouteNotFound { path: String },

    /// A request/response deadline elapsed before the response appeared.
    #[error("Timeout: request {request_id} got no response within {waited_ms}ms")]
    Timeout { request_id: String, waited_ms: u64 },

    /// A subscriber callback failed. Isolated by the watch loop.
    #[error("CallbackFault on {subscription}: {message}")]
    CallbackFault {
        subscription: String,
        message: String,
    },

    /// The caller misused the API (bad name, malformed record, no runtime).
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

impl PoolError {
    /// Create a StorageFault error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageFault {
            message: message.into(),
        }
    }

    /// Create a DecryptionFault error.
    pub fn decryption(message: impl Into<String>) -> Self {
        Self::DecryptionFault {
            message: message.into(),
        }
    }

    /// Create a RouteNotFound error.
    pub fn route_not_found(path: impl Into<String>) -> Self {
        Self::RouteNotFound { path: path.into() }
    }

    /// Create a Timeout error.
    pub fn timeout(request_id: impl Into<String>, waited_ms: u64) -> Self {
        Self::Timeout {
            request_id: request_id.into(),
            waited_ms,
        }
    }

    /// Create a CallbackFault error.
    pub fn callback(subscription: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CallbackFault {
            subscription: subscription.into(),
            message: message.into(),
        }
    }

    /// Create an InvalidRequest error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Wrap an I/O error with context as a StorageFault.
    pub fn io(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        Self::StorageFault {
            message: format!("{}: {}", context, err),
        }
    }

    /// Check if a single occurrence may be skipped and retried next cycle.
    ///
    /// Only storage faults qualify; a streak of them is still fatal.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StorageFault { .. })
    }

    /// Check if this error stops a background loop immediately.
    pub fn is_fatal_for_loop(&self) -> bool {
        matches!(
            self,
            Self::DecryptionFault { .. } | Self::InvalidRequest { .. }
        )
    }

    /// Check if this error is a request/response deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Stable identifier for logs and error-shaped responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StorageFault { .. } => "StorageFault",
            Self::DecryptionFault { .. } => "DecryptionFault",
            Self::RouteNotFound { .. } => "RouteNotFound",
            Self::Timeout { .. } => "Timeout",
            Self::CallbackFault { .. } => "CallbackFault",
            Self::InvalidRequest { .. } => "InvalidRequest",
        }
    }
}

/// Result type using PoolError.
pub type PoolResult<T> = Result<T, PoolError>;
