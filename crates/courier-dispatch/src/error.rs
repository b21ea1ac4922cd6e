//! Error types for message dispatch.
//!
//! Separates scheduling refusals (pool exhausted, slot unavailable), queue
//! faults and delivery failures. Every enum reports whether the condition is
//! temporary so pumps can leave messages for redelivery instead of giving up.

use std::fmt;

use courier_core::{CoreError, HandlerId};
use thiserror::Error;

/// Result type alias for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Failure of a scheduler or pump operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Every handler slot is busy; the message must stay unacknowledged.
    #[error("handler pool exhausted ({pool_size} slots busy)")]
    PoolExhausted {
        /// Configured pool size.
        pool_size: usize,
    },

    /// A slot worker did not accept its hand-off.
    #[error("{handler} unavailable")]
    SlotUnavailable {
        /// Slot that refused the work item.
        handler: HandlerId,
    },

    /// Durable state could not be read or written.
    #[error("state store error: {message}")]
    Store {
        /// Store error message.
        message: String,
    },

    /// The queue failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The unit has stopped and no longer accepts commands.
    #[error("dispatch unit stopped")]
    Stopped,
}

impl DispatchError {
    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store { message: message.into() }
    }

    /// Whether a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PoolExhausted { .. } | Self::SlotUnavailable { .. } | Self::Store { .. } => true,
            Self::Queue(e) => e.is_retryable(),
            Self::Stopped => false,
        }
    }
}

impl From<CoreError> for DispatchError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::Store(message) => Self::store(message),
            other => Self::store(other.to_string()),
        }
    }
}

/// Failure reported by a queue client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Temporary fault; the call may be retried.
    #[error("transient queue fault: {message}")]
    Transient {
        /// Fault description.
        message: String,
    },

    /// Permanent fault such as a lost lock or a deleted queue.
    #[error("queue failure: {message}")]
    Fatal {
        /// Failure description.
        message: String,
    },
}

impl QueueError {
    /// Creates a transient fault.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient { message: message.into() }
    }

    /// Creates a permanent failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal { message: message.into() }
    }

    /// Whether the call may be retried.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Failure of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure.
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Seconds before the request timed out.
        timeout_seconds: u64,
    },

    /// Receiver answered with a 4xx status.
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code.
        status_code: u16,
        /// Response body content.
        body: String,
    },

    /// Receiver answered with a 5xx status.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code.
        status_code: u16,
        /// Response body content.
        body: String,
    },

    /// No endpoint is routed for the reader the message came from.
    #[error("no endpoint routed for reader {reader}")]
    NoRoute {
        /// Reader name.
        reader: String,
    },

    /// Invalid delivery configuration.
    #[error("invalid delivery configuration: {message}")]
    ConfigurationError {
        /// Configuration error message.
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a client error from an HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from an HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Whether redelivering the message may succeed.
    ///
    /// Network errors, timeouts, 5xx responses and missing routes are
    /// temporary; 4xx responses and configuration problems are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::NoRoute { .. } => true,

            Self::ClientError { .. } | Self::ConfigurationError { .. } => false,
        }
    }
}

/// Category of delivery error for logs and telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues.
    Network,
    /// HTTP client errors (4xx).
    Client,
    /// HTTP server errors (5xx).
    Server,
    /// Routing or configuration problems.
    Configuration,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. } => Self::Client,
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::NoRoute { .. } | DeliveryError::ConfigurationError { .. } => {
                Self::Configuration
            },
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(30).is_retryable());
        assert!(DeliveryError::server_error(503, "unavailable").is_retryable());
        assert!(!DeliveryError::client_error(404, "not found").is_retryable());
        assert!(!DeliveryError::configuration("bad url").is_retryable());

        assert!(DispatchError::PoolExhausted { pool_size: 3 }.is_retryable());
        assert!(DispatchError::Queue(QueueError::transient("throttled")).is_retryable());
        assert!(!DispatchError::Queue(QueueError::fatal("lock lost")).is_retryable());
        assert!(!DispatchError::Stopped.is_retryable());
    }

    #[test]
    fn error_category_conversion() {
        assert_eq!(ErrorCategory::from(&DeliveryError::timeout(5)), ErrorCategory::Network);
        assert_eq!(
            ErrorCategory::from(&DeliveryError::client_error(400, "")),
            ErrorCategory::Client
        );
        assert_eq!(
            ErrorCategory::from(&DeliveryError::NoRoute { reader: "r".into() }).to_string(),
            "configuration"
        );
    }

    #[test]
    fn core_errors_become_store_errors() {
        let err = DispatchError::from(CoreError::Store("disk full".into()));
        assert!(matches!(err, DispatchError::Store { .. }));
        assert_eq!(
            DispatchError::PoolExhausted { pool_size: 20 }.to_string(),
            "handler pool exhausted (20 slots busy)"
        );
    }
}
