//! Error types for destination calls and pipeline operation.
//!
//! [`DeliveryError`] describes why a single destination call failed and
//! classifies it as transient or permanent. [`PipelineError`] covers
//! everything else the pipeline can run into: poison entries, token budget
//! waits, unreachable stores and worker lifecycle failures.

use std::fmt;

use leadrelay_core::{CoreError, DecodeError, FailureClass};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Why a destination call failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// Call exceeded the destination timeout.
    #[error("request timeout after {timeout_ms}ms")]
    Timeout {
        /// Timeout that elapsed, in milliseconds
        timeout_ms: u64,
    },

    /// Destination answered with a 4xx status.
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Destination answered with a 5xx status.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Destination answered 429.
    #[error("rate limited: retry after {retry_after_seconds}s")]
    RateLimited {
        /// Seconds to wait before retrying
        retry_after_seconds: u64,
    },

    /// Event cannot be turned into a request the destination accepts.
    #[error("invalid payload: {message}")]
    InvalidPayload {
        /// What is wrong with the payload
        message: String,
    },

    /// Destination configuration is unusable.
    #[error("invalid destination configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout: std::time::Duration) -> Self {
        Self::Timeout { timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX) }
    }

    /// Creates a client error from an HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from an HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a rate limit error with retry guidance.
    pub fn rate_limited(retry_after_seconds: u64) -> Self {
        Self::RateLimited { retry_after_seconds }
    }

    /// Creates an invalid payload error.
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Classifies the failure.
    ///
    /// Timeouts, network errors, 5xx, 408 and 429 are transient. Other 4xx
    /// responses, invalid payloads and configuration errors are permanent.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::RateLimited { .. }
            | Self::InternalError { .. } => FailureClass::Transient,

            Self::ClientError { status_code: 408, .. } => FailureClass::Transient,

            Self::ClientError { .. } | Self::InvalidPayload { .. } | Self::ConfigurationError { .. } => {
                FailureClass::Permanent
            },
        }
    }

    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        self.failure_class() == FailureClass::Transient
    }

    /// Destination-provided wait before the next attempt, if any.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds } => Some(*retry_after_seconds),
            _ => None,
        }
    }

    /// HTTP status returned by the destination, if it answered.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ClientError { status_code, .. } | Self::ServerError { status_code, .. } => {
                Some(*status_code)
            },
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}

/// Category of delivery error for metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues and timeouts.
    Network,
    /// HTTP client errors (4xx).
    Client,
    /// HTTP server errors (5xx).
    Server,
    /// Rate limiting.
    RateLimit,
    /// Payload or configuration problems.
    Payload,
    /// Internal system errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. } => Self::Client,
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::RateLimited { .. } => Self::RateLimit,
            DeliveryError::InvalidPayload { .. } | DeliveryError::ConfigurationError { .. } => {
                Self::Payload
            },
            DeliveryError::InternalError { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Payload => write!(f, "payload"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Errors raised by pipeline components outside a single destination call.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Queue entry could not be decoded. Poison; never retried.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Token budget did not allow the batch before its deadline.
    #[error("capacity exceeded for destination {destination}: needed {needed} tokens")]
    CapacityExceeded {
        /// Destination whose bucket was exhausted
        destination: String,
        /// Tokens the batch needed
        needed: u32,
    },

    /// Event or dead-letter store unreachable.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Store rejected the operation for a non-infrastructure reason.
    #[error("store error: {0}")]
    Store(String),

    /// Durable queue unreachable.
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    /// Pipeline configuration is unusable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Workers did not stop within the shutdown budget.
    #[error("shutdown timed out after {timeout_secs}s")]
    ShutdownTimeout {
        /// Budget that elapsed
        timeout_secs: u64,
    },

    /// A worker task panicked.
    #[error("worker panicked: {0}")]
    WorkerPanic(String),
}

impl PipelineError {
    /// Wraps a queue failure.
    pub fn queue(err: &CoreError) -> Self {
        Self::QueueUnavailable(err.to_string())
    }
}

impl From<CoreError> for PipelineError {
    fn from(err: CoreError) -> Self {
        if err.is_unavailable() {
            Self::StoreUnavailable(err.to_string())
        } else {
            Self::Store(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn transient_errors_identified_correctly() {
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(Duration::from_secs(20)).is_retryable());
        assert!(DeliveryError::server_error(500, "internal server error").is_retryable());
        assert!(DeliveryError::server_error(503, "").is_retryable());
        assert!(DeliveryError::rate_limited(60).is_retryable());
        assert!(DeliveryError::client_error(408, "request timeout").is_retryable());
    }

    #[test]
    fn permanent_errors_identified_correctly() {
        assert_eq!(
            DeliveryError::client_error(400, "bad request").failure_class(),
            FailureClass::Permanent
        );
        assert_eq!(
            DeliveryError::client_error(404, "").failure_class(),
            FailureClass::Permanent
        );
        assert!(!DeliveryError::invalid_payload("no subject id").is_retryable());
        assert!(!DeliveryError::configuration("missing pixel id").is_retryable());
    }

    #[test]
    fn retry_after_only_for_rate_limits() {
        assert_eq!(DeliveryError::rate_limited(120).retry_after_seconds(), Some(120));
        assert_eq!(DeliveryError::server_error(500, "").retry_after_seconds(), None);
        assert_eq!(DeliveryError::rate_limited(5).status_code(), Some(429));
    }

    #[test]
    fn error_display_is_human_readable() {
        assert_eq!(DeliveryError::server_error(500, "oops").to_string(), "server error: HTTP 500");
        assert_eq!(
            DeliveryError::timeout(Duration::from_millis(1500)).to_string(),
            "request timeout after 1500ms"
        );
    }

    #[test]
    fn error_categories_map_correctly() {
        assert_eq!(ErrorCategory::from(&DeliveryError::network("x")), ErrorCategory::Network);
        assert_eq!(ErrorCategory::from(&DeliveryError::client_error(422, "")), ErrorCategory::Client);
        assert_eq!(ErrorCategory::from(&DeliveryError::rate_limited(1)).to_string(), "rate_limit");
    }

    #[test]
    fn core_errors_split_by_availability() {
        let unavailable = PipelineError::from(CoreError::Unavailable("pool closed".into()));
        assert!(matches!(unavailable, PipelineError::StoreUnavailable(_)));

        let other = PipelineError::from(CoreError::NotFound("event".into()));
        assert!(matches!(other, PipelineError::Store(_)));
    }
}
