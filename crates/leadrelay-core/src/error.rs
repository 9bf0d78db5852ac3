//! Error types and result handling for storage, queue and decoding.
//!
//! `CoreError` covers infrastructure failures and lifecycle violations raised
//! by the event store, the dead-letter store and the durable queue.
//! `DecodeError` covers queue entries that cannot be turned into a valid lead;
//! those are poison messages and are never retried.

use thiserror::Error;

use crate::models::{EventId, EventStatus};

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for storage and queue operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Backing store is unreachable or refused the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Status change rejected by the event lifecycle.
    #[error("Invalid transition for event {id}: {from} -> {to}")]
    InvalidTransition {
        /// Event whose update was rejected
        id: EventId,
        /// Status currently persisted
        from: EventStatus,
        /// Status that was requested
        to: EventStatus,
    },

    /// Partition is already leased by another consumer.
    #[error("Partition {partition} is held by consumer {holder}")]
    PartitionHeld {
        /// Queue partition
        partition: u32,
        /// Consumer currently holding the lease
        holder: String,
    },

    /// Partition lease was lost, for example with the session backing it.
    #[error("Lease on partition {partition} is no longer held")]
    LeaseLost {
        /// Queue partition
        partition: u32,
    },

    /// Stored data could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Encrypted data could not be sealed or opened.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Whether the error means the backing store could not be reached.
    ///
    /// Callers use this to decide between "retry later without acking" and
    /// "the request itself is wrong".
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Unavailable(err.to_string())
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Reasons a queue entry is rejected as a poison message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Entry body is not valid UTF-8 JSON.
    #[error("malformed entry: {0}")]
    Malformed(String),

    /// Payload carries no `schema_version` tag.
    #[error("payload has no schema_version")]
    MissingSchemaVersion,

    /// Payload declares a schema version this build does not understand.
    #[error("unsupported schema_version {0}")]
    UnsupportedSchemaVersion(u64),

    /// Payload structure does not match the declared schema.
    #[error("payload does not match schema v{version}: {message}")]
    Shape {
        /// Declared schema version
        version: u64,
        /// Deserializer message
        message: String,
    },

    /// A field parsed but failed validation.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        /// Offending field
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },
}

impl DecodeError {
    /// Creates a field validation error.
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField { field, reason: reason.into() }
    }
}
