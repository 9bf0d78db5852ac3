//! Core domain types for the lead delivery pipeline.
//!
//! Provides the lead payload schema and decoder, event lifecycle models,
//! error types, the clock abstraction, the pipeline event bus, and the
//! storage and queue traits with their PostgreSQL and in-memory
//! implementations. Every other crate builds on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod crypto;
pub mod error;
pub mod events;
pub mod models;
pub mod payload;
pub mod queue;
pub mod storage;
pub mod time;

pub use crypto::PayloadCipher;
pub use error::{CoreError, DecodeError, Result};
pub use events::{
    AttemptFailedEvent, DeadLetteredEvent, DeliveredEvent, EventHandler, MulticastEventHandler,
    NoOpEventHandler, PipelineEvent, ReprocessedEvent,
};
pub use models::{
    AttemptRecord, DeadLetter, DeadLetterFilter, Destination, DestinationKind, DestinationName,
    ErrorClass, EventId, EventStatus, FailureClass, LeadEvent, RateLimit, RetryState,
    StatusCounts, StatusUpdate, UpsertOutcome,
};
pub use payload::{decode_entry, priority_score, ConversionEvent, DecodedLead, LeadPayload};
pub use queue::{DurableQueue, PartitionLease, QueueDepth, QueueEntry};
pub use storage::{DeadLetterStore, EventStore, Storage};
pub use time::{Clock, RealClock, TestClock};
