//! Lead event delivery pipeline.
//!
//! This crate moves decoded leads from the durable queue to external
//! conversion APIs with priority ordering, bounded throughput and recovery
//! from downstream failures.
//!
//! # Architecture
//!
//! Each queue partition is read by one [`StreamConsumer`] holding that
//! partition's lease. Consumers fan every lead out into one event per
//! destination, upsert it and push it to the destination's
//! [`PriorityBatcher`]. Senders pull batches, take tokens from the
//! destination's [`TokenBucket`] and call the destination:
//!
//! 1. **Claim** - move each event to `in_flight`; skip events already past it
//! 2. **Throttle** - wait for `len(batch)` tokens until the batch deadline
//! 3. **Call** - one request per event, or one bulk request
//! 4. **Record** - mark delivered, or hand the failure to the
//!    [`RetryCoordinator`], which schedules a backoff or dead-letters it
//!
//! The [`Scheduler`] replays dead letters, samples gauges, backfills records
//! missing from the batchers and reclaims idle queue entries.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use leadrelay_core::{Clock, Destination, RealClock, Storage};
//! use leadrelay_delivery::{Pipeline, PipelineConfig, PipelineError};
//!
//! # async fn example(destinations: Vec<Destination>) -> Result<(), PipelineError> {
//! let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
//! let storage = Storage::in_memory(clock.clone());
//! let pipeline =
//!     Pipeline::with_http_client(PipelineConfig::default(), destinations, storage, clock)?;
//!
//! let handle = pipeline.start().await;
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod batcher;
pub mod client;
pub mod consumer;
pub mod conversions;
pub mod coordinator;
pub mod dead_letter;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod sender;
pub mod stats;
pub mod worker_pool;

pub use batcher::{Batch, BatchConfig, BatcherSet, PriorityBatcher};
pub use client::{ClientConfig, DeliveryResponse, DestinationClient, HttpDestinationClient};
pub use consumer::{ConsumerConfig, EntryOutcome, StreamConsumer};
pub use coordinator::{AttemptOutcome, RetryCoordinator};
pub use dead_letter::{DeadLetterQueue, ReprocessReport, Reprocessor, SkippedEntry};
pub use engine::{
    DestinationSnapshot, Pipeline, PipelineAdmin, PipelineConfig, PipelineHandle,
    PipelineSnapshot,
};
pub use error::{DeliveryError, PipelineError, Result};
pub use rate_limit::{BucketMap, TokenBucket};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{Scheduler, SchedulerConfig, TickReport};
pub use sender::{SendReport, Sender};
pub use stats::{PipelineStats, SharedStats};

/// Default number of queue partitions.
pub const DEFAULT_PARTITIONS: u32 = 1;

/// Default number of senders per destination.
pub const DEFAULT_SENDERS_PER_DESTINATION: usize = 2;

/// Default budget for stopping every worker, in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECONDS: u64 = 30;
