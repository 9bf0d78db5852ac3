//! Pipeline events and subscriber dispatch.
//!
//! The retry coordinator, dead-letter queue and reprocessor publish a
//! [`PipelineEvent`] for every outcome. Subscribers such as the metrics
//! recorder observe outcomes without the delivery path knowing about them.
//!
//! ```text
//! ┌──────────────────┐  Delivered / Failed  ┌────────────────────┐
//! │ RetryCoordinator │ ───────────────────▶ │ MulticastHandler   │
//! │ DeadLetterQueue  │  DeadLettered / ...  │                    │
//! └──────────────────┘                      └─────────┬──────────┘
//!                                                     │
//!                                                     ▼
//!                                           metrics, audit logs, ...
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{DestinationName, ErrorClass, EventId, FailureClass};

/// Outcome notifications emitted by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    /// A destination accepted the event.
    Delivered(DeliveredEvent),

    /// A delivery attempt failed; the event may still be retried.
    Failed(AttemptFailedEvent),

    /// An entry was moved to the dead-letter queue.
    DeadLettered(DeadLetteredEvent),

    /// A dead-letter entry was replayed.
    Reprocessed(ReprocessedEvent),
}

/// Emitted when a destination accepts an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveredEvent {
    /// Delivered event.
    pub event_id: EventId,

    /// Destination that accepted it.
    pub destination: DestinationName,

    /// Attempt number of the successful call, 1-based.
    pub attempt_number: u32,

    /// Time from lead creation to acceptance.
    pub latency_ms: u64,

    /// When the destination accepted the event.
    pub delivered_at: DateTime<Utc>,
}

/// Emitted when a delivery attempt fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptFailedEvent {
    /// Failed event.
    pub event_id: EventId,

    /// Destination that was called.
    pub destination: DestinationName,

    /// HTTP status, if the destination answered.
    pub response_status: Option<u16>,

    /// Attempt number, 1-based.
    pub attempt_number: u32,

    /// Error description.
    pub error_message: String,

    /// Transient or permanent.
    pub failure_class: FailureClass,

    /// Whether another attempt is scheduled.
    pub will_retry: bool,

    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,
}

/// Emitted when an entry lands in the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetteredEvent {
    /// Dead-letter entry.
    pub dead_letter_id: Uuid,

    /// Dead event, absent for undecodable entries.
    pub event_id: Option<EventId>,

    /// Destination of the dead event.
    pub destination: Option<DestinationName>,

    /// Failure category.
    pub error_class: ErrorClass,

    /// Reason recorded on the entry.
    pub reason: String,
}

/// Emitted when a dead-letter entry is replayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReprocessedEvent {
    /// Replayed dead-letter entry.
    pub dead_letter_id: Uuid,

    /// Event returned to `pending`.
    pub event_id: EventId,

    /// Destination of the event.
    pub destination: DestinationName,

    /// Replay count after this replay.
    pub reprocess_count: u32,
}

/// Subscriber to pipeline outcomes.
///
/// Handlers must not block delivery. Failures inside a handler are logged by
/// the handler itself and never propagated back.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles one pipeline event.
    async fn handle_event(&self, event: PipelineEvent);
}

/// Handler that discards every event.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: PipelineEvent) {}
}

/// Forwards every event to all registered subscribers concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Registers a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: PipelineEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(futures).await;
    }
}
