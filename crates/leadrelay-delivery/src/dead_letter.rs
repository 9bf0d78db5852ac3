//! Dead-letter queue writer and reprocessor.
//!
//! Entries arrive from two places: the consumer buries queue entries that
//! fail to decode, and the retry coordinator buries events that failed
//! permanently or ran out of attempts. Only the latter can be replayed.

use std::sync::Arc;

use leadrelay_core::{
    Clock, CoreError, DeadLetter, DeadLetterFilter, DeadLetterStore, DeadLetteredEvent,
    DecodeError, ErrorClass, EventHandler, EventId, EventStore, LeadEvent, PipelineEvent,
    QueueEntry, ReprocessedEvent, StatusUpdate,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{batcher::BatcherSet, error::PipelineError, stats::SharedStats};

/// Longest raw entry kept on a poison dead letter.
const MAX_RAW_ENTRY_BYTES: usize = 16 * 1024;

/// Writes entries to the dead-letter store and announces them.
#[derive(Debug, Clone)]
pub struct DeadLetterQueue {
    store: Arc<dyn DeadLetterStore>,
    handler: Arc<dyn EventHandler>,
    stats: SharedStats,
    clock: Arc<dyn Clock>,
}

impl DeadLetterQueue {
    /// Creates the writer.
    pub fn new(
        store: Arc<dyn DeadLetterStore>,
        handler: Arc<dyn EventHandler>,
        stats: SharedStats,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, handler, stats, clock }
    }

    /// Buries an event that failed terminally.
    ///
    /// # Errors
    ///
    /// Store failures. The caller must not consider the event moved.
    pub async fn bury_event(
        &self,
        event: &LeadEvent,
        error_class: ErrorClass,
        reason: &str,
        last_error: &str,
    ) -> Result<Uuid, PipelineError> {
        let entry = DeadLetter {
            id: Uuid::new_v4(),
            event_id: Some(event.id.clone()),
            destination: Some(event.destination.clone()),
            lead_id: Some(event.lead_id.clone()),
            error_class,
            reason: reason.to_string(),
            last_error: last_error.to_string(),
            attempt_count: event.attempt_count,
            attempt_history: event.history.clone(),
            raw_entry: None,
            dead_at: self.clock.now_utc(),
            reprocess_count: 0,
            last_reprocessed_at: None,
        };
        self.insert(entry).await
    }

    /// Buries a queue entry that could not be decoded.
    ///
    /// # Errors
    ///
    /// Store failures. The caller must not acknowledge the entry.
    pub async fn bury_poison(
        &self,
        entry: &QueueEntry,
        error: &DecodeError,
    ) -> Result<Uuid, PipelineError> {
        let raw = &entry.body[..entry.body.len().min(MAX_RAW_ENTRY_BYTES)];
        let dead_letter = DeadLetter {
            id: Uuid::new_v4(),
            event_id: None,
            destination: None,
            lead_id: None,
            error_class: ErrorClass::Decode,
            reason: format!("undecodable entry {} on partition {}", entry.id, entry.partition),
            last_error: error.to_string(),
            attempt_count: 0,
            attempt_history: Vec::new(),
            raw_entry: Some(String::from_utf8_lossy(raw).into_owned()),
            dead_at: self.clock.now_utc(),
            reprocess_count: 0,
            last_reprocessed_at: None,
        };
        {
            let mut stats = self.stats.write().await;
            stats.decode_failures += 1;
        }
        self.insert(dead_letter).await
    }

    async fn insert(&self, entry: DeadLetter) -> Result<Uuid, PipelineError> {
        let id = self.store.insert(&entry).await?;

        warn!(
            dead_letter_id = %id,
            event_id = entry.event_id.as_ref().map(EventId::as_str),
            destination = entry.destination.as_ref().map(|d| d.as_str()),
            error_class = %entry.error_class,
            reason = %entry.reason,
            "entry moved to dead-letter queue"
        );
        {
            let mut stats = self.stats.write().await;
            stats.dead_lettered += 1;
        }
        self.handler
            .handle_event(PipelineEvent::DeadLettered(DeadLetteredEvent {
                dead_letter_id: id,
                event_id: entry.event_id,
                destination: entry.destination,
                error_class: entry.error_class,
                reason: entry.reason,
            }))
            .await;
        Ok(id)
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn DeadLetterStore> {
        &self.store
    }
}

/// Why an entry was not replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    /// Dead-letter entry.
    pub dead_letter_id: Uuid,
    /// Reason it was left in place.
    pub reason: String,
}

/// Outcome of one reprocessing run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReprocessReport {
    /// Entries selected by the filter.
    pub matched: usize,
    /// Events returned to `pending`.
    pub reprocessed: Vec<EventId>,
    /// Entries left in the dead-letter queue.
    pub skipped: Vec<SkippedEntry>,
}

/// Replays dead-letter entries into the pipeline.
#[derive(Debug, Clone)]
pub struct Reprocessor {
    events: Arc<dyn EventStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    batchers: BatcherSet,
    handler: Arc<dyn EventHandler>,
    stats: SharedStats,
    clock: Arc<dyn Clock>,
}

impl Reprocessor {
    /// Creates a reprocessor feeding `batchers`.
    pub fn new(
        events: Arc<dyn EventStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        batchers: BatcherSet,
        handler: Arc<dyn EventHandler>,
        stats: SharedStats,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { events, dead_letters, batchers, handler, stats, clock }
    }

    /// Replays every entry selected by `filter`.
    ///
    /// # Errors
    ///
    /// Store failures. Entries handled before the failure stay replayed.
    pub async fn reprocess(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<ReprocessReport, PipelineError> {
        self.reprocess_matching(filter, |_| true).await
    }

    /// Replays entries selected by `filter` that also satisfy `predicate`.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn reprocess_matching<F>(
        &self,
        filter: &DeadLetterFilter,
        predicate: F,
    ) -> Result<ReprocessReport, PipelineError>
    where
        F: Fn(&DeadLetter) -> bool + Send + Sync,
    {
        let now = self.clock.now_utc();
        let entries: Vec<DeadLetter> = self
            .dead_letters
            .list(filter, now)
            .await?
            .into_iter()
            .filter(|entry| predicate(entry))
            .collect();

        let mut report = ReprocessReport { matched: entries.len(), ..Default::default() };
        for entry in entries {
            match self.replay(&entry).await? {
                Ok(event_id) => report.reprocessed.push(event_id),
                Err(reason) => {
                    debug!(dead_letter_id = %entry.id, %reason, "dead letter not replayed");
                    report.skipped.push(SkippedEntry { dead_letter_id: entry.id, reason });
                },
            }
        }

        if !report.reprocessed.is_empty() {
            info!(
                matched = report.matched,
                reprocessed = report.reprocessed.len(),
                skipped = report.skipped.len(),
                "dead letters reprocessed"
            );
        }
        Ok(report)
    }

    /// Replays one entry. The inner error is a skip reason.
    async fn replay(&self, entry: &DeadLetter) -> Result<Result<EventId, String>, PipelineError> {
        if entry.error_class == ErrorClass::Decode {
            return Ok(Err("undecodable entries cannot be replayed".to_string()));
        }
        let (Some(event_id), Some(destination)) = (&entry.event_id, &entry.destination) else {
            return Ok(Err("entry has no event".to_string()));
        };
        let Some(batcher) = self.batchers.get(destination) else {
            return Ok(Err(format!("destination {destination} is not configured")));
        };

        let now = self.clock.now_utc();
        let event = match self.events.update_status(event_id, &StatusUpdate::reprocess(), now).await {
            Ok(event) => event,
            Err(CoreError::NotFound(_)) => return Ok(Err("event record missing".to_string())),
            Err(CoreError::InvalidTransition { from, .. }) => {
                return Ok(Err(format!("event is {from}")));
            },
            Err(e) => return Err(e.into()),
        };

        let marked = self.dead_letters.mark_reprocessed(entry.id, now).await?;
        batcher.requeue(event).await;

        {
            let mut stats = self.stats.write().await;
            stats.reprocessed += 1;
        }
        self.handler
            .handle_event(PipelineEvent::Reprocessed(ReprocessedEvent {
                dead_letter_id: entry.id,
                event_id: event_id.clone(),
                destination: destination.clone(),
                reprocess_count: marked.reprocess_count,
            }))
            .await;

        Ok(Ok(event_id.clone()))
    }
}

/// Filter used by scheduled reprocessing.
pub fn auto_reprocess_filter(
    min_age: std::time::Duration,
    max_reprocess_count: u32,
    limit: usize,
) -> DeadLetterFilter {
    DeadLetterFilter {
        min_age: Some(min_age),
        error_class: Some(ErrorClass::RetriesExhausted),
        max_reprocess_count: Some(max_reprocess_count),
        limit,
        ..Default::default()
    }
}

/// Whether a recorded error reads like a transient delivery failure.
///
/// Matches the messages produced by transient [`crate::DeliveryError`]
/// variants.
pub fn looks_transient(last_error: &str) -> bool {
    const TRANSIENT_PREFIXES: &[&str] = &[
        "network connection failed",
        "request timeout",
        "server error",
        "rate limited",
        "internal delivery error",
        "client error: HTTP 408",
    ];
    TRANSIENT_PREFIXES.iter().any(|prefix| last_error.starts_with(prefix))
}
