//! Retry coordinator: records delivery outcomes and decides what happens to
//! failed events.
//!
//! Success marks the event `delivered`. A transient failure counts against
//! the retry budget and either schedules another attempt with backoff or,
//! once the budget is spent, moves the event to the dead-letter queue. A
//! permanent failure goes to the dead-letter queue immediately.

use std::sync::Arc;

use leadrelay_core::{
    AttemptFailedEvent, AttemptRecord, Clock, CoreError, DeliveredEvent, EventHandler,
    EventStore, FailureClass, LeadEvent, PipelineEvent, RetryState, StatusUpdate,
};
use tracing::{debug, info, warn};

use crate::{
    batcher::BatcherSet,
    dead_letter::DeadLetterQueue,
    error::{DeliveryError, PipelineError},
    retry::{RetryContext, RetryDecision, RetryPolicy},
    stats::SharedStats,
};

/// What happened to an event after its attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Marked delivered.
    Delivered,
    /// Returned to `pending` with a retry scheduled.
    RetryScheduled(RetryState),
    /// Moved to the dead-letter queue.
    DeadLettered,
    /// The stored record had already moved on; nothing was written.
    Superseded,
}

/// Applies delivery outcomes to the store, the batchers and the DLQ.
#[derive(Debug, Clone)]
pub struct RetryCoordinator {
    events: Arc<dyn EventStore>,
    dlq: DeadLetterQueue,
    batchers: BatcherSet,
    policy: RetryPolicy,
    handler: Arc<dyn EventHandler>,
    stats: SharedStats,
    clock: Arc<dyn Clock>,
}

impl RetryCoordinator {
    /// Creates a coordinator.
    pub fn new(
        events: Arc<dyn EventStore>,
        dlq: DeadLetterQueue,
        batchers: BatcherSet,
        policy: RetryPolicy,
        handler: Arc<dyn EventHandler>,
        stats: SharedStats,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { events, dlq, batchers, policy, handler, stats, clock }
    }

    /// Retry policy in force.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Records a successful delivery of the in-flight `event`.
    ///
    /// # Errors
    ///
    /// Store failures. The event stays `in_flight` and is recovered by the
    /// scheduler's backfill.
    pub async fn on_success(&self, event: &LeadEvent) -> Result<AttemptOutcome, PipelineError> {
        let now = self.clock.now_utc();
        match self.events.update_status(&event.id, &StatusUpdate::delivered(), now).await {
            Ok(_) => {},
            Err(CoreError::InvalidTransition { from, .. }) => {
                debug!(event_id = %event.id, status = %from, "delivery already recorded");
                return Ok(AttemptOutcome::Superseded);
            },
            Err(e) => return Err(e.into()),
        }

        let latency_ms =
            u64::try_from((now - event.created_at).num_milliseconds().max(0)).unwrap_or(0);
        info!(
            event_id = %event.id,
            destination = %event.destination,
            attempt = event.attempt_count + 1,
            latency_ms,
            "event delivered"
        );
        {
            let mut stats = self.stats.write().await;
            stats.delivered += 1;
        }
        self.handler
            .handle_event(PipelineEvent::Delivered(DeliveredEvent {
                event_id: event.id.clone(),
                destination: event.destination.clone(),
                attempt_number: event.attempt_count + 1,
                latency_ms,
                delivered_at: now,
            }))
            .await;

        Ok(AttemptOutcome::Delivered)
    }

    /// Records a failed attempt of the in-flight `event`.
    ///
    /// # Errors
    ///
    /// Store failures. The event stays `in_flight` and is recovered by the
    /// scheduler's backfill.
    pub async fn on_failure(
        &self,
        event: &LeadEvent,
        error: &DeliveryError,
    ) -> Result<AttemptOutcome, PipelineError> {
        let now = self.clock.now_utc();
        let failure_class = error.failure_class();
        let attempt_count = match failure_class {
            FailureClass::Transient => event.attempt_count.saturating_add(1),
            FailureClass::Permanent => event.attempt_count,
        };
        let record = AttemptRecord {
            attempt: u32::try_from(event.history.len()).unwrap_or(u32::MAX).saturating_add(1),
            error: error.to_string(),
            failure_class,
            at: now,
        };

        let decision =
            RetryContext::new(attempt_count, error.clone(), now, self.policy.clone()).decide_retry();
        let will_retry = matches!(decision, RetryDecision::Retry { .. });

        let outcome = match decision {
            RetryDecision::Retry { next_attempt_at, backoff_interval } => {
                let retry = RetryState {
                    next_attempt_at,
                    backoff_interval,
                    last_error: error.to_string(),
                };
                let update = StatusUpdate::retry_scheduled(attempt_count, retry.clone(), record);
                let updated = match self.events.update_status(&event.id, &update, now).await {
                    Ok(updated) => updated,
                    Err(CoreError::InvalidTransition { from, .. }) => {
                        debug!(event_id = %event.id, status = %from, "failure already recorded");
                        return Ok(AttemptOutcome::Superseded);
                    },
                    Err(e) => return Err(e.into()),
                };

                warn!(
                    event_id = %event.id,
                    destination = %event.destination,
                    attempt = attempt_count,
                    next_attempt_at = %next_attempt_at,
                    error = %error,
                    "delivery failed, retry scheduled"
                );
                match self.batchers.get(&event.destination) {
                    Some(batcher) => batcher.requeue(updated).await,
                    None => warn!(destination = %event.destination, "no batcher for destination"),
                }
                {
                    let mut stats = self.stats.write().await;
                    stats.retried += 1;
                }
                AttemptOutcome::RetryScheduled(retry)
            },
            RetryDecision::GiveUp { error_class, reason } => {
                let mut dying = event.clone();
                dying.attempt_count = attempt_count;
                dying.history.push(record.clone());

                // A dead event always has a dead-letter entry.
                self.dlq.bury_event(&dying, error_class, &reason, &error.to_string()).await?;

                match self
                    .events
                    .update_status(&event.id, &StatusUpdate::dead(attempt_count, record), now)
                    .await
                {
                    Ok(_) => {},
                    Err(CoreError::InvalidTransition { from, .. }) => {
                        debug!(event_id = %event.id, status = %from, "event already moved on");
                        return Ok(AttemptOutcome::Superseded);
                    },
                    Err(e) => return Err(e.into()),
                }
                AttemptOutcome::DeadLettered
            },
        };

        self.handler
            .handle_event(PipelineEvent::Failed(AttemptFailedEvent {
                event_id: event.id.clone(),
                destination: event.destination.clone(),
                response_status: error.status_code(),
                attempt_number: event.attempt_count + 1,
                error_message: error.to_string(),
                failure_class,
                will_retry,
                failed_at: now,
            }))
            .await;

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use leadrelay_core::{
        decode_entry,
        storage::memory::{InMemoryDeadLetterStore, InMemoryEventStore},
        DeadLetterFilter, DeadLetterStore, DestinationName, ErrorClass, EventStatus,
        NoOpEventHandler, TestClock,
    };

    use super::*;
    use crate::{batcher::BatchConfig, stats};

    struct Fixture {
        events: Arc<InMemoryEventStore>,
        dead_letters: Arc<InMemoryDeadLetterStore>,
        batchers: BatcherSet,
        coordinator: RetryCoordinator,
    }

    fn fixture(max_attempts: u32) -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let events = Arc::new(InMemoryEventStore::new());
        let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
        let batchers =
            BatcherSet::new([DestinationName::from("capi")], &BatchConfig::default(), &clock);
        let handler: Arc<dyn EventHandler> = Arc::new(NoOpEventHandler::new());
        let stats = stats::shared();
        let dlq =
            DeadLetterQueue::new(dead_letters.clone(), handler.clone(), stats.clone(), clock.clone());
        let policy = RetryPolicy { max_attempts, jitter_factor: 0.0, ..RetryPolicy::default() };
        let coordinator = RetryCoordinator::new(
            events.clone(),
            dlq,
            batchers.clone(),
            policy,
            handler,
            stats,
            clock,
        );
        Fixture { events, dead_letters, batchers, coordinator }
    }

    async fn in_flight(f: &Fixture, attempt_count: u32) -> LeadEvent {
        let body = serde_json::to_vec(&serde_json::json!({
            "id": "e3",
            "payload": { "schema_version": 1, "event_name": "Lead", "telegram_id": "3" }
        }))
        .unwrap();
        let lead = decode_entry(&body, Utc::now()).unwrap();
        let mut event = LeadEvent::from_lead(&lead, &DestinationName::from("capi"), Utc::now());
        event.status = EventStatus::InFlight;
        event.attempt_count = attempt_count;
        f.events.insert_raw(event.clone()).await;
        event
    }

    #[tokio::test]
    async fn success_marks_delivered() {
        let f = fixture(3);
        let event = in_flight(&f, 0).await;

        let outcome = f.coordinator.on_success(&event).await.unwrap();

        assert_eq!(outcome, AttemptOutcome::Delivered);
        let stored = f.events.get(&event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Delivered);
    }

    #[tokio::test]
    async fn transient_failure_schedules_retry_and_hides_event() {
        let f = fixture(3);
        let event = in_flight(&f, 0).await;

        let outcome = f
            .coordinator
            .on_failure(&event, &DeliveryError::server_error(500, ""))
            .await
            .unwrap();

        let AttemptOutcome::RetryScheduled(retry) = outcome else {
            panic!("expected retry, got {outcome:?}");
        };
        assert_eq!(retry.backoff_interval, Duration::from_secs(2));
        let stored = f.events.get(&event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Pending);
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.history.len(), 1);

        let batcher = f.batchers.get(&DestinationName::from("capi")).unwrap();
        assert!(batcher.contains(&event.id).await);
        assert!(batcher.try_next_batch().await.is_none());
    }

    #[tokio::test]
    async fn exhausted_budget_dead_letters() {
        let f = fixture(3);
        let event = in_flight(&f, 2).await;

        let outcome = f
            .coordinator
            .on_failure(&event, &DeliveryError::server_error(500, ""))
            .await
            .unwrap();

        assert_eq!(outcome, AttemptOutcome::DeadLettered);
        let stored = f.events.get(&event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Dead);
        assert_eq!(stored.attempt_count, 3);
        assert!(stored.retry.is_none());

        let entries = f.dead_letters.list(&DeadLetterFilter::default(), Utc::now()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, "retries exhausted");
        assert_eq!(entries[0].error_class, ErrorClass::RetriesExhausted);
        assert_eq!(entries[0].attempt_count, 3);
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_without_counting() {
        let f = fixture(5);
        let event = in_flight(&f, 0).await;

        let outcome = f
            .coordinator
            .on_failure(&event, &DeliveryError::client_error(400, "invalid parameter"))
            .await
            .unwrap();

        assert_eq!(outcome, AttemptOutcome::DeadLettered);
        let entries = f.dead_letters.all().await;
        assert_eq!(entries[0].error_class, ErrorClass::Permanent);
        assert_eq!(entries[0].attempt_count, 0);
        assert_eq!(entries[0].attempt_history.len(), 1);
    }

    #[tokio::test]
    async fn already_delivered_is_superseded() {
        let f = fixture(3);
        let event = in_flight(&f, 0).await;
        f.coordinator.on_success(&event).await.unwrap();

        let outcome = f.coordinator.on_success(&event).await.unwrap();

        assert_eq!(outcome, AttemptOutcome::Superseded);
    }

    #[tokio::test]
    async fn store_outage_propagates() {
        let f = fixture(3);
        let event = in_flight(&f, 0).await;
        f.events.set_unavailable(true);

        let err = f.coordinator.on_success(&event).await.unwrap_err();

        assert!(matches!(err, PipelineError::StoreUnavailable(_)));
    }
}
