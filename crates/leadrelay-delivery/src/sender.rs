//! Rate-limited sender.
//!
//! Takes closed batches from a destination's batcher, claims the events
//! (`pending` to `in_flight`), waits for tokens, calls the destination and
//! hands every per-event outcome to the retry coordinator.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use leadrelay_core::{Clock, CoreError, Destination, EventStore, LeadEvent, StatusUpdate};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    batcher::{Batch, PriorityBatcher},
    client::{DeliveryResponse, DestinationClient},
    conversions::bulk_outcomes,
    coordinator::{AttemptOutcome, RetryCoordinator},
    error::{DeliveryError, PipelineError},
    rate_limit::TokenBucket,
    stats::SharedStats,
};

/// Counts for one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    /// Events accepted by the destination.
    pub delivered: usize,
    /// Events whose attempt failed.
    pub failed: usize,
    /// Events skipped because their stored status forbade sending.
    pub skipped: usize,
    /// Events returned to `pending` because the token budget ran out.
    pub returned: usize,
}

/// Sends batches for one destination.
#[derive(Debug, Clone)]
pub struct Sender {
    destination: Arc<Destination>,
    batcher: Arc<PriorityBatcher>,
    bucket: Arc<TokenBucket>,
    client: Arc<dyn DestinationClient>,
    coordinator: Arc<RetryCoordinator>,
    events: Arc<dyn EventStore>,
    stats: SharedStats,
    clock: Arc<dyn Clock>,
}

impl Sender {
    /// Creates a sender.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        destination: Arc<Destination>,
        batcher: Arc<PriorityBatcher>,
        bucket: Arc<TokenBucket>,
        client: Arc<dyn DestinationClient>,
        coordinator: Arc<RetryCoordinator>,
        events: Arc<dyn EventStore>,
        stats: SharedStats,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { destination, batcher, bucket, client, coordinator, events, stats, clock }
    }

    /// Destination this sender serves.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Sends batches until `cancel` fires. A batch already taken is always
    /// finished.
    pub async fn run(
        &self,
        worker_id: usize,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        info!(worker_id, destination = %self.destination.name, "sender starting");

        while let Some(batch) = self.batcher.next_batch(&cancel).await {
            let report = self.send_batch(batch).await;
            debug!(
                worker_id,
                destination = %self.destination.name,
                delivered = report.delivered,
                failed = report.failed,
                skipped = report.skipped,
                returned = report.returned,
                "batch processed"
            );
        }

        info!(worker_id, destination = %self.destination.name, "sender stopped");
        Ok(())
    }

    /// Processes one batch end to end.
    pub async fn send_batch(&self, batch: Batch) -> SendReport {
        let mut report = SendReport::default();
        let claimed = self.claim(batch.events, &mut report).await;
        if claimed.is_empty() {
            return report;
        }

        let max_wait = batch.deadline.saturating_duration_since(self.clock.now());
        let needed = u32::try_from(claimed.len()).unwrap_or(u32::MAX);
        if let Err(err) = self.bucket.acquire(needed, max_wait).await {
            warn!(destination = %self.destination.name, error = %err, "returning batch");
            report.returned = self.release(claimed).await;
            let mut stats = self.stats.write().await;
            stats.capacity_exceeded += 1;
            return report;
        }

        let results = self.call(&claimed).await;
        for (event, result) in claimed.iter().zip(results) {
            let outcome = match &result {
                Ok(()) => {
                    report.delivered += 1;
                    self.coordinator.on_success(event).await
                },
                Err(err) => {
                    report.failed += 1;
                    self.coordinator.on_failure(event, err).await
                },
            };
            match outcome {
                Ok(AttemptOutcome::Superseded) => {
                    debug!(event_id = %event.id, "outcome superseded by a newer write");
                },
                Ok(_) => {},
                Err(err) => error!(
                    event_id = %event.id,
                    error = %err,
                    "failed to record delivery outcome; event left in flight"
                ),
            }
        }
        report
    }

    /// Moves every event to `in_flight`, dropping those that may not be sent.
    async fn claim(&self, events: Vec<LeadEvent>, report: &mut SendReport) -> Vec<LeadEvent> {
        let now = self.clock.now_utc();
        let mut claimed = Vec::with_capacity(events.len());

        for event in events {
            match self.events.update_status(&event.id, &StatusUpdate::in_flight(), now).await {
                Ok(stored) => claimed.push(stored),
                Err(CoreError::InvalidTransition { from, .. }) => {
                    debug!(event_id = %event.id, status = %from, "skipping event");
                    report.skipped += 1;
                },
                Err(CoreError::NotFound(_)) => {
                    warn!(event_id = %event.id, "event missing from store, skipping");
                    report.skipped += 1;
                },
                Err(err) => {
                    // Backfill restores pending events once the store is back.
                    warn!(event_id = %event.id, error = %err, "cannot claim event");
                    report.skipped += 1;
                },
            }
        }
        claimed
    }

    /// Returns claimed events to `pending` without consuming an attempt.
    async fn release(&self, claimed: Vec<LeadEvent>) -> usize {
        let now = self.clock.now_utc();
        let mut returned = 0;
        for event in claimed {
            match self.events.update_status(&event.id, &StatusUpdate::released(), now).await {
                Ok(stored) => {
                    self.batcher.requeue(stored).await;
                    returned += 1;
                },
                Err(err) => {
                    warn!(event_id = %event.id, error = %err, "cannot release event");
                },
            }
        }
        returned
    }

    async fn call(&self, events: &[LeadEvent]) -> Vec<Result<(), DeliveryError>> {
        let destination = &*self.destination;
        let now = self.clock.now_utc();

        if destination.bulk && destination.kind.supports_bulk() {
            return match self.call_once(events, now).await {
                Ok(response) => bulk_outcomes(destination, events, &response),
                Err(err) => vec![Err(err); events.len()],
            };
        }

        join_all(events.iter().map(|event| async move {
            self.call_once(std::slice::from_ref(event), now).await.map(|_| ())
        }))
        .await
    }

    async fn call_once(
        &self,
        events: &[LeadEvent],
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<DeliveryResponse, DeliveryError> {
        let timeout = self.destination.timeout + CALL_GRACE;
        let call = self.client.deliver(&self.destination, events, now);
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(err),
            Err(_elapsed) => Err(DeliveryError::timeout(self.destination.timeout)),
        }
    }
}

/// Slack on top of the destination timeout before the call is abandoned.
const CALL_GRACE: Duration = Duration::from_millis(250);

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use leadrelay_core::{
        decode_entry,
        storage::memory::{InMemoryDeadLetterStore, InMemoryEventStore},
        DestinationKind, DestinationName, EventHandler, EventId, EventStatus, NoOpEventHandler,
        RateLimit, TestClock,
    };

    use super::*;
    use crate::{
        batcher::{BatchConfig, BatcherSet},
        client::DeliveryResponse,
        dead_letter::DeadLetterQueue,
        retry::RetryPolicy,
        stats,
    };

    #[derive(Debug, Default)]
    struct RecordingClient {
        calls: StdMutex<Vec<Vec<EventId>>>,
        fail_with: Option<DeliveryError>,
        body: String,
    }

    #[async_trait]
    impl DestinationClient for RecordingClient {
        async fn deliver(
            &self,
            _destination: &Destination,
            events: &[LeadEvent],
            _now: DateTime<Utc>,
        ) -> crate::error::Result<DeliveryResponse> {
            self.calls.lock().unwrap().push(events.iter().map(|e| e.id.clone()).collect());
            match &self.fail_with {
                Some(err) => Err(err.clone()),
                None => Ok(DeliveryResponse {
                    status_code: 200,
                    headers: Default::default(),
                    body: self.body.clone(),
                    duration: Duration::ZERO,
                }),
            }
        }
    }

    struct Fixture {
        events: Arc<InMemoryEventStore>,
        batcher: Arc<PriorityBatcher>,
        client: Arc<RecordingClient>,
        sender: Sender,
    }

    fn fixture(bulk: bool, tokens: u32, fail_with: Option<DeliveryError>) -> Fixture {
        let kind = DestinationKind::Webhook { headers: Default::default() };
        fixture_for(kind, bulk, tokens, fail_with, String::new())
    }

    fn fixture_for(
        kind: DestinationKind,
        bulk: bool,
        tokens: u32,
        fail_with: Option<DeliveryError>,
        body: String,
    ) -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let name = DestinationName::from("hook");
        let destination = Arc::new(Destination {
            name: name.clone(),
            kind,
            endpoint: "http://hook.invalid".into(),
            rate_limit: RateLimit { tokens, interval: Duration::from_secs(60) },
            timeout: Duration::from_secs(5),
            bulk,
            events: Vec::new(),
            enabled: true,
        });
        let config = BatchConfig { batch_timeout: Duration::from_secs(1), ..BatchConfig::default() };
        let batchers = BatcherSet::new([name.clone()], &config, &clock);
        let batcher = batchers.get(&name).unwrap().clone();
        let events = Arc::new(InMemoryEventStore::new());
        let handler: Arc<dyn EventHandler> = Arc::new(NoOpEventHandler::new());
        let stats = stats::shared();
        let dlq = DeadLetterQueue::new(
            Arc::new(InMemoryDeadLetterStore::new()),
            handler.clone(),
            stats.clone(),
            clock.clone(),
        );
        let coordinator = Arc::new(RetryCoordinator::new(
            events.clone(),
            dlq,
            batchers,
            RetryPolicy { jitter_factor: 0.0, ..RetryPolicy::default() },
            handler,
            stats.clone(),
            clock.clone(),
        ));
        let bucket = Arc::new(TokenBucket::new(name, destination.rate_limit, clock.clone()));
        let client = Arc::new(RecordingClient { fail_with, body, ..Default::default() });
        let sender = Sender::new(
            destination,
            batcher.clone(),
            bucket,
            client.clone(),
            coordinator,
            events.clone(),
            stats,
            clock,
        );
        Fixture { events, batcher, client, sender }
    }

    async fn seed(f: &Fixture, lead_id: &str) -> EventId {
        let body = serde_json::to_vec(&serde_json::json!({
            "id": lead_id,
            "payload": { "schema_version": 1, "event_name": "Lead", "telegram_id": "1" }
        }))
        .unwrap();
        let lead = decode_entry(&body, Utc::now()).unwrap();
        let event = LeadEvent::from_lead(&lead, &DestinationName::from("hook"), Utc::now());
        let (_, stored) = f.events.upsert(&event).await.unwrap();
        f.batcher.push(stored).await.unwrap();
        event.id
    }

    async fn batch(f: &Fixture) -> Batch {
        f.batcher.next_batch(&CancellationToken::new()).await.unwrap()
    }

    #[tokio::test]
    async fn delivers_each_event_separately() {
        let f = fixture(false, 10, None);
        let a = seed(&f, "a").await;
        let b = seed(&f, "b").await;

        let report = f.sender.send_batch(batch(&f).await).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(f.client.calls.lock().unwrap().len(), 2);
        for id in [a, b] {
            assert_eq!(f.events.get(&id).await.unwrap().unwrap().status, EventStatus::Delivered);
        }
    }

    #[tokio::test]
    async fn bulk_destination_gets_one_call() {
        let f = fixture(true, 10, None);
        seed(&f, "a").await;
        seed(&f, "b").await;

        let report = f.sender.send_batch(batch(&f).await).await;

        assert_eq!(report.delivered, 2);
        let calls = f.client.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 2);
    }

    #[tokio::test]
    async fn delivered_events_are_never_sent_again() {
        let f = fixture(false, 10, None);
        seed(&f, "a").await;
        let first = batch(&f).await;
        let replay = first.clone();

        f.sender.send_batch(first).await;
        let report = f.sender.send_batch(replay).await;

        assert_eq!(report.skipped, 1);
        assert_eq!(f.client.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn insufficient_tokens_return_batch_without_attempt() {
        let f = fixture(false, 1, None);
        let a = seed(&f, "a").await;
        let b = seed(&f, "b").await;

        let report = f.sender.send_batch(batch(&f).await).await;

        assert_eq!(report.returned, 2);
        assert!(f.client.calls.lock().unwrap().is_empty());
        for id in [a, b] {
            let stored = f.events.get(&id).await.unwrap().unwrap();
            assert_eq!(stored.status, EventStatus::Pending);
            assert_eq!(stored.attempt_count, 0);
            assert!(f.batcher.contains(&id).await);
        }
    }

    #[tokio::test]
    async fn failures_go_to_the_coordinator() {
        let f = fixture(false, 10, Some(DeliveryError::server_error(502, "bad gateway")));
        let a = seed(&f, "a").await;

        let report = f.sender.send_batch(batch(&f).await).await;

        assert_eq!(report.failed, 1);
        let stored = f.events.get(&a).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Pending);
        assert_eq!(stored.attempt_count, 1);
        assert!(stored.retry.is_some());
    }

    #[tokio::test]
    async fn short_bulk_acknowledgement_schedules_retries() {
        let kind = DestinationKind::FacebookCapi {
            pixel_id: "1".into(),
            access_token: "t".into(),
            api_version: "v20.0".into(),
            test_event_code: None,
            action_source: "website".into(),
            event_id_salt: "salt".into(),
        };
        let f = fixture_for(kind, true, 10, None, r#"{"events_received":1}"#.to_string());
        let a = seed(&f, "a").await;
        let b = seed(&f, "b").await;

        let report = f.sender.send_batch(batch(&f).await).await;

        assert_eq!(report.delivered, 0);
        assert_eq!(report.failed, 2);
        for id in [a, b] {
            let stored = f.events.get(&id).await.unwrap().unwrap();
            assert_eq!(stored.status, EventStatus::Pending);
            assert_eq!(stored.attempt_count, 1);
        }
    }
}
