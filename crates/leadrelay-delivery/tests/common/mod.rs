//! Shared harness for delivery integration tests.
//!
//! Components are driven step by step against in-memory stores and a
//! [`TestClock`], so scenarios are deterministic and need no database.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadrelay_core::{
    queue::memory::InMemoryQueue,
    storage::memory::{InMemoryDeadLetterStore, InMemoryEventStore},
    Clock, ConversionEvent, DeadLetter, Destination, DestinationKind, DestinationName,
    DurableQueue, EventHandler, EventId, EventStore, LeadEvent, NoOpEventHandler, RateLimit,
    TestClock,
};
use leadrelay_delivery::{
    client::DeliveryResponse, stats, BatchConfig, BatcherSet, ConsumerConfig, DeadLetterQueue,
    DeliveryError, DestinationClient, EntryOutcome, Reprocessor, RetryCoordinator, RetryPolicy,
    SendReport, Sender, SharedStats, StreamConsumer, TokenBucket,
};

/// One recorded destination call.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub destination: DestinationName,
    pub event_ids: Vec<EventId>,
}

/// Destination client answering from a per-lead script.
///
/// Leads without a script are accepted.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    script: Mutex<HashMap<String, VecDeque<DeliveryError>>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedClient {
    /// Makes the next calls carrying `lead_id` fail with `errors`, in order.
    pub fn fail_next(&self, lead_id: &str, errors: impl IntoIterator<Item = DeliveryError>) {
        self.script.lock().unwrap().entry(lead_id.to_string()).or_default().extend(errors);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Event ids in call order.
    pub fn called_ids(&self) -> Vec<EventId> {
        self.calls().into_iter().flat_map(|c| c.event_ids).collect()
    }
}

#[async_trait]
impl DestinationClient for ScriptedClient {
    async fn deliver(
        &self,
        destination: &Destination,
        events: &[LeadEvent],
        _now: DateTime<Utc>,
    ) -> leadrelay_delivery::Result<DeliveryResponse> {
        self.calls.lock().unwrap().push(Call {
            destination: destination.name.clone(),
            event_ids: events.iter().map(|e| e.id.clone()).collect(),
        });

        let scripted = {
            let mut script = self.script.lock().unwrap();
            events
                .iter()
                .find_map(|e| script.get_mut(&e.lead_id).and_then(VecDeque::pop_front))
        };
        match scripted {
            Some(err) => Err(err),
            None => Ok(DeliveryResponse {
                status_code: 200,
                headers: HashMap::new(),
                body: String::new(),
                duration: Duration::from_millis(1),
            }),
        }
    }
}

pub fn webhook(name: &str) -> Destination {
    Destination {
        name: DestinationName::from(name),
        kind: DestinationKind::Webhook { headers: Default::default() },
        endpoint: "http://hook.invalid".into(),
        rate_limit: RateLimit { tokens: 100, interval: Duration::from_secs(1) },
        timeout: Duration::from_secs(5),
        bulk: false,
        events: Vec::new(),
        enabled: true,
    }
}

pub fn subscribe_only(mut destination: Destination) -> Destination {
    destination.events = vec![ConversionEvent::Subscribe];
    destination
}

/// Queue entry body for a lead.
pub fn lead_entry(id: &str, score: f64) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "id": id,
        "lead_score": score,
        "payload": { "schema_version": 1, "event_name": "Lead", "telegram_id": "42" }
    }))
    .unwrap()
}

pub struct Harness {
    pub clock: TestClock,
    pub events: Arc<InMemoryEventStore>,
    pub dead_letters: Arc<InMemoryDeadLetterStore>,
    pub queue: Arc<InMemoryQueue>,
    pub client: Arc<ScriptedClient>,
    pub batchers: BatcherSet,
    pub consumer: StreamConsumer,
    pub senders: HashMap<DestinationName, Sender>,
    pub reprocessor: Reprocessor,
    pub stats: SharedStats,
}

impl Harness {
    pub fn new(destinations: Vec<Destination>, batch: BatchConfig, policy: RetryPolicy) -> Self {
        let clock = TestClock::new();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let events = Arc::new(InMemoryEventStore::new());
        let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
        let queue = Arc::new(InMemoryQueue::new(shared_clock.clone()));
        let client = Arc::new(ScriptedClient::default());
        let handler: Arc<dyn EventHandler> = Arc::new(NoOpEventHandler::new());
        let stats = stats::shared();

        let batchers =
            BatcherSet::new(destinations.iter().map(|d| d.name.clone()), &batch, &shared_clock);
        let dlq = DeadLetterQueue::new(
            dead_letters.clone(),
            handler.clone(),
            stats.clone(),
            shared_clock.clone(),
        );
        let coordinator = Arc::new(RetryCoordinator::new(
            events.clone(),
            dlq.clone(),
            batchers.clone(),
            policy,
            handler.clone(),
            stats.clone(),
            shared_clock.clone(),
        ));
        let reprocessor = Reprocessor::new(
            events.clone(),
            dead_letters.clone(),
            batchers.clone(),
            handler,
            stats.clone(),
            shared_clock.clone(),
        );

        let mut senders = HashMap::new();
        for destination in &destinations {
            let bucket = Arc::new(TokenBucket::new(
                destination.name.clone(),
                destination.rate_limit,
                shared_clock.clone(),
            ));
            let sender = Sender::new(
                Arc::new(destination.clone()),
                batchers.get(&destination.name).unwrap().clone(),
                bucket,
                client.clone(),
                coordinator.clone(),
                events.clone(),
                stats.clone(),
                shared_clock.clone(),
            );
            senders.insert(destination.name.clone(), sender);
        }

        let consumer = StreamConsumer::new(
            0,
            ConsumerConfig::default(),
            queue.clone(),
            events.clone(),
            Arc::new(destinations),
            batchers.clone(),
            dlq,
            stats.clone(),
            shared_clock,
        );

        Self {
            clock,
            events,
            dead_letters,
            queue,
            client,
            batchers,
            consumer,
            senders,
            reprocessor,
            stats,
        }
    }

    pub async fn enqueue(&self, body: &[u8]) {
        self.queue.enqueue(0, body).await.unwrap();
    }

    /// Reads, routes and acknowledges every visible entry of partition 0.
    pub async fn consume_all(&self) -> Vec<EntryOutcome> {
        let lease = self.queue.acquire_partition(0, "test").await.unwrap();
        let mut outcomes = Vec::new();
        for entry in self.queue.read(&lease, 1000).await.unwrap() {
            outcomes.push(self.consumer.process_entry(&entry).await.unwrap());
            self.queue.ack(&lease, entry.id).await.unwrap();
        }
        self.queue.release_partition(&lease).await.unwrap();
        outcomes
    }

    /// Sends the next due batch of `destination`, if any.
    pub async fn send_next(&self, destination: &str) -> Option<SendReport> {
        let name = DestinationName::from(destination);
        let batch = self.batchers.get(&name).unwrap().try_next_batch().await?;
        Some(self.senders[&name].send_batch(batch).await)
    }

    /// Sends due batches until none is left.
    pub async fn drain(&self, destination: &str) -> Vec<SendReport> {
        let mut reports = Vec::new();
        while let Some(report) = self.send_next(destination).await {
            reports.push(report);
        }
        reports
    }

    pub async fn event(&self, id: &str) -> LeadEvent {
        self.events.get(&EventId::from(id)).await.unwrap().unwrap()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.all().await
    }

    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
    }
}
