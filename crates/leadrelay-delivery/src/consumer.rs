//! Durable queue consumer.
//!
//! One consumer owns one partition through a lease and reads its entries in
//! append order. Each entry is decoded, fanned out into one event per
//! accepting destination, upserted and pushed to the destination batchers.
//! The entry is acknowledged only after every routed event was handed off.
//! Undecodable entries go to the dead-letter queue and are acknowledged.

use std::{sync::Arc, time::Duration};

use leadrelay_core::{
    decode_entry, Clock, CoreError, Destination, DurableQueue, EventStore, LeadEvent,
    PartitionLease, QueueEntry,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    batcher::BatcherSet, dead_letter::DeadLetterQueue, error::PipelineError,
    stats::SharedStats,
};

/// Consumer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Name recorded on partition leases.
    pub consumer_name: String,
    /// Entries read per poll.
    pub read_batch_size: usize,
    /// Wait between polls of an empty partition.
    pub poll_interval: Duration,
    /// Wait before retrying an entry after a store outage.
    pub store_retry_backoff: Duration,
    /// Wait before retrying a lease held elsewhere.
    pub lease_retry_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_name: "leadrelay".to_string(),
            read_batch_size: 100,
            poll_interval: Duration::from_millis(500),
            store_retry_backoff: Duration::from_secs(2),
            lease_retry_interval: Duration::from_secs(5),
        }
    }
}

/// What happened to one queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Decoded and routed.
    Routed {
        /// Events pushed to batchers.
        forwarded: usize,
        /// Events whose record was already past `pending`.
        duplicates: usize,
    },
    /// No destination accepts the conversion event.
    Unrouted,
    /// Moved to the dead-letter queue.
    Poisoned,
}

/// Consumer for one queue partition.
#[derive(Debug, Clone)]
pub struct StreamConsumer {
    partition: u32,
    config: ConsumerConfig,
    queue: Arc<dyn DurableQueue>,
    events: Arc<dyn EventStore>,
    destinations: Arc<Vec<Destination>>,
    batchers: BatcherSet,
    dlq: DeadLetterQueue,
    stats: SharedStats,
    clock: Arc<dyn Clock>,
}

impl StreamConsumer {
    /// Creates a consumer for `partition`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        partition: u32,
        config: ConsumerConfig,
        queue: Arc<dyn DurableQueue>,
        events: Arc<dyn EventStore>,
        destinations: Arc<Vec<Destination>>,
        batchers: BatcherSet,
        dlq: DeadLetterQueue,
        stats: SharedStats,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { partition, config, queue, events, destinations, batchers, dlq, stats, clock }
    }

    /// Partition this consumer reads.
    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Consumes until `cancel` fires, then releases the lease.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        let Some(mut lease) = self.acquire_lease(&cancel).await else {
            return Ok(());
        };
        info!(partition = self.partition, consumer = %lease.consumer, "consumer started");

        while !cancel.is_cancelled() {
            let entries = match self.queue.read(&lease, self.config.read_batch_size).await {
                Ok(entries) => entries,
                Err(CoreError::LeaseLost { .. }) => {
                    warn!(partition = self.partition, "partition lease lost; acquiring again");
                    match self.acquire_lease(&cancel).await {
                        Some(renewed) => {
                            lease = renewed;
                            continue;
                        },
                        None => break,
                    }
                },
                Err(err) => {
                    warn!(partition = self.partition, error = %err, "queue read failed");
                    if self.pause(&cancel, self.config.store_retry_backoff).await {
                        break;
                    }
                    continue;
                },
            };

            if entries.is_empty() {
                if self.pause(&cancel, self.config.poll_interval).await {
                    break;
                }
                continue;
            }

            for entry in entries {
                if !self.handle_until_done(&lease, &entry, &cancel).await {
                    break;
                }
            }
        }

        if let Err(err) = self.queue.release_partition(&lease).await {
            warn!(partition = self.partition, error = %err, "failed to release partition lease");
        }
        info!(partition = self.partition, "consumer stopped");
        Ok(())
    }

    async fn acquire_lease(&self, cancel: &CancellationToken) -> Option<PartitionLease> {
        loop {
            match self.queue.acquire_partition(self.partition, &self.config.consumer_name).await {
                Ok(lease) => return Some(lease),
                Err(CoreError::PartitionHeld { holder, .. }) => {
                    debug!(partition = self.partition, %holder, "partition leased elsewhere");
                },
                Err(err) => {
                    warn!(partition = self.partition, error = %err, "cannot lease partition");
                },
            }
            if self.pause(cancel, self.config.lease_retry_interval).await {
                return None;
            }
        }
    }

    /// Sleeps on the clock. Returns `true` if cancelled meanwhile.
    async fn pause(&self, cancel: &CancellationToken, duration: Duration) -> bool {
        tokio::select! {
            () = cancel.cancelled() => true,
            () = self.clock.sleep(duration) => false,
        }
    }

    /// Processes one entry, retrying while the store is unavailable, and
    /// acknowledges it. Returns `false` when cancelled before the entry was
    /// handled.
    async fn handle_until_done(
        &self,
        lease: &PartitionLease,
        entry: &QueueEntry,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            match self.process_entry(entry).await {
                Ok(outcome) => {
                    debug!(partition = self.partition, entry_id = entry.id, ?outcome, "entry handled");
                    match self.queue.ack(lease, entry.id).await {
                        Ok(()) => {
                            let mut stats = self.stats.write().await;
                            stats.entries_consumed += 1;
                        },
                        Err(err) => warn!(
                            partition = self.partition,
                            entry_id = entry.id,
                            error = %err,
                            "ack failed; entry will be redelivered"
                        ),
                    }
                    return true;
                },
                Err(PipelineError::StoreUnavailable(reason)) => {
                    warn!(
                        partition = self.partition,
                        entry_id = entry.id,
                        %reason,
                        "store unavailable; entry not acknowledged"
                    );
                    if self.pause(cancel, self.config.store_retry_backoff).await {
                        return false;
                    }
                },
                Err(err) => {
                    error!(
                        partition = self.partition,
                        entry_id = entry.id,
                        error = %err,
                        "entry left unacknowledged"
                    );
                    return true;
                },
            }
        }
    }

    /// Decodes and routes one entry without acknowledging it.
    ///
    /// # Errors
    ///
    /// Store failures; the entry must stay unacknowledged.
    pub async fn process_entry(&self, entry: &QueueEntry) -> Result<EntryOutcome, PipelineError> {
        let now = self.clock.now_utc();
        let lead = match decode_entry(&entry.body, now) {
            Ok(lead) => lead,
            Err(err) => {
                self.dlq.bury_poison(entry, &err).await?;
                return Ok(EntryOutcome::Poisoned);
            },
        };

        let mut forwarded = 0;
        let mut duplicates = 0;
        let mut routed = false;

        for destination in self.destinations.iter() {
            if !destination.accepts(lead.payload.event_name) {
                continue;
            }
            let Some(batcher) = self.batchers.get(&destination.name) else {
                continue;
            };
            routed = true;

            let event = LeadEvent::from_lead(&lead, &destination.name, now);
            let (outcome, stored) = self.events.upsert(&event).await?;
            if outcome.should_forward() {
                batcher.push(stored).await?;
                forwarded += 1;
            } else {
                debug!(event_id = %event.id, ?outcome, "duplicate event ignored");
                duplicates += 1;
            }
        }

        if !routed {
            debug!(lead_id = %lead.lead_id, event = %lead.payload.event_name, "no destination accepts lead");
            return Ok(EntryOutcome::Unrouted);
        }

        {
            let mut stats = self.stats.write().await;
            stats.events_forwarded += forwarded as u64;
            stats.duplicates_ignored += duplicates as u64;
        }
        Ok(EntryOutcome::Routed { forwarded, duplicates })
    }
}

#[cfg(test)]
mod tests {
    use leadrelay_core::{
        queue::memory::InMemoryQueue,
        storage::memory::{InMemoryDeadLetterStore, InMemoryEventStore},
        ConversionEvent, DestinationKind, DestinationName, ErrorClass, EventHandler, EventId,
        EventStatus, NoOpEventHandler, RateLimit, StatusUpdate, TestClock,
    };

    use super::*;
    use crate::{batcher::BatchConfig, stats};

    struct Fixture {
        queue: Arc<InMemoryQueue>,
        events: Arc<InMemoryEventStore>,
        dead_letters: Arc<InMemoryDeadLetterStore>,
        batchers: BatcherSet,
        consumer: StreamConsumer,
    }

    fn destination(name: &str, events: Vec<ConversionEvent>) -> Destination {
        Destination {
            name: DestinationName::from(name),
            kind: DestinationKind::Webhook { headers: Default::default() },
            endpoint: "http://hook.invalid".into(),
            rate_limit: RateLimit { tokens: 10, interval: Duration::from_secs(1) },
            timeout: Duration::from_secs(5),
            bulk: false,
            events,
            enabled: true,
        }
    }

    fn fixture() -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let destinations = vec![
            destination("capi", Vec::new()),
            destination("ga4", vec![ConversionEvent::Subscribe]),
        ];
        let batchers = BatcherSet::new(
            destinations.iter().map(|d| d.name.clone()),
            &BatchConfig::default(),
            &clock,
        );
        let queue = Arc::new(InMemoryQueue::new(clock.clone()));
        let events = Arc::new(InMemoryEventStore::new());
        let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
        let handler: Arc<dyn EventHandler> = Arc::new(NoOpEventHandler::new());
        let stats = stats::shared();
        let dlq = DeadLetterQueue::new(dead_letters.clone(), handler, stats.clone(), clock.clone());
        let consumer = StreamConsumer::new(
            0,
            ConsumerConfig {
                poll_interval: Duration::from_millis(10),
                store_retry_backoff: Duration::from_millis(10),
                ..ConsumerConfig::default()
            },
            queue.clone(),
            events.clone(),
            Arc::new(destinations),
            batchers.clone(),
            dlq,
            stats,
            clock,
        );
        Fixture { queue, events, dead_letters, batchers, consumer }
    }

    fn entry(id: &str, event_name: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "id": id,
            "lead_score": 50,
            "payload": { "schema_version": 1, "event_name": event_name, "telegram_id": "9" }
        }))
        .unwrap()
    }

    fn queue_entry(body: Vec<u8>) -> QueueEntry {
        QueueEntry { id: 1, partition: 0, body, enqueued_at: chrono::Utc::now(), delivery_count: 1 }
    }

    #[tokio::test]
    async fn lead_fans_out_to_accepting_destinations() {
        let f = fixture();

        let outcome = f.consumer.process_entry(&queue_entry(entry("abc", "Lead"))).await.unwrap();

        assert_eq!(outcome, EntryOutcome::Routed { forwarded: 1, duplicates: 0 });
        let capi = f.batchers.get(&DestinationName::from("capi")).unwrap();
        assert!(capi.contains(&EventId::from("abc:capi")).await);
        assert!(f.batchers.get(&DestinationName::from("ga4")).unwrap().is_empty().await);
        assert!(f.events.get(&EventId::from("abc:capi")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn malformed_entries_are_dead_lettered() {
        let f = fixture();

        let outcome = f.consumer.process_entry(&queue_entry(b"{oops".to_vec())).await.unwrap();

        assert_eq!(outcome, EntryOutcome::Poisoned);
        let entries = f.dead_letters.all().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].error_class, ErrorClass::Decode);
        assert_eq!(entries[0].attempt_count, 0);
        assert!(f.events.all().await.is_empty());
    }

    #[tokio::test]
    async fn records_past_pending_are_not_forwarded_again() {
        let f = fixture();
        let body = entry("abc", "Lead");
        f.consumer.process_entry(&queue_entry(body.clone())).await.unwrap();
        f.events
            .update_status(&EventId::from("abc:capi"), &StatusUpdate::in_flight(), chrono::Utc::now())
            .await
            .unwrap();

        let outcome = f.consumer.process_entry(&queue_entry(body)).await.unwrap();

        assert_eq!(outcome, EntryOutcome::Routed { forwarded: 0, duplicates: 1 });
        let stored = f.events.get(&EventId::from("abc:capi")).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::InFlight);
    }

    #[tokio::test]
    async fn store_outage_is_reported_for_redelivery() {
        let f = fixture();
        f.events.set_unavailable(true);

        let err = f.consumer.process_entry(&queue_entry(entry("abc", "Lead"))).await.unwrap_err();

        assert!(matches!(err, PipelineError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn run_acknowledges_after_handoff_and_stops_on_cancel() {
        let f = fixture();
        f.queue.enqueue(0, &entry("abc", "Subscribe")).await.unwrap();
        f.queue.enqueue(0, b"not json").await.unwrap();
        let cancel = CancellationToken::new();

        let consumer = f.consumer.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { consumer.run(cancel).await }
        });
        for _ in 0..100 {
            if f.queue.unacked(0).await == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(f.queue.unacked(0).await, 0);
        assert_eq!(f.batchers.total_len().await, 2);
        assert_eq!(f.dead_letters.all().await.len(), 1);
    }

    #[tokio::test]
    async fn run_takes_the_partition_again_after_losing_its_lease() {
        let f = fixture();
        let cancel = CancellationToken::new();
        f.queue.enqueue(0, &entry("abc", "Lead")).await.unwrap();
        let consumer = f.consumer.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { consumer.run(cancel).await }
        });
        for _ in 0..100 {
            if f.queue.unacked(0).await == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }

        f.queue.drop_lease(0).await;
        f.queue.enqueue(0, &entry("def", "Subscribe")).await.unwrap();
        for _ in 0..200 {
            if f.queue.unacked(0).await == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(f.queue.unacked(0).await, 0);
        assert_eq!(f.batchers.total_len().await, 3);
        let ga4 = f.batchers.get(&DestinationName::from("ga4")).unwrap();
        assert!(ga4.contains(&EventId::from("def:ga4")).await);
    }
}
