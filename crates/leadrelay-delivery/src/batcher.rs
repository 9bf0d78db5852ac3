//! Priority batching per destination.
//!
//! Each destination owns one [`PriorityBatcher`] holding its working set of
//! pending events. Events are ordered by descending `lead_score`, then
//! ascending `created_at`, then arrival. A batch closes when
//! `max_batch_size` events are ready or the oldest ready event has waited
//! `max_batch_age`. On close, events that have waited at least
//! `max_batch_age` are taken first (oldest first) so low scores cannot
//! starve; the rest of the batch is filled by priority.
//!
//! Events scheduled for a retry stay invisible until their
//! `next_attempt_at`. New events from the consumer wait for capacity;
//! events coming back (retries, capacity returns, reprocess, backfill) are
//! always accepted.

use std::{
    cmp::Ordering,
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering as AtomicOrdering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use leadrelay_core::{Clock, DestinationName, EventId, LeadEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::PipelineError;

/// Longest a waiting sender sleeps before re-checking an idle batcher.
const IDLE_RECHECK: Duration = Duration::from_secs(1);

/// Batching parameters shared by every destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Events per batch.
    pub max_batch_size: usize,

    /// Longest a ready event waits before its batch closes.
    pub max_batch_age: Duration,

    /// Delivery deadline of a batch, measured from close.
    pub batch_timeout: Duration,

    /// Working-set capacity for new events per destination.
    pub capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            max_batch_age: Duration::from_secs(2),
            batch_timeout: Duration::from_secs(30),
            capacity: 10_000,
        }
    }
}

/// Events selected for one delivery attempt.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Destination every event targets.
    pub destination: DestinationName,
    /// Events in priority order.
    pub events: Vec<LeadEvent>,
    /// When the batch closed.
    pub closed_at: Instant,
    /// Deadline for token acquisition and calls.
    pub deadline: Instant,
}

impl Batch {
    /// Number of events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the batch holds no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Debug, Clone)]
struct PriorityKey {
    score: f64,
    created_at: DateTime<Utc>,
    seq: u64,
    id: EventId,
}

impl PartialEq for PriorityKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PriorityKey {}

impl PartialOrd for PriorityKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.seq.cmp(&other.seq))
            .then_with(|| self.id.cmp(&other.id))
    }
}

#[derive(Debug)]
struct Slot {
    event: LeadEvent,
    key: PriorityKey,
    counted: bool,
    /// Set while the event waits for its retry time.
    not_before: Option<DateTime<Utc>>,
    /// When the event became visible.
    ready_since: Option<Instant>,
}

#[derive(Debug, Default)]
struct BatcherState {
    slots: HashMap<EventId, Slot>,
    ready: BTreeSet<PriorityKey>,
    by_age: BTreeSet<(Instant, u64, EventId)>,
    delayed: BTreeSet<(DateTime<Utc>, u64, EventId)>,
}

impl BatcherState {
    /// Removes `id` and returns its slot.
    fn remove(&mut self, id: &EventId) -> Option<Slot> {
        let slot = self.slots.remove(id)?;
        self.ready.remove(&slot.key);
        if let Some(since) = slot.ready_since {
            self.by_age.remove(&(since, slot.key.seq, id.clone()));
        }
        if let Some(at) = slot.not_before {
            self.delayed.remove(&(at, slot.key.seq, id.clone()));
        }
        Some(slot)
    }

    /// Inserts `event`, replacing any slot with the same id. Returns whether
    /// a counted slot was replaced.
    fn insert(
        &mut self,
        event: LeadEvent,
        seq: u64,
        counted: bool,
        now: Instant,
        now_utc: DateTime<Utc>,
    ) -> bool {
        let replaced = self.remove(&event.id);
        let replaced_counted = replaced.as_ref().is_some_and(|slot| slot.counted);

        let key = PriorityKey {
            score: event.lead_score,
            created_at: event.created_at,
            seq,
            id: event.id.clone(),
        };
        let not_before = event.next_attempt_at().filter(|at| *at > now_utc);
        let mut slot = Slot {
            event,
            key,
            counted: counted || replaced_counted,
            not_before,
            ready_since: None,
        };

        match not_before {
            Some(at) => {
                self.delayed.insert((at, seq, slot.key.id.clone()));
            },
            None => {
                slot.ready_since = Some(now);
                self.ready.insert(slot.key.clone());
                self.by_age.insert((now, seq, slot.key.id.clone()));
            },
        }
        self.slots.insert(slot.key.id.clone(), slot);

        replaced_counted && counted
    }

    /// Makes delayed events whose retry time has come visible.
    fn promote(&mut self, now: Instant, now_utc: DateTime<Utc>) {
        while let Some((at, seq, id)) = self.delayed.first().cloned() {
            if at > now_utc {
                break;
            }
            self.delayed.remove(&(at, seq, id.clone()));
            if let Some(slot) = self.slots.get_mut(&id) {
                slot.not_before = None;
                slot.ready_since = Some(now);
                self.ready.insert(slot.key.clone());
                self.by_age.insert((now, seq, id));
            }
        }
    }

    fn oldest_ready_since(&self) -> Option<Instant> {
        self.by_age.first().map(|(since, _, _)| *since)
    }

    /// Selects a batch if one is due. Returns the removed slots.
    fn take(&mut self, config: &BatchConfig, now: Instant) -> Option<Vec<Slot>> {
        let size_reached = self.ready.len() >= config.max_batch_size;
        let age_reached = self
            .oldest_ready_since()
            .is_some_and(|since| now.saturating_duration_since(since) >= config.max_batch_age);
        if self.ready.is_empty() || !(size_reached || age_reached) {
            return None;
        }

        let mut selected: Vec<EventId> = self
            .by_age
            .iter()
            .take_while(|(since, _, _)| now.saturating_duration_since(*since) >= config.max_batch_age)
            .take(config.max_batch_size)
            .map(|(_, _, id)| id.clone())
            .collect();

        if selected.len() < config.max_batch_size {
            let room = config.max_batch_size - selected.len();
            let already: std::collections::HashSet<EventId> = selected.iter().cloned().collect();
            selected.extend(
                self.ready
                    .iter()
                    .filter(|key| !already.contains(&key.id))
                    .take(room)
                    .map(|key| key.id.clone())
                    .collect::<Vec<_>>(),
            );
        }

        let mut slots: Vec<Slot> = selected.iter().filter_map(|id| self.remove(id)).collect();
        slots.sort_by(|a, b| a.key.cmp(&b.key));
        Some(slots)
    }

    /// Time until the next batch could close or a delayed event becomes
    /// visible.
    fn next_wakeup(
        &self,
        config: &BatchConfig,
        now: Instant,
        now_utc: DateTime<Utc>,
    ) -> Option<Duration> {
        let age_wakeup = self
            .oldest_ready_since()
            .map(|since| (since + config.max_batch_age).saturating_duration_since(now));
        let retry_wakeup = self
            .delayed
            .first()
            .map(|(at, _, _)| (*at - now_utc).to_std().unwrap_or_default());

        match (age_wakeup, retry_wakeup) {
            (Some(a), Some(r)) => Some(a.min(r)),
            (a, r) => a.or(r),
        }
    }
}

/// Working set of pending events for one destination.
#[derive(Debug)]
pub struct PriorityBatcher {
    destination: DestinationName,
    config: BatchConfig,
    state: Mutex<BatcherState>,
    notify: Notify,
    permits: Semaphore,
    seq: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl PriorityBatcher {
    /// Creates an empty batcher.
    pub fn new(destination: DestinationName, config: BatchConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            destination,
            config,
            state: Mutex::new(BatcherState::default()),
            notify: Notify::new(),
            permits: Semaphore::new(capacity),
            seq: AtomicU64::new(0),
            clock,
        }
    }

    /// Destination this batcher feeds.
    pub fn destination(&self) -> &DestinationName {
        &self.destination
    }

    /// Batching parameters.
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    async fn insert(&self, event: LeadEvent, counted: bool) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        let now = self.clock.now();
        let now_utc = self.clock.now_utc();
        let release_extra = {
            let mut state = self.state.lock().await;
            state.insert(event, seq, counted, now, now_utc)
        };
        if release_extra {
            self.permits.add_permits(1);
        }
        self.notify.notify_waiters();
    }

    /// Adds a new event, waiting while the working set is at capacity.
    ///
    /// # Errors
    ///
    /// Fails only if the batcher was closed.
    pub async fn push(&self, event: LeadEvent) -> Result<(), PipelineError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| PipelineError::Configuration("batcher closed".to_string()))?;
        permit.forget();

        trace!(destination = %self.destination, event_id = %event.id, "event pushed");
        self.insert(event, true).await;
        Ok(())
    }

    /// Returns an event to the working set. Never waits for capacity.
    pub async fn requeue(&self, event: LeadEvent) {
        trace!(destination = %self.destination, event_id = %event.id, "event requeued");
        self.insert(event, false).await;
    }

    fn to_batch(&self, slots: Vec<Slot>, now: Instant) -> Batch {
        let released = slots.iter().filter(|slot| slot.counted).count();
        if released > 0 {
            self.permits.add_permits(released);
        }
        Batch {
            destination: self.destination.clone(),
            events: slots.into_iter().map(|slot| slot.event).collect(),
            closed_at: now,
            deadline: now + self.config.batch_timeout,
        }
    }

    /// Takes a batch if one is due, without waiting.
    pub async fn try_next_batch(&self) -> Option<Batch> {
        let now = self.clock.now();
        let now_utc = self.clock.now_utc();
        let slots = {
            let mut state = self.state.lock().await;
            state.promote(now, now_utc);
            state.take(&self.config, now)
        }?;
        Some(self.to_batch(slots, now))
    }

    /// Waits for the next batch. Returns `None` once `cancel` fires.
    pub async fn next_batch(&self, cancel: &CancellationToken) -> Option<Batch> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = self.clock.now();
            let now_utc = self.clock.now_utc();
            let (slots, wakeup) = {
                let mut state = self.state.lock().await;
                state.promote(now, now_utc);
                match state.take(&self.config, now) {
                    Some(slots) => (Some(slots), None),
                    None => (None, state.next_wakeup(&self.config, now, now_utc)),
                }
            };
            if let Some(slots) = slots {
                return Some(self.to_batch(slots, now));
            }

            let sleep_for =
                wakeup.unwrap_or(IDLE_RECHECK).clamp(Duration::from_millis(1), IDLE_RECHECK);
            tokio::select! {
                () = cancel.cancelled() => return None,
                () = &mut notified => {},
                () = self.clock.sleep(sleep_for) => {},
            }
        }
    }

    /// Number of events in the working set, visible or delayed.
    pub async fn len(&self) -> usize {
        self.state.lock().await.slots.len()
    }

    /// Whether the working set is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether `id` is in the working set.
    pub async fn contains(&self, id: &EventId) -> bool {
        self.state.lock().await.slots.contains_key(id)
    }
}

/// One batcher per destination.
#[derive(Debug, Clone, Default)]
pub struct BatcherSet {
    batchers: HashMap<DestinationName, Arc<PriorityBatcher>>,
}

impl BatcherSet {
    /// Creates a batcher for every destination.
    pub fn new(
        destinations: impl IntoIterator<Item = DestinationName>,
        config: &BatchConfig,
        clock: &Arc<dyn Clock>,
    ) -> Self {
        let batchers = destinations
            .into_iter()
            .map(|name| {
                let batcher = PriorityBatcher::new(name.clone(), config.clone(), clock.clone());
                (name, Arc::new(batcher))
            })
            .collect();
        Self { batchers }
    }

    /// Batcher of `destination`.
    pub fn get(&self, destination: &DestinationName) -> Option<&Arc<PriorityBatcher>> {
        self.batchers.get(destination)
    }

    /// All batchers.
    pub fn iter(&self) -> impl Iterator<Item = (&DestinationName, &Arc<PriorityBatcher>)> {
        self.batchers.iter()
    }

    /// Events held across all batchers.
    pub async fn total_len(&self) -> usize {
        let mut total = 0;
        for batcher in self.batchers.values() {
            total += batcher.len().await;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use leadrelay_core::{decode_entry, TestClock};

    use super::*;

    fn event(lead_id: &str, score: f64) -> LeadEvent {
        let body = serde_json::json!({
            "id": lead_id,
            "lead_score": score,
            "created_at": "2026-01-01T00:00:00Z",
            "payload": { "schema_version": 1, "event_name": "Lead", "telegram_id": "1" }
        });
        let lead = decode_entry(&serde_json::to_vec(&body).unwrap(), Utc::now()).unwrap();
        LeadEvent::from_lead(&lead, &DestinationName::from("capi"), Utc::now())
    }

    fn batcher(config: BatchConfig) -> (PriorityBatcher, TestClock) {
        let clock = TestClock::new();
        (PriorityBatcher::new(DestinationName::from("capi"), config, Arc::new(clock.clone())), clock)
    }

    fn config(max_batch_size: usize, max_batch_age: Duration) -> BatchConfig {
        BatchConfig { max_batch_size, max_batch_age, ..BatchConfig::default() }
    }

    fn lead_ids(batch: &Batch) -> Vec<&str> {
        batch.events.iter().map(|e| e.lead_id.as_str()).collect()
    }

    #[tokio::test]
    async fn higher_score_goes_first() {
        let (batcher, _clock) = batcher(config(1, Duration::from_secs(60)));
        batcher.push(event("def", 10.0)).await.unwrap();
        batcher.push(event("abc", 90.0)).await.unwrap();

        let first = batcher.try_next_batch().await.unwrap();
        let second = batcher.try_next_batch().await.unwrap();

        assert_eq!(lead_ids(&first), vec!["abc"]);
        assert_eq!(lead_ids(&second), vec!["def"]);
    }

    #[tokio::test]
    async fn partial_batch_waits_for_age() {
        let (batcher, clock) = batcher(config(10, Duration::from_secs(2)));
        batcher.push(event("a", 1.0)).await.unwrap();

        assert!(batcher.try_next_batch().await.is_none());
        clock.advance(Duration::from_secs(2));

        let batch = batcher.try_next_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batcher.is_empty().await);
    }

    #[tokio::test]
    async fn aged_events_are_taken_before_higher_scores() {
        let (batcher, clock) = batcher(config(2, Duration::from_secs(5)));
        batcher.push(event("old-low", 1.0)).await.unwrap();
        clock.advance(Duration::from_secs(6));
        for (id, score) in [("hot-1", 99.0), ("hot-2", 98.0), ("hot-3", 97.0)] {
            batcher.push(event(id, score)).await.unwrap();
        }

        let batch = batcher.try_next_batch().await.unwrap();

        assert_eq!(lead_ids(&batch), vec!["hot-1", "old-low"]);
    }

    #[tokio::test]
    async fn retrying_events_stay_hidden_until_due() {
        let (batcher, clock) = batcher(config(1, Duration::from_secs(60)));
        let mut waiting = event("retry", 50.0);
        waiting.retry = Some(leadrelay_core::RetryState {
            next_attempt_at: clock.now_utc() + chrono::Duration::seconds(4),
            backoff_interval: Duration::from_secs(4),
            last_error: "server error: HTTP 500".into(),
        });
        batcher.requeue(waiting).await;

        assert!(batcher.try_next_batch().await.is_none());
        clock.advance(Duration::from_secs(4));

        let batch = batcher.try_next_batch().await.unwrap();
        assert_eq!(lead_ids(&batch), vec!["retry"]);
    }

    #[tokio::test]
    async fn duplicate_ids_replace_existing_entry() {
        let (batcher, _clock) = batcher(config(10, Duration::from_secs(60)));
        batcher.push(event("abc", 1.0)).await.unwrap();
        batcher.push(event("abc", 80.0)).await.unwrap();
        batcher.requeue(event("abc", 80.0)).await;

        assert_eq!(batcher.len().await, 1);
    }

    #[tokio::test]
    async fn push_waits_for_capacity_but_requeue_does_not() {
        let config = BatchConfig { capacity: 1, ..config(1, Duration::from_secs(60)) };
        let (batcher, _clock) = batcher(config);
        batcher.push(event("a", 1.0)).await.unwrap();
        batcher.requeue(event("b", 1.0)).await;

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), batcher.push(event("c", 1.0))).await;
        assert!(blocked.is_err(), "push should wait while the working set is full");

        batcher.try_next_batch().await.unwrap();
        batcher.try_next_batch().await.unwrap();
        tokio::time::timeout(Duration::from_millis(50), batcher.push(event("c", 1.0)))
            .await
            .expect("capacity released after batch")
            .unwrap();
    }

    #[tokio::test]
    async fn next_batch_returns_none_when_cancelled() {
        let (batcher, _clock) = batcher(config(10, Duration::from_secs(60)));
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(batcher.next_batch(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn next_batch_wakes_on_push() {
        let clock = leadrelay_core::RealClock::new();
        let batcher = Arc::new(PriorityBatcher::new(
            DestinationName::from("capi"),
            config(1, Duration::from_secs(60)),
            Arc::new(clock),
        ));
        let cancel = CancellationToken::new();

        let waiter = {
            let batcher = batcher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { batcher.next_batch(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        batcher.push(event("abc", 5.0)).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(lead_ids(&batch), vec!["abc"]);
    }
}
