//! In-memory stores for tests and local runs.
//!
//! Both stores support failure injection through `set_unavailable`, which
//! makes every subsequent call fail with `CoreError::Unavailable` until it is
//! cleared.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    models::{
        DeadLetter, DeadLetterFilter, EventId, EventStatus, LeadEvent, StatusCounts,
        StatusUpdate, UpsertOutcome,
    },
    storage::{check_transition, DeadLetterStore, EventStore},
};

fn ensure_available(flag: &AtomicBool) -> Result<()> {
    if flag.load(Ordering::SeqCst) {
        Err(CoreError::Unavailable("in-memory store marked unavailable".to_string()))
    } else {
        Ok(())
    }
}

/// Event store kept in a hash map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventStore {
    events: Arc<RwLock<HashMap<EventId, LeadEvent>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryEventStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with `CoreError::Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Copies of every stored event.
    pub async fn all(&self) -> Vec<LeadEvent> {
        self.events.read().await.values().cloned().collect()
    }

    /// Stores `event` as-is, bypassing lifecycle checks. Test setup only.
    pub async fn insert_raw(&self, event: LeadEvent) {
        self.events.write().await.insert(event.id.clone(), event);
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn upsert(&self, event: &LeadEvent) -> Result<(UpsertOutcome, LeadEvent)> {
        ensure_available(&self.unavailable)?;
        let mut events = self.events.write().await;

        match events.get_mut(&event.id) {
            None => {
                let mut stored = event.clone();
                stored.status = EventStatus::Pending;
                stored.attempt_count = 0;
                stored.retry = None;
                stored.reprocessed = false;
                stored.history.clear();
                events.insert(stored.id.clone(), stored.clone());
                Ok((UpsertOutcome::Inserted, stored))
            },
            Some(existing) if existing.status == EventStatus::Pending => {
                existing.lead_score = event.lead_score;
                existing.payload = event.payload.clone();
                existing.created_at = event.created_at;
                existing.updated_at = event.updated_at;
                Ok((UpsertOutcome::Refreshed, existing.clone()))
            },
            Some(existing) => Ok((UpsertOutcome::Unchanged(existing.status), existing.clone())),
        }
    }

    async fn get(&self, id: &EventId) -> Result<Option<LeadEvent>> {
        ensure_available(&self.unavailable)?;
        Ok(self.events.read().await.get(id).cloned())
    }

    async fn update_status(
        &self,
        id: &EventId,
        update: &StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<LeadEvent> {
        ensure_available(&self.unavailable)?;
        let mut events = self.events.write().await;
        let event = events.get_mut(id).ok_or_else(|| CoreError::NotFound(format!("event {id}")))?;

        check_transition(id, event.status, update)?;
        event.apply(update, now);
        Ok(event.clone())
    }

    async fn list_recoverable(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LeadEvent>> {
        ensure_available(&self.unavailable)?;
        let events = self.events.read().await;

        let mut recoverable: Vec<LeadEvent> = events
            .values()
            .filter(|e| match e.status {
                EventStatus::Pending => true,
                EventStatus::InFlight => e.updated_at < stale_before,
                EventStatus::Delivered | EventStatus::Dead => false,
            })
            .cloned()
            .collect();
        recoverable.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        recoverable.truncate(limit);
        Ok(recoverable)
    }

    async fn counts(&self) -> Result<StatusCounts> {
        ensure_available(&self.unavailable)?;
        let mut counts = StatusCounts::default();
        for event in self.events.read().await.values() {
            counts.add(event.status, 1);
        }
        Ok(counts)
    }

    async fn health_check(&self) -> Result<()> {
        ensure_available(&self.unavailable)
    }
}

#[derive(Debug, Clone)]
struct StoredDeadLetter {
    entry: DeadLetter,
    released: bool,
}

/// Dead-letter store kept in insertion order.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeadLetterStore {
    entries: Arc<RwLock<Vec<StoredDeadLetter>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryDeadLetterStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with `CoreError::Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every entry ever recorded, including released ones.
    pub async fn all(&self) -> Vec<DeadLetter> {
        self.entries.read().await.iter().map(|s| s.entry.clone()).collect()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn insert(&self, entry: &DeadLetter) -> Result<Uuid> {
        ensure_available(&self.unavailable)?;
        let mut entries = self.entries.write().await;

        let existing = entry.event_id.as_ref().and_then(|event_id| {
            entries.iter_mut().find(|s| s.entry.event_id.as_ref() == Some(event_id))
        });
        if let Some(stored) = existing {
            let id = stored.entry.id;
            let reprocess_count = stored.entry.reprocess_count;
            let last_reprocessed_at = stored.entry.last_reprocessed_at;
            stored.entry = DeadLetter { id, reprocess_count, last_reprocessed_at, ..entry.clone() };
            stored.released = false;
            return Ok(id);
        }

        entries.push(StoredDeadLetter { entry: entry.clone(), released: false });
        Ok(entry.id)
    }

    async fn list(&self, filter: &DeadLetterFilter, now: DateTime<Utc>) -> Result<Vec<DeadLetter>> {
        ensure_available(&self.unavailable)?;
        let entries = self.entries.read().await;

        let mut selected: Vec<DeadLetter> = entries
            .iter()
            .filter(|s| !s.released && filter.matches(&s.entry, now))
            .map(|s| s.entry.clone())
            .collect();
        selected.sort_by_key(|e| e.dead_at);
        selected.truncate(filter.limit);
        Ok(selected)
    }

    async fn mark_reprocessed(&self, id: Uuid, at: DateTime<Utc>) -> Result<DeadLetter> {
        ensure_available(&self.unavailable)?;
        let mut entries = self.entries.write().await;
        let stored = entries
            .iter_mut()
            .find(|s| s.entry.id == id)
            .ok_or_else(|| CoreError::NotFound(format!("dead letter {id}")))?;

        stored.entry.reprocess_count += 1;
        stored.entry.last_reprocessed_at = Some(at);
        stored.released = true;
        Ok(stored.entry.clone())
    }

    async fn count(&self) -> Result<u64> {
        ensure_available(&self.unavailable)?;
        Ok(self.entries.read().await.iter().filter(|s| !s.released).count() as u64)
    }
}
