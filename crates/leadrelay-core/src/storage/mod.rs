//! Persistence layer for lead events and dead letters.
//!
//! The pipeline only talks to the [`EventStore`] and [`DeadLetterStore`]
//! traits. PostgreSQL repositories back production; in-memory
//! implementations back tests and local runs. Every implementation applies a
//! [`StatusUpdate`] only while the record is in one of the update's source
//! statuses, checked atomically, so concurrent writers can never move an
//! event backwards.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

pub mod dead_letters;
pub mod lead_events;
pub mod memory;
pub mod schema;

use crate::{
    crypto::PayloadCipher,
    error::Result,
    models::{
        DeadLetter, DeadLetterFilter, EventId, EventStatus, LeadEvent, StatusCounts,
        StatusUpdate, UpsertOutcome,
    },
    queue::{memory::InMemoryQueue, postgres::PostgresQueue, DurableQueue},
    time::Clock,
};

/// Durable record of lead events keyed by [`EventId`].
#[async_trait]
pub trait EventStore: Send + Sync + std::fmt::Debug {
    /// Idempotently records `event`.
    ///
    /// A missing record is inserted as `pending`. An existing `pending`
    /// record has its payload, score and creation time overwritten while its
    /// attempt count and retry state are kept. Records past `pending` are
    /// left untouched. Returns the outcome and the record as stored.
    async fn upsert(&self, event: &LeadEvent) -> Result<(UpsertOutcome, LeadEvent)>;

    /// Fetches one event.
    async fn get(&self, id: &EventId) -> Result<Option<LeadEvent>>;

    /// Applies a status transition and its field changes.
    ///
    /// # Errors
    ///
    /// `CoreError::NotFound` if the event does not exist and
    /// `CoreError::InvalidTransition` if the stored status does not allow
    /// `update.status`.
    async fn update_status(
        &self,
        id: &EventId,
        update: &StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<LeadEvent>;

    /// Events that need to re-enter the pipeline after a restart: every
    /// `pending` record and `in_flight` records untouched since
    /// `stale_before`. Oldest first, at most `limit`.
    async fn list_recoverable(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LeadEvent>>;

    /// Number of events per status.
    async fn counts(&self) -> Result<StatusCounts>;

    /// Verifies the store is reachable.
    async fn health_check(&self) -> Result<()>;
}

/// Durable store of terminally failed entries.
#[async_trait]
pub trait DeadLetterStore: Send + Sync + std::fmt::Debug {
    /// Records a dead letter.
    ///
    /// An entry for the same event id replaces the earlier one and becomes
    /// active again; its reprocess count is preserved. Returns the id of the
    /// stored entry.
    async fn insert(&self, entry: &DeadLetter) -> Result<Uuid>;

    /// Active entries matching `filter`, oldest first.
    async fn list(&self, filter: &DeadLetterFilter, now: DateTime<Utc>) -> Result<Vec<DeadLetter>>;

    /// Marks an entry as replayed: increments its reprocess count and hides it
    /// from listings until the event dies again.
    async fn mark_reprocessed(&self, id: Uuid, at: DateTime<Utc>) -> Result<DeadLetter>;

    /// Number of active entries.
    async fn count(&self) -> Result<u64>;
}

/// Process-wide persistence handles injected into every component.
#[derive(Clone, Debug)]
pub struct Storage {
    /// Lead event records.
    pub events: Arc<dyn EventStore>,

    /// Dead-letter entries.
    pub dead_letters: Arc<dyn DeadLetterStore>,

    /// Durable ingest queue.
    pub queue: Arc<dyn DurableQueue>,

    pool: Option<PgPool>,
}

impl Storage {
    /// PostgreSQL-backed storage sharing one connection pool.
    ///
    /// With a `cipher`, lead personal data is encrypted at rest.
    pub fn postgres(pool: PgPool, cipher: Option<PayloadCipher>) -> Self {
        let shared = Arc::new(pool.clone());
        let cipher = cipher.map(Arc::new);
        Self {
            events: Arc::new(
                lead_events::Repository::new(shared.clone()).with_cipher(cipher.clone()),
            ),
            dead_letters: Arc::new(
                dead_letters::Repository::new(shared.clone()).with_cipher(cipher),
            ),
            queue: Arc::new(PostgresQueue::new(shared)),
            pool: Some(pool),
        }
    }

    /// In-memory storage for tests and local runs.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            events: Arc::new(memory::InMemoryEventStore::new()),
            dead_letters: Arc::new(memory::InMemoryDeadLetterStore::new()),
            queue: Arc::new(InMemoryQueue::new(clock)),
            pool: None,
        }
    }

    /// Assembles storage from individual implementations.
    pub fn from_parts(
        events: Arc<dyn EventStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        queue: Arc<dyn DurableQueue>,
    ) -> Self {
        Self { events, dead_letters, queue, pool: None }
    }

    /// Verifies the event store is reachable.
    pub async fn health_check(&self) -> Result<()> {
        self.events.health_check().await
    }

    /// Closes the connection pool, if any. Further queries fail.
    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }
}

/// Checks `update` against `current` and returns the transition error, if any.
pub(crate) fn check_transition(
    id: &EventId,
    current: EventStatus,
    update: &StatusUpdate,
) -> Result<()> {
    if update.applies_to(current) {
        Ok(())
    } else {
        Err(crate::error::CoreError::InvalidTransition {
            id: id.clone(),
            from: current,
            to: update.status,
        })
    }
}
