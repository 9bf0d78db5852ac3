//! PostgreSQL repository for lead events.
//!
//! Status transitions are enforced in SQL: every update carries the set of
//! statuses it may start from, so two writers racing on the same event can
//! never both succeed with incompatible transitions.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres};

use crate::{
    crypto::{open_payload, seal_payload, PayloadCipher},
    error::{CoreError, Result},
    models::{
        AttemptRecord, DestinationName, EventId, EventStatus, LeadEvent, RetryState,
        StatusCounts, StatusUpdate, UpsertOutcome,
    },
    storage::{check_transition, EventStore},
};

macro_rules! event_columns {
    () => {
        "id, lead_id, destination, lead_score, payload, created_at, attempt_count, status, \
         next_attempt_at, backoff_ms, last_error, reprocessed, history, updated_at"
    };
}

#[derive(Debug, sqlx::FromRow)]
struct LeadEventRow {
    id: String,
    lead_id: String,
    destination: String,
    lead_score: f64,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    attempt_count: i32,
    status: EventStatus,
    next_attempt_at: Option<DateTime<Utc>>,
    backoff_ms: Option<i64>,
    last_error: Option<String>,
    reprocessed: bool,
    history: serde_json::Value,
    updated_at: DateTime<Utc>,
}

impl TryFrom<LeadEventRow> for LeadEvent {
    type Error = CoreError;

    fn try_from(row: LeadEventRow) -> Result<Self> {
        let retry = row.next_attempt_at.map(|next_attempt_at| RetryState {
            next_attempt_at,
            backoff_interval: Duration::from_millis(
                row.backoff_ms.and_then(|ms| u64::try_from(ms).ok()).unwrap_or_default(),
            ),
            last_error: row.last_error.clone().unwrap_or_default(),
        });
        let attempt_count = u32::try_from(row.attempt_count).map_err(|_| {
            CoreError::Serialization(format!("negative attempt_count for event {}", row.id))
        })?;
        let history: Vec<AttemptRecord> = serde_json::from_value(row.history)?;

        Ok(Self {
            id: EventId(row.id),
            lead_id: row.lead_id,
            destination: DestinationName(row.destination),
            lead_score: row.lead_score,
            payload: serde_json::from_value(row.payload)?,
            created_at: row.created_at,
            attempt_count,
            status: row.status,
            retry,
            reprocessed: row.reprocessed,
            history,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UpsertRow {
    inserted: bool,
    #[sqlx(flatten)]
    event: LeadEventRow,
}

fn millis_i64(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn count_i32(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

/// Lead event repository backed by the `lead_events` table.
///
/// With a cipher, the payload's personal data is sealed before it is written
/// and opened on every read.
#[derive(Debug)]
pub struct Repository {
    pool: Arc<PgPool>,
    cipher: Option<Arc<PayloadCipher>>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool, cipher: None }
    }

    /// Encrypts personal data at rest with `cipher`.
    #[must_use]
    pub fn with_cipher(mut self, cipher: Option<Arc<PayloadCipher>>) -> Self {
        self.cipher = cipher;
        self
    }

    fn decode(&self, mut row: LeadEventRow) -> Result<LeadEvent> {
        row.payload = open_payload(self.cipher.as_deref(), row.payload)?;
        LeadEvent::try_from(row)
    }

    /// Returns the shared pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    async fn find_impl<'e, E>(&self, executor: E, id: &EventId) -> Result<Option<LeadEvent>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let row: Option<LeadEventRow> =
            sqlx::query_as(concat!("SELECT ", event_columns!(), " FROM lead_events WHERE id = $1"))
                .bind(id)
                .fetch_optional(executor)
                .await?;

        row.map(|row| self.decode(row)).transpose()
    }
}

#[async_trait]
impl EventStore for Repository {
    async fn upsert(&self, event: &LeadEvent) -> Result<(UpsertOutcome, LeadEvent)> {
        let payload = seal_payload(self.cipher.as_deref(), &event.payload)?;

        // xmax is zero only for rows created by this statement.
        let row: Option<UpsertRow> = sqlx::query_as(concat!(
            r#"
            INSERT INTO lead_events (
                id, lead_id, destination, lead_score, payload, created_at,
                attempt_count, status, reprocessed, history, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, 0, 'pending', FALSE, '[]'::jsonb, $7)
            ON CONFLICT (id) DO UPDATE SET
                lead_score = EXCLUDED.lead_score,
                payload = EXCLUDED.payload,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at
            WHERE lead_events.status = 'pending'
            RETURNING (xmax = 0) AS inserted, "#,
            event_columns!()
        ))
        .bind(&event.id)
        .bind(&event.lead_id)
        .bind(event.destination.as_str())
        .bind(event.lead_score)
        .bind(&payload)
        .bind(event.created_at)
        .bind(event.updated_at)
        .fetch_optional(&*self.pool)
        .await?;

        if let Some(row) = row {
            let outcome =
                if row.inserted { UpsertOutcome::Inserted } else { UpsertOutcome::Refreshed };
            return Ok((outcome, self.decode(row.event)?));
        }

        let existing = self
            .find_impl(&*self.pool, &event.id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("event {} vanished during upsert", event.id)))?;
        Ok((UpsertOutcome::Unchanged(existing.status), existing))
    }

    async fn get(&self, id: &EventId) -> Result<Option<LeadEvent>> {
        self.find_impl(&*self.pool, id).await
    }

    async fn update_status(
        &self,
        id: &EventId,
        update: &StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<LeadEvent> {
        let allowed: Vec<String> =
            update.from.iter().map(|s| s.as_str().to_string()).collect();
        let attempt = update
            .record_attempt
            .as_ref()
            .map(|record| serde_json::to_value(std::slice::from_ref(record)))
            .transpose()?;

        let row: Option<LeadEventRow> = sqlx::query_as(concat!(
            r#"
            UPDATE lead_events SET
                status = $2,
                attempt_count = COALESCE($3, attempt_count),
                next_attempt_at = $4,
                backoff_ms = $5,
                last_error = COALESCE($6, last_error),
                reprocessed = COALESCE($7, reprocessed),
                history = CASE WHEN $8::jsonb IS NULL THEN history ELSE history || $8::jsonb END,
                updated_at = $9
            WHERE id = $1 AND status = ANY($10)
            RETURNING "#,
            event_columns!()
        ))
        .bind(id)
        .bind(update.status)
        .bind(update.attempt_count.map(count_i32))
        .bind(update.retry.as_ref().map(|r| r.next_attempt_at))
        .bind(update.retry.as_ref().map(|r| millis_i64(r.backoff_interval)))
        .bind(update.record_attempt.as_ref().map(|r| r.error.clone()))
        .bind(update.reprocessed)
        .bind(attempt)
        .bind(now)
        .bind(&allowed)
        .fetch_optional(&*self.pool)
        .await?;

        match row {
            Some(row) => self.decode(row),
            None => {
                let current: Option<EventStatus> =
                    sqlx::query_scalar("SELECT status FROM lead_events WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&*self.pool)
                        .await?;
                match current {
                    None => Err(CoreError::NotFound(format!("event {id}"))),
                    Some(current) => {
                        check_transition(id, current, update)?;
                        // Allowed now but rejected a moment ago: a concurrent writer moved it.
                        Err(CoreError::InvalidTransition {
                            id: id.clone(),
                            from: current,
                            to: update.status,
                        })
                    },
                }
            },
        }
    }

    async fn list_recoverable(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LeadEvent>> {
        let rows: Vec<LeadEventRow> = sqlx::query_as(concat!(
            "SELECT ",
            event_columns!(),
            r#"
            FROM lead_events
            WHERE status = 'pending'
               OR (status = 'in_flight' AND updated_at < $1)
            ORDER BY created_at ASC
            LIMIT $2
            "#
        ))
        .bind(stale_before)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        rows.into_iter().map(|row| self.decode(row)).collect()
    }

    async fn counts(&self) -> Result<StatusCounts> {
        let rows: Vec<(EventStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM lead_events GROUP BY status")
                .fetch_all(&*self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            counts.add(status, u64::try_from(count).unwrap_or_default());
        }
        Ok(counts)
    }

    async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;
        Ok(())
    }
}
