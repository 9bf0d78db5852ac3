//! PostgreSQL repository for dead-letter entries.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    crypto::{open_text, seal_text, PayloadCipher},
    error::{CoreError, Result},
    models::{AttemptRecord, DeadLetter, DeadLetterFilter, DestinationName, ErrorClass, EventId},
    storage::DeadLetterStore,
};

macro_rules! dead_letter_columns {
    () => {
        "id, event_id, destination, lead_id, error_class, reason, last_error, attempt_count, \
         attempt_history, raw_entry, dead_at, reprocess_count, last_reprocessed_at"
    };
}

#[derive(Debug, sqlx::FromRow)]
struct DeadLetterRow {
    id: Uuid,
    event_id: Option<String>,
    destination: Option<String>,
    lead_id: Option<String>,
    error_class: String,
    reason: String,
    last_error: String,
    attempt_count: i32,
    attempt_history: serde_json::Value,
    raw_entry: Option<String>,
    dead_at: DateTime<Utc>,
    reprocess_count: i32,
    last_reprocessed_at: Option<DateTime<Utc>>,
}

impl TryFrom<DeadLetterRow> for DeadLetter {
    type Error = CoreError;

    fn try_from(row: DeadLetterRow) -> Result<Self> {
        let attempt_history: Vec<AttemptRecord> = serde_json::from_value(row.attempt_history)?;
        Ok(Self {
            id: row.id,
            event_id: row.event_id.map(EventId),
            destination: row.destination.map(DestinationName),
            lead_id: row.lead_id,
            error_class: row.error_class.parse().map_err(CoreError::Serialization)?,
            reason: row.reason,
            last_error: row.last_error,
            attempt_count: u32::try_from(row.attempt_count).unwrap_or_default(),
            attempt_history,
            raw_entry: row.raw_entry,
            dead_at: row.dead_at,
            reprocess_count: u32::try_from(row.reprocess_count).unwrap_or_default(),
            last_reprocessed_at: row.last_reprocessed_at,
        })
    }
}

/// Dead-letter repository backed by the `dead_letters` table.
///
/// Entries are never deleted. Replaying an entry sets `released_at`, which
/// hides it from listings until the same event dies again. Raw bodies of
/// poison entries are sealed when a cipher is set.
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

    /// Encrypts raw entries at rest with `cipher`.
    #[must_use]
    pub fn with_cipher(mut self, cipher: Option<Arc<PayloadCipher>>) -> Self {
        self.cipher = cipher;
        self
    }

    fn decode(&self, mut row: DeadLetterRow) -> Result<DeadLetter> {
        row.raw_entry = open_text(self.cipher.as_deref(), row.raw_entry.take())?;
        DeadLetter::try_from(row)
    }
}

#[async_trait]
impl DeadLetterStore for Repository {
    async fn insert(&self, entry: &DeadLetter) -> Result<Uuid> {
        let history = serde_json::to_value(&entry.attempt_history)?;
        let raw_entry = seal_text(self.cipher.as_deref(), entry.raw_entry.as_deref())?;

        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO dead_letters (
                id, event_id, destination, lead_id, error_class, reason, last_error,
                attempt_count, attempt_history, raw_entry, dead_at, reprocess_count
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (event_id) DO UPDATE SET
                error_class = EXCLUDED.error_class,
                reason = EXCLUDED.reason,
                last_error = EXCLUDED.last_error,
                attempt_count = EXCLUDED.attempt_count,
                attempt_history = EXCLUDED.attempt_history,
                dead_at = EXCLUDED.dead_at,
                released_at = NULL
            RETURNING id
            "#,
        )
        .bind(entry.id)
        .bind(entry.event_id.as_ref())
        .bind(entry.destination.as_ref().map(DestinationName::as_str))
        .bind(entry.lead_id.as_deref())
        .bind(entry.error_class.as_str())
        .bind(&entry.reason)
        .bind(&entry.last_error)
        .bind(i32::try_from(entry.attempt_count).unwrap_or(i32::MAX))
        .bind(&history)
        .bind(raw_entry.as_deref())
        .bind(entry.dead_at)
        .bind(i32::try_from(entry.reprocess_count).unwrap_or(i32::MAX))
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    async fn list(&self, filter: &DeadLetterFilter, now: DateTime<Utc>) -> Result<Vec<DeadLetter>> {
        let dead_before = filter
            .min_age
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .map(|age| now - age);
        let dead_after = filter
            .max_age
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .map(|age| now - age);

        let rows: Vec<DeadLetterRow> = sqlx::query_as(concat!(
            "SELECT ",
            dead_letter_columns!(),
            r#"
            FROM dead_letters
            WHERE released_at IS NULL
              AND ($1::timestamptz IS NULL OR dead_at <= $1)
              AND ($2::timestamptz IS NULL OR dead_at >= $2)
              AND ($3::text IS NULL OR destination = $3)
              AND ($4::text IS NULL OR error_class = $4)
              AND ($5::integer IS NULL OR reprocess_count < $5)
            ORDER BY dead_at ASC
            LIMIT $6
            "#
        ))
        .bind(dead_before)
        .bind(dead_after)
        .bind(filter.destination.as_ref().map(DestinationName::as_str))
        .bind(filter.error_class.map(|c| c.as_str()))
        .bind(filter.max_reprocess_count.map(|n| i32::try_from(n).unwrap_or(i32::MAX)))
        .bind(i64::try_from(filter.limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        rows.into_iter().map(|row| self.decode(row)).collect()
    }

    async fn mark_reprocessed(&self, id: Uuid, at: DateTime<Utc>) -> Result<DeadLetter> {
        let row: Option<DeadLetterRow> = sqlx::query_as(concat!(
            r#"
            UPDATE dead_letters SET
                reprocess_count = reprocess_count + 1,
                last_reprocessed_at = $2,
                released_at = $2
            WHERE id = $1
            RETURNING "#,
            dead_letter_columns!()
        ))
        .bind(id)
        .bind(at)
        .fetch_optional(&*self.pool)
        .await?;

        row.map(|row| self.decode(row))
            .transpose()?
            .ok_or_else(|| CoreError::NotFound(format!("dead letter {id}")))
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE released_at IS NULL")
                .fetch_one(&*self.pool)
                .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}
