//! Idempotent schema bootstrap for the PostgreSQL backend.

use sqlx::PgPool;
use tracing::info;

use crate::error::Result;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS lead_events (
        id TEXT PRIMARY KEY,
        lead_id TEXT NOT NULL,
        destination TEXT NOT NULL,
        lead_score DOUBLE PRECISION NOT NULL,
        payload JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
        status TEXT NOT NULL
            CHECK (status IN ('pending', 'in_flight', 'delivered', 'dead')),
        next_attempt_at TIMESTAMPTZ,
        backoff_ms BIGINT,
        last_error TEXT,
        reprocessed BOOLEAN NOT NULL DEFAULT FALSE,
        history JSONB NOT NULL DEFAULT '[]'::jsonb,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_lead_events_status_updated
        ON lead_events (status, updated_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dead_letters (
        id UUID PRIMARY KEY,
        event_id TEXT UNIQUE,
        destination TEXT,
        lead_id TEXT,
        error_class TEXT NOT NULL
            CHECK (error_class IN ('decode', 'permanent', 'retries_exhausted')),
        reason TEXT NOT NULL,
        last_error TEXT NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        attempt_history JSONB NOT NULL DEFAULT '[]'::jsonb,
        raw_entry TEXT,
        dead_at TIMESTAMPTZ NOT NULL,
        reprocess_count INTEGER NOT NULL DEFAULT 0,
        last_reprocessed_at TIMESTAMPTZ,
        released_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_dead_letters_active
        ON dead_letters (dead_at) WHERE released_at IS NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS lead_queue (
        entry_id BIGSERIAL PRIMARY KEY,
        partition INTEGER NOT NULL,
        body BYTEA NOT NULL,
        enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        delivered_at TIMESTAMPTZ,
        delivery_count INTEGER NOT NULL DEFAULT 0,
        acked_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_lead_queue_unacked
        ON lead_queue (partition, entry_id) WHERE acked_at IS NULL
    "#,
];

/// Creates the `lead_events`, `dead_letters` and `lead_queue` tables if they
/// do not exist.
///
/// # Errors
///
/// Returns the first failing statement's error.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }

    info!(tables = 3, "database schema ready");
    Ok(())
}
