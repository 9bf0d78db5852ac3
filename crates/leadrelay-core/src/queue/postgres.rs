//! PostgreSQL-backed durable queue.
//!
//! Entries live in the `lead_queue` table. Partition leases are session
//! advisory locks, so a crashed consumer's lease disappears with its
//! connection. The connection holding each lease is kept open for the life
//! of the lease.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{pool::PoolConnection, PgPool, Postgres};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    queue::{DurableQueue, EntryId, PartitionLease, QueueDepth, QueueEntry},
};

/// First key of the two-key advisory lock space used for partition leases.
const LEASE_LOCK_NAMESPACE: i32 = 0x4c52_5131;

#[derive(Debug, sqlx::FromRow)]
struct QueueEntryRow {
    entry_id: i64,
    partition: i32,
    body: Vec<u8>,
    enqueued_at: DateTime<Utc>,
    delivery_count: i32,
}

impl From<QueueEntryRow> for QueueEntry {
    fn from(row: QueueEntryRow) -> Self {
        Self {
            id: row.entry_id,
            partition: u32::try_from(row.partition).unwrap_or_default(),
            body: row.body,
            enqueued_at: row.enqueued_at,
            delivery_count: u32::try_from(row.delivery_count).unwrap_or_default(),
        }
    }
}

#[derive(Debug)]
struct HeldLease {
    token: Uuid,
    connection: PoolConnection<Postgres>,
}

fn partition_key(partition: u32) -> i32 {
    i32::try_from(partition).unwrap_or(i32::MAX)
}

/// Queue repository backed by the `lead_queue` table.
#[derive(Debug)]
pub struct PostgresQueue {
    pool: Arc<PgPool>,
    leases: Mutex<HashMap<u32, HeldLease>>,
}

impl PostgresQueue {
    /// Creates a queue on the shared pool.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool, leases: Mutex::new(HashMap::new()) }
    }

    async fn check_lease(&self, lease: &PartitionLease) -> Result<()> {
        let leases = self.leases.lock().await;
        match leases.get(&lease.partition) {
            Some(held) if held.token == lease.token => Ok(()),
            _ => Err(CoreError::LeaseLost { partition: lease.partition }),
        }
    }

    /// Like `check_lease`, but also pings the session holding the advisory
    /// lock. A dead session has already lost the lock, so the lease is
    /// dropped and the caller has to acquire the partition again.
    async fn check_session(&self, lease: &PartitionLease) -> Result<()> {
        let mut leases = self.leases.lock().await;
        let held = match leases.get_mut(&lease.partition) {
            Some(held) if held.token == lease.token => held,
            _ => return Err(CoreError::LeaseLost { partition: lease.partition }),
        };

        let alive = sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&mut *held.connection).await;
        if let Err(e) = alive {
            warn!(partition = lease.partition, error = %e, "lease session lost");
            leases.remove(&lease.partition);
            return Err(CoreError::LeaseLost { partition: lease.partition });
        }
        Ok(())
    }
}

#[async_trait]
impl DurableQueue for PostgresQueue {
    async fn enqueue(&self, partition: u32, body: &[u8]) -> Result<EntryId> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO lead_queue (partition, body) VALUES ($1, $2) RETURNING entry_id",
        )
        .bind(partition_key(partition))
        .bind(body)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    async fn acquire_partition(&self, partition: u32, consumer: &str) -> Result<PartitionLease> {
        let mut leases = self.leases.lock().await;
        if leases.contains_key(&partition) {
            return Err(CoreError::PartitionHeld { partition, holder: "this process".to_string() });
        }

        let mut connection = self.pool.acquire().await?;
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1, $2)")
            .bind(LEASE_LOCK_NAMESPACE)
            .bind(partition_key(partition))
            .fetch_one(&mut *connection)
            .await?;
        if !locked {
            return Err(CoreError::PartitionHeld {
                partition,
                holder: "another database session".to_string(),
            });
        }

        let token = Uuid::new_v4();
        leases.insert(partition, HeldLease { token, connection });
        debug!(partition, consumer, "partition lease acquired");

        Ok(PartitionLease { partition, consumer: consumer.to_string(), token })
    }

    async fn release_partition(&self, lease: &PartitionLease) -> Result<()> {
        let held = {
            let mut leases = self.leases.lock().await;
            match leases.get(&lease.partition) {
                Some(held) if held.token == lease.token => leases.remove(&lease.partition),
                _ => None,
            }
        };
        let Some(mut held) = held else {
            return Ok(());
        };

        let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1, $2)")
            .bind(LEASE_LOCK_NAMESPACE)
            .bind(partition_key(lease.partition))
            .fetch_one(&mut *held.connection)
            .await;
        if let Err(e) = unlocked {
            warn!(partition = lease.partition, error = %e, "advisory unlock failed, closing session");
            held.connection.close().await?;
        }

        debug!(partition = lease.partition, consumer = %lease.consumer, "partition lease released");
        Ok(())
    }

    async fn read(&self, lease: &PartitionLease, count: usize) -> Result<Vec<QueueEntry>> {
        self.check_session(lease).await?;

        let rows: Vec<QueueEntryRow> = sqlx::query_as(
            r#"
            UPDATE lead_queue
            SET delivered_at = NOW(), delivery_count = delivery_count + 1
            WHERE entry_id IN (
                SELECT entry_id FROM lead_queue
                WHERE partition = $1 AND acked_at IS NULL AND delivered_at IS NULL
                ORDER BY entry_id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING entry_id, partition, body, enqueued_at, delivery_count
            "#,
        )
        .bind(partition_key(lease.partition))
        .bind(i64::try_from(count).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        let mut entries: Vec<QueueEntry> = rows.into_iter().map(QueueEntry::from).collect();
        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }

    async fn ack(&self, lease: &PartitionLease, entry_id: EntryId) -> Result<()> {
        self.check_lease(lease).await?;

        sqlx::query(
            "UPDATE lead_queue SET acked_at = NOW() WHERE entry_id = $1 AND partition = $2",
        )
        .bind(entry_id)
        .bind(partition_key(lease.partition))
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    async fn reclaim_idle(&self, partition: u32, min_idle: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE lead_queue SET delivered_at = NULL
            WHERE partition = $1
              AND acked_at IS NULL
              AND delivered_at < NOW() - make_interval(secs => $2)
            "#,
        )
        .bind(partition_key(partition))
        .bind(min_idle.as_secs_f64())
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let (unacked, oldest): (i64, Option<DateTime<Utc>>) = sqlx::query_as(
            "SELECT COUNT(*), MIN(enqueued_at) FROM lead_queue WHERE acked_at IS NULL",
        )
        .fetch_one(&*self.pool)
        .await?;

        Ok(QueueDepth {
            unacked: u64::try_from(unacked).unwrap_or_default(),
            oldest_enqueued_at: oldest,
        })
    }
}
