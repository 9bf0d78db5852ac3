//! Durable, partitioned ingest queue.
//!
//! Producers append raw entries to a partition. Exactly one consumer holds a
//! partition at a time through a [`PartitionLease`]; it reads entries in
//! append order and acknowledges each one after the lead has been handed to
//! the pipeline. Entries read but never acknowledged stay pending and are
//! handed out again by [`DurableQueue::reclaim_idle`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

use crate::error::Result;

/// Position of an entry within the queue. Increases with append order.
pub type EntryId = i64;

/// An entry read from the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    /// Entry position.
    pub id: EntryId,
    /// Partition the entry was appended to.
    pub partition: u32,
    /// Raw body as written by the producer.
    pub body: Vec<u8>,
    /// Append time.
    pub enqueued_at: DateTime<Utc>,
    /// How many times the entry has been handed to a consumer, including
    /// this one.
    pub delivery_count: u32,
}

/// Exclusive right to consume one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLease {
    /// Leased partition.
    pub partition: u32,
    /// Consumer holding the lease.
    pub consumer: String,
    /// Token proving the lease on reads and acks.
    pub token: Uuid,
}

/// Backlog summary across all partitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    /// Entries not yet acknowledged.
    pub unacked: u64,
    /// Append time of the oldest unacknowledged entry.
    pub oldest_enqueued_at: Option<DateTime<Utc>>,
}

impl QueueDepth {
    /// Age of the oldest unacknowledged entry at `now`.
    pub fn lag(&self, now: DateTime<Utc>) -> Duration {
        self.oldest_enqueued_at
            .and_then(|oldest| (now - oldest).to_std().ok())
            .unwrap_or_default()
    }
}

/// Append-ordered queue with per-partition leases and explicit acks.
#[async_trait]
pub trait DurableQueue: Send + Sync + std::fmt::Debug {
    /// Appends `body` to `partition`.
    async fn enqueue(&self, partition: u32, body: &[u8]) -> Result<EntryId>;

    /// Takes the lease on `partition` for `consumer`.
    ///
    /// # Errors
    ///
    /// `CoreError::PartitionHeld` if another consumer holds it.
    async fn acquire_partition(&self, partition: u32, consumer: &str) -> Result<PartitionLease>;

    /// Gives the lease back. Unacknowledged entries stay pending.
    async fn release_partition(&self, lease: &PartitionLease) -> Result<()>;

    /// Reads up to `count` entries never handed out before, in append order.
    ///
    /// # Errors
    ///
    /// `CoreError::LeaseLost` once the lease is gone; the consumer has to
    /// acquire the partition again before reading.
    async fn read(&self, lease: &PartitionLease, count: usize) -> Result<Vec<QueueEntry>>;

    /// Acknowledges an entry; it is never handed out again.
    async fn ack(&self, lease: &PartitionLease, entry_id: EntryId) -> Result<()>;

    /// Makes entries handed out more than `min_idle` ago and still
    /// unacknowledged readable again. Returns how many were reclaimed.
    async fn reclaim_idle(&self, partition: u32, min_idle: Duration) -> Result<u64>;

    /// Backlog across all partitions.
    async fn depth(&self) -> Result<QueueDepth>;
}
