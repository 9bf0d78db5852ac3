//! In-process counters for the admin surface.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

/// Totals since startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Running consumer tasks.
    pub active_consumers: usize,
    /// Running sender tasks.
    pub active_senders: usize,
    /// Queue entries acknowledged.
    pub entries_consumed: u64,
    /// Events handed to a batcher by the consumer.
    pub events_forwarded: u64,
    /// Upserts that hit a record already past `pending`.
    pub duplicates_ignored: u64,
    /// Events accepted by a destination.
    pub delivered: u64,
    /// Failed attempts scheduled for another try.
    pub retried: u64,
    /// Entries moved to the dead-letter queue.
    pub dead_lettered: u64,
    /// Poison queue entries.
    pub decode_failures: u64,
    /// Batches returned because the token budget ran out.
    pub capacity_exceeded: u64,
    /// Dead-letter entries replayed.
    pub reprocessed: u64,
}

/// Stats shared between workers.
pub type SharedStats = Arc<RwLock<PipelineStats>>;

/// Creates zeroed shared stats.
pub fn shared() -> SharedStats {
    Arc::new(RwLock::new(PipelineStats::default()))
}
