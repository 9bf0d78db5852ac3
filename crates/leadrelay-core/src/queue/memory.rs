//! In-memory durable queue for tests and local runs.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    queue::{DurableQueue, EntryId, PartitionLease, QueueDepth, QueueEntry},
    time::Clock,
};

#[derive(Debug)]
struct StoredEntry {
    partition: u32,
    body: Vec<u8>,
    enqueued_at: DateTime<Utc>,
    handed_out_at: Option<DateTime<Utc>>,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: EntryId,
    entries: BTreeMap<EntryId, StoredEntry>,
    leases: HashMap<u32, PartitionLease>,
}

impl QueueState {
    fn check_lease(&self, lease: &PartitionLease) -> Result<()> {
        match self.leases.get(&lease.partition) {
            Some(held) if held.token == lease.token => Ok(()),
            _ => Err(CoreError::LeaseLost { partition: lease.partition }),
        }
    }
}

/// Queue kept in a B-tree ordered by entry id.
///
/// Acknowledged entries are dropped. Wall-clock time comes from the injected
/// clock, so idle reclaim can be driven by a `TestClock`.
#[derive(Debug, Clone)]
pub struct InMemoryQueue {
    state: Arc<Mutex<QueueState>>,
    clock: Arc<dyn Clock>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryQueue {
    /// Creates an empty queue.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState { next_id: 1, ..QueueState::default() })),
            clock,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Makes every call fail with `CoreError::Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Entries not yet acknowledged on `partition`.
    pub async fn unacked(&self, partition: u32) -> usize {
        self.state.lock().await.entries.values().filter(|e| e.partition == partition).count()
    }

    /// Forgets the lease on `partition` the way a dropped database session
    /// would. The holder finds out on its next read.
    pub async fn drop_lease(&self, partition: u32) {
        self.state.lock().await.leases.remove(&partition);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(CoreError::Unavailable("in-memory queue marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DurableQueue for InMemoryQueue {
    async fn enqueue(&self, partition: u32, body: &[u8]) -> Result<EntryId> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let id = state.next_id;
        state.next_id += 1;
        state.entries.insert(
            id,
            StoredEntry {
                partition,
                body: body.to_vec(),
                enqueued_at: self.clock.now_utc(),
                handed_out_at: None,
                delivery_count: 0,
            },
        );
        Ok(id)
    }

    async fn acquire_partition(&self, partition: u32, consumer: &str) -> Result<PartitionLease> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        if let Some(held) = state.leases.get(&partition) {
            return Err(CoreError::PartitionHeld { partition, holder: held.consumer.clone() });
        }

        let lease =
            PartitionLease { partition, consumer: consumer.to_string(), token: Uuid::new_v4() };
        state.leases.insert(partition, lease.clone());
        Ok(lease)
    }

    async fn release_partition(&self, lease: &PartitionLease) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.leases.get(&lease.partition).is_some_and(|held| held.token == lease.token) {
            state.leases.remove(&lease.partition);
        }
        Ok(())
    }

    async fn read(&self, lease: &PartitionLease, count: usize) -> Result<Vec<QueueEntry>> {
        self.ensure_available()?;
        let now = self.clock.now_utc();
        let mut state = self.state.lock().await;
        state.check_lease(lease)?;

        let mut batch = Vec::new();
        for (id, entry) in state.entries.iter_mut() {
            if batch.len() >= count {
                break;
            }
            if entry.partition != lease.partition || entry.handed_out_at.is_some() {
                continue;
            }
            entry.handed_out_at = Some(now);
            entry.delivery_count += 1;
            batch.push(QueueEntry {
                id: *id,
                partition: entry.partition,
                body: entry.body.clone(),
                enqueued_at: entry.enqueued_at,
                delivery_count: entry.delivery_count,
            });
        }
        Ok(batch)
    }

    async fn ack(&self, lease: &PartitionLease, entry_id: EntryId) -> Result<()> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        state.check_lease(lease)?;
        state.entries.remove(&entry_id);
        Ok(())
    }

    async fn reclaim_idle(&self, partition: u32, min_idle: Duration) -> Result<u64> {
        self.ensure_available()?;
        let now = self.clock.now_utc();
        let Some(cutoff) =
            chrono::Duration::from_std(min_idle).ok().and_then(|idle| now.checked_sub_signed(idle))
        else {
            return Ok(0);
        };
        let mut state = self.state.lock().await;

        let mut reclaimed = 0;
        for entry in state.entries.values_mut() {
            if entry.partition == partition
                && entry.handed_out_at.is_some_and(|handed_out| handed_out <= cutoff)
            {
                entry.handed_out_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn depth(&self) -> Result<QueueDepth> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(QueueDepth {
            unacked: state.entries.len() as u64,
            oldest_enqueued_at: state.entries.values().map(|e| e.enqueued_at).min(),
        })
    }
}
