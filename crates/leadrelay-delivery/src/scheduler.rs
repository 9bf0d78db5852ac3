//! Periodic housekeeping.
//!
//! Every tick runs four independent steps: scheduled dead-letter
//! reprocessing, gauge emission, backfill of store records that are not in
//! any batcher, and reclaim of idle queue entries. A failing step is logged
//! and does not stop the others. All steps are keyed by event or entry id, so
//! overlapping ticks are harmless.

use std::{sync::Arc, time::Duration};

use chrono::Duration as ChronoDuration;
use leadrelay_core::{Clock, CoreError, DurableQueue, EventStatus, EventStore, StatusUpdate};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    batcher::BatcherSet,
    dead_letter::{auto_reprocess_filter, looks_transient, Reprocessor},
    error::PipelineError,
    metrics,
    rate_limit::BucketMap,
};

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Time between ticks.
    pub tick_interval: Duration,
    /// Whether ticks replay dead letters.
    pub auto_reprocess: bool,
    /// Minimum dead-letter age for scheduled replay.
    pub auto_reprocess_min_age: Duration,
    /// Entries replayed this many times are left alone.
    pub auto_reprocess_max: u32,
    /// Entries replayed per tick at most.
    pub auto_reprocess_limit: usize,
    /// In-flight records untouched this long are returned to pending.
    pub stale_in_flight_after: Duration,
    /// Records backfilled per tick at most.
    pub backfill_limit: usize,
    /// Unacknowledged entries idle this long are redelivered.
    pub reclaim_idle: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            auto_reprocess: true,
            auto_reprocess_min_age: Duration::from_secs(15 * 60),
            auto_reprocess_max: 3,
            auto_reprocess_limit: 100,
            stale_in_flight_after: Duration::from_secs(5 * 60),
            backfill_limit: 1000,
            reclaim_idle: Duration::from_secs(5 * 60),
        }
    }
}

/// Work done by one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Dead letters replayed.
    pub reprocessed: usize,
    /// Records pushed back to their batchers.
    pub backfilled: usize,
    /// Stale in-flight records returned to pending.
    pub released: usize,
    /// Queue entries made visible again.
    pub reclaimed: u64,
}

/// Periodic housekeeping task.
#[derive(Debug, Clone)]
pub struct Scheduler {
    config: SchedulerConfig,
    partitions: u32,
    events: Arc<dyn EventStore>,
    queue: Arc<dyn DurableQueue>,
    reprocessor: Reprocessor,
    batchers: BatcherSet,
    buckets: Arc<BucketMap>,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    /// Creates a scheduler over `partitions` queue partitions.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulerConfig,
        partitions: u32,
        events: Arc<dyn EventStore>,
        queue: Arc<dyn DurableQueue>,
        reprocessor: Reprocessor,
        batchers: BatcherSet,
        buckets: Arc<BucketMap>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { config, partitions, events, queue, reprocessor, batchers, buckets, clock }
    }

    /// Ticks until `cancel` fires. The first tick runs immediately.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        info!(interval = ?self.config.tick_interval, "scheduler started");
        loop {
            let report = self.tick().await;
            if report != TickReport::default() {
                info!(
                    reprocessed = report.reprocessed,
                    backfilled = report.backfilled,
                    released = report.released,
                    reclaimed = report.reclaimed,
                    "scheduler tick"
                );
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.clock.sleep(self.config.tick_interval) => {},
            }
        }
        info!("scheduler stopped");
        Ok(())
    }

    /// Runs every step once.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        if self.config.auto_reprocess {
            match self.auto_reprocess().await {
                Ok(count) => report.reprocessed = count,
                Err(err) => warn!(error = %err, "scheduled reprocessing failed"),
            }
        }

        self.emit_metrics().await;

        match self.backfill().await {
            Ok((backfilled, released)) => {
                report.backfilled = backfilled;
                report.released = released;
            },
            Err(err) => warn!(error = %err, "backfill failed"),
        }

        report.reclaimed = self.reclaim().await;
        report
    }

    async fn auto_reprocess(&self) -> Result<usize, PipelineError> {
        let filter = auto_reprocess_filter(
            self.config.auto_reprocess_min_age,
            self.config.auto_reprocess_max,
            self.config.auto_reprocess_limit,
        );
        let report = self
            .reprocessor
            .reprocess_matching(&filter, |entry| looks_transient(&entry.last_error))
            .await?;
        Ok(report.reprocessed.len())
    }

    async fn emit_metrics(&self) {
        match self.events.counts().await {
            Ok(counts) => metrics::record_status_counts(&counts),
            Err(err) => debug!(error = %err, "status counts unavailable"),
        }
        match self.queue.depth().await {
            Ok(depth) => metrics::record_queue_depth(&depth, depth.lag(self.clock.now_utc())),
            Err(err) => debug!(error = %err, "queue depth unavailable"),
        }
        for (name, bucket) in self.buckets.iter() {
            metrics::record_bucket_utilization(name.as_str(), bucket.utilization().await);
        }
    }

    /// Returns recoverable store records to their batchers.
    async fn backfill(&self) -> Result<(usize, usize), PipelineError> {
        let now = self.clock.now_utc();
        let stale_before = ChronoDuration::from_std(self.config.stale_in_flight_after)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(now);
        let records = self.events.list_recoverable(stale_before, self.config.backfill_limit).await?;

        let mut backfilled = 0;
        let mut released = 0;
        for record in records {
            let Some(batcher) = self.batchers.get(&record.destination) else {
                continue;
            };
            if batcher.contains(&record.id).await {
                continue;
            }

            let event = if record.status == EventStatus::InFlight {
                match self.events.update_status(&record.id, &StatusUpdate::released(), now).await {
                    Ok(event) => {
                        warn!(
                            event_id = %event.id,
                            destination = %event.destination,
                            "stale in-flight event released"
                        );
                        released += 1;
                        event
                    },
                    Err(CoreError::InvalidTransition { .. } | CoreError::NotFound(_)) => continue,
                    Err(err) => return Err(err.into()),
                }
            } else {
                record
            };

            batcher.requeue(event).await;
            backfilled += 1;
        }
        Ok((backfilled, released))
    }

    async fn reclaim(&self) -> u64 {
        let mut reclaimed = 0;
        for partition in 0..self.partitions {
            match self.queue.reclaim_idle(partition, self.config.reclaim_idle).await {
                Ok(count) => reclaimed += count,
                Err(err) => warn!(partition, error = %err, "queue reclaim failed"),
            }
        }
        reclaimed
    }
}
