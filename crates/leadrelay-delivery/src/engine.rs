//! Pipeline assembly and lifecycle.
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ DurableQueue │──▶│ StreamConsumer×P │──▶│ Batcher/dest │──▶│ Sender×N    │──▶ destination
//! └──────────────┘   └──────────────────┘   └──────────────┘   └─────────────┘
//!                            │                      ▲                 │
//!                            ▼                      │                 ▼
//!                    ┌──────────────┐       ┌───────────────┐  ┌──────────────────┐
//!                    │ EventStore   │◀──────│ Scheduler     │  │ RetryCoordinator │
//!                    └──────────────┘       └───────────────┘  └──────────────────┘
//!                                                   │                 │
//!                                                   ▼                 ▼
//!                                           ┌───────────────────────────────┐
//!                                           │ DeadLetterQueue / Reprocessor │
//!                                           └───────────────────────────────┘
//! ```
//!
//! [`Pipeline::start`] spawns two worker groups. The intake group runs one
//! consumer per partition and the scheduler; the sender group runs
//! `senders_per_destination` senders per destination. Shutdown stops intake
//! first so nothing new reaches the batchers, then lets senders finish the
//! batch they hold.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use leadrelay_core::{
    Clock, DeadLetter, DeadLetterFilter, Destination, DestinationName, EventHandler,
    MulticastEventHandler, QueueDepth, StatusCounts, Storage,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    batcher::{BatchConfig, BatcherSet},
    client::{ClientConfig, DestinationClient, HttpDestinationClient},
    consumer::{ConsumerConfig, StreamConsumer},
    coordinator::RetryCoordinator,
    dead_letter::{DeadLetterQueue, ReprocessReport, Reprocessor},
    error::PipelineError,
    metrics::MetricsEventHandler,
    rate_limit::{BucketMap, TokenBucket},
    retry::RetryPolicy,
    scheduler::{Scheduler, SchedulerConfig},
    sender::Sender,
    stats::{self, PipelineStats, SharedStats},
    worker_pool::WorkerPool,
};

/// Pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Queue partitions, one consumer each.
    pub partitions: u32,
    /// Consumer settings shared by every partition.
    pub consumer: ConsumerConfig,
    /// Concurrent senders per destination.
    pub senders_per_destination: usize,
    /// Batcher settings shared by every destination.
    pub batch: BatchConfig,
    /// Retry policy for failed attempts.
    pub retry: RetryPolicy,
    /// HTTP client settings.
    pub client: ClientConfig,
    /// Housekeeping settings.
    pub scheduler: SchedulerConfig,
    /// Budget for stopping every worker.
    pub shutdown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            partitions: crate::DEFAULT_PARTITIONS,
            consumer: ConsumerConfig::default(),
            senders_per_destination: crate::DEFAULT_SENDERS_PER_DESTINATION,
            batch: BatchConfig::default(),
            retry: RetryPolicy::default(),
            client: ClientConfig::default(),
            scheduler: SchedulerConfig::default(),
            shutdown_timeout: Duration::from_secs(crate::DEFAULT_SHUTDOWN_TIMEOUT_SECONDS),
        }
    }
}

/// A configured, not yet running pipeline.
#[derive(Debug)]
pub struct Pipeline {
    config: PipelineConfig,
    destinations: Arc<Vec<Destination>>,
    storage: Storage,
    client: Arc<dyn DestinationClient>,
    clock: Arc<dyn Clock>,
    handler: MulticastEventHandler,
}

impl Pipeline {
    /// Creates a pipeline for the enabled `destinations`.
    ///
    /// # Errors
    ///
    /// `Configuration` if there is nothing to run.
    pub fn new(
        config: PipelineConfig,
        destinations: Vec<Destination>,
        storage: Storage,
        client: Arc<dyn DestinationClient>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PipelineError> {
        if config.partitions == 0 {
            return Err(PipelineError::Configuration("partitions must be at least 1".into()));
        }
        if config.senders_per_destination == 0 {
            return Err(PipelineError::Configuration(
                "senders_per_destination must be at least 1".into(),
            ));
        }

        let destinations: Vec<Destination> =
            destinations.into_iter().filter(|d| d.enabled).collect();
        if destinations.is_empty() {
            return Err(PipelineError::Configuration("no enabled destinations".into()));
        }

        let mut handler = MulticastEventHandler::new();
        handler.add_subscriber(Arc::new(MetricsEventHandler::new()));

        Ok(Self {
            config,
            destinations: Arc::new(destinations),
            storage,
            client,
            clock,
            handler,
        })
    }

    /// Creates a pipeline that calls destinations over HTTP.
    ///
    /// # Errors
    ///
    /// `Configuration` if the HTTP client cannot be built or there is
    /// nothing to run.
    pub fn with_http_client(
        config: PipelineConfig,
        destinations: Vec<Destination>,
        storage: Storage,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PipelineError> {
        let client = HttpDestinationClient::new(config.client.clone())
            .map_err(|e| PipelineError::Configuration(e.to_string()))?;
        Self::new(config, destinations, storage, Arc::new(client), clock)
    }

    /// Adds a subscriber for pipeline events.
    #[must_use]
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler.add_subscriber(handler);
        self
    }

    /// Enabled destinations.
    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    /// Spawns every worker and returns the running pipeline.
    pub async fn start(self) -> PipelineHandle {
        let Self { config, destinations, storage, client, clock, handler } = self;
        let handler: Arc<dyn EventHandler> = Arc::new(handler);
        let stats = stats::shared();

        info!(
            partitions = config.partitions,
            destinations = destinations.len(),
            senders_per_destination = config.senders_per_destination,
            max_batch_size = config.batch.max_batch_size,
            max_attempts = config.retry.max_attempts,
            "starting delivery pipeline"
        );

        let batchers =
            BatcherSet::new(destinations.iter().map(|d| d.name.clone()), &config.batch, &clock);
        let buckets: Arc<BucketMap> = Arc::new(
            destinations
                .iter()
                .map(|d| {
                    let bucket = TokenBucket::new(d.name.clone(), d.rate_limit, clock.clone());
                    (d.name.clone(), Arc::new(bucket))
                })
                .collect(),
        );
        let dlq = DeadLetterQueue::new(
            storage.dead_letters.clone(),
            handler.clone(),
            stats.clone(),
            clock.clone(),
        );
        let reprocessor = Reprocessor::new(
            storage.events.clone(),
            storage.dead_letters.clone(),
            batchers.clone(),
            handler.clone(),
            stats.clone(),
            clock.clone(),
        );
        let coordinator = Arc::new(RetryCoordinator::new(
            storage.events.clone(),
            dlq.clone(),
            batchers.clone(),
            config.retry.clone(),
            handler.clone(),
            stats.clone(),
            clock.clone(),
        ));

        let mut intake = WorkerPool::new("intake", CancellationToken::new());
        for partition in 0..config.partitions {
            let consumer = StreamConsumer::new(
                partition,
                config.consumer.clone(),
                storage.queue.clone(),
                storage.events.clone(),
                destinations.clone(),
                batchers.clone(),
                dlq.clone(),
                stats.clone(),
                clock.clone(),
            );
            intake.spawn(format!("consumer-{partition}"), move |cancel| async move {
                consumer.run(cancel).await
            });
        }

        let scheduler = Scheduler::new(
            config.scheduler.clone(),
            config.partitions,
            storage.events.clone(),
            storage.queue.clone(),
            reprocessor.clone(),
            batchers.clone(),
            buckets.clone(),
            clock.clone(),
        );
        intake.spawn("scheduler", move |cancel| async move { scheduler.run(cancel).await });

        let mut senders = WorkerPool::new("senders", CancellationToken::new());
        for destination in destinations.iter() {
            let (Some(batcher), Some(bucket)) =
                (batchers.get(&destination.name), buckets.get(&destination.name))
            else {
                continue;
            };
            let destination = Arc::new(destination.clone());
            for worker_id in 0..config.senders_per_destination {
                let sender = Sender::new(
                    destination.clone(),
                    batcher.clone(),
                    bucket.clone(),
                    client.clone(),
                    coordinator.clone(),
                    storage.events.clone(),
                    stats.clone(),
                    clock.clone(),
                );
                senders.spawn(format!("sender-{}-{worker_id}", destination.name), move |cancel| {
                    async move { sender.run(worker_id, cancel).await }
                });
            }
        }

        {
            let mut s = stats.write().await;
            s.active_consumers = config.partitions as usize;
            s.active_senders = senders.len();
        }
        info!(intake_workers = intake.len(), sender_workers = senders.len(), "pipeline started");

        let admin = PipelineAdmin {
            storage,
            destinations,
            reprocessor,
            batchers,
            buckets,
            stats: stats.clone(),
            clock,
        };

        PipelineHandle {
            admin,
            stats,
            intake: Some(intake),
            senders: Some(senders),
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

/// A running pipeline.
#[derive(Debug)]
pub struct PipelineHandle {
    admin: PipelineAdmin,
    stats: SharedStats,
    intake: Option<WorkerPool>,
    senders: Option<WorkerPool>,
    shutdown_timeout: Duration,
}

impl PipelineHandle {
    /// Operator view of the pipeline.
    pub fn admin(&self) -> PipelineAdmin {
        self.admin.clone()
    }

    /// Current totals.
    pub async fn stats(&self) -> PipelineStats {
        self.stats.read().await.clone()
    }

    /// Stops intake, then senders, within the shutdown budget.
    ///
    /// # Errors
    ///
    /// `ShutdownTimeout` if workers outlive the budget, `WorkerPanic` if one
    /// panicked. Every group is still asked to stop.
    pub async fn shutdown(mut self) -> Result<(), PipelineError> {
        info!(timeout_seconds = self.shutdown_timeout.as_secs(), "shutting down delivery pipeline");
        let started = Instant::now();
        let mut first_error = None;

        for pool in [self.intake.take(), self.senders.take()].into_iter().flatten() {
            let remaining = self.shutdown_timeout.saturating_sub(started.elapsed());
            if let Err(err) = pool.shutdown_graceful(remaining).await {
                warn!(error = %err, "worker group did not stop cleanly");
                first_error.get_or_insert(err);
            }
        }

        {
            let mut stats = self.stats.write().await;
            stats.active_consumers = 0;
            stats.active_senders = 0;
        }

        match first_error {
            None => {
                info!("delivery pipeline stopped");
                Ok(())
            },
            Some(err) => Err(err),
        }
    }
}

/// Per-destination view for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DestinationSnapshot {
    /// Destination name.
    pub name: DestinationName,
    /// Protocol label.
    pub kind: &'static str,
    /// Events held by the batcher.
    pub batched: usize,
    /// Consumed share of the token bucket.
    pub bucket_utilization: f64,
}

/// Point-in-time pipeline state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineSnapshot {
    /// Totals since startup.
    pub pipeline: PipelineStats,
    /// Stored events per status.
    pub events: StatusCounts,
    /// Dead-letter entries stored.
    pub dead_letters: u64,
    /// Unacknowledged queue entries.
    pub queue: QueueDepth,
    /// Age of the oldest unacknowledged entry.
    pub queue_lag_seconds: f64,
    /// Per-destination state.
    pub destinations: Vec<DestinationSnapshot>,
}

/// Operator handle: inspection and dead-letter reprocessing.
#[derive(Debug, Clone)]
pub struct PipelineAdmin {
    storage: Storage,
    destinations: Arc<Vec<Destination>>,
    reprocessor: Reprocessor,
    batchers: BatcherSet,
    buckets: Arc<BucketMap>,
    stats: SharedStats,
    clock: Arc<dyn Clock>,
}

impl PipelineAdmin {
    /// Checks the event store.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` if it cannot be reached.
    pub async fn health(&self) -> Result<(), PipelineError> {
        self.storage.health_check().await.map_err(PipelineError::from)
    }

    /// Collects totals, store counts, queue depth and destination state.
    ///
    /// # Errors
    ///
    /// Store or queue failures.
    pub async fn snapshot(&self) -> Result<PipelineSnapshot, PipelineError> {
        let events = self.storage.events.counts().await?;
        let dead_letters = self.storage.dead_letters.count().await?;
        let queue = self.storage.queue.depth().await.map_err(|e| PipelineError::queue(&e))?;
        let queue_lag_seconds = queue.lag(self.clock.now_utc()).as_secs_f64();

        let mut destinations = Vec::with_capacity(self.destinations.len());
        for destination in self.destinations.iter() {
            let batched = match self.batchers.get(&destination.name) {
                Some(batcher) => batcher.len().await,
                None => 0,
            };
            let bucket_utilization = match self.buckets.get(&destination.name) {
                Some(bucket) => bucket.utilization().await,
                None => 0.0,
            };
            destinations.push(DestinationSnapshot {
                name: destination.name.clone(),
                kind: destination.kind.label(),
                batched,
                bucket_utilization,
            });
        }

        Ok(PipelineSnapshot {
            pipeline: self.stats.read().await.clone(),
            events,
            dead_letters,
            queue,
            queue_lag_seconds,
            destinations,
        })
    }

    /// Dead-letter entries selected by `filter`.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetter>, PipelineError> {
        Ok(self.storage.dead_letters.list(filter, self.clock.now_utc()).await?)
    }

    /// Replays dead-letter entries selected by `filter`.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn reprocess(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<ReprocessReport, PipelineError> {
        self.reprocessor.reprocess(filter).await
    }
}
