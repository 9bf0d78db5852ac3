//! Prometheus metric names and the pipeline event subscriber that records
//! them.
//!
//! Counters are driven by [`PipelineEvent`]s so the delivery path never
//! touches the recorder directly. Gauges are sampled by the scheduler.

use async_trait::async_trait;
use leadrelay_core::{ErrorClass, EventHandler, PipelineEvent, QueueDepth, StatusCounts};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Events accepted by a destination.
pub const EVENTS_DELIVERED: &str = "leadrelay_events_delivered_total";
/// Entries moved to the dead-letter queue.
pub const EVENTS_DEAD: &str = "leadrelay_events_dead_total";
/// Failed attempts scheduled for retry.
pub const EVENTS_RETRIED: &str = "leadrelay_events_retried_total";
/// Poison queue entries.
pub const DECODE_FAILURES: &str = "leadrelay_decode_failures_total";
/// Dead-letter entries replayed.
pub const EVENTS_REPROCESSED: &str = "leadrelay_events_reprocessed_total";
/// Pending events in the store.
pub const PENDING_EVENTS: &str = "leadrelay_pending_events";
/// In-flight events in the store.
pub const IN_FLIGHT_EVENTS: &str = "leadrelay_in_flight_events";
/// Unacknowledged queue entries.
pub const QUEUE_DEPTH: &str = "leadrelay_queue_depth";
/// Age of the oldest unacknowledged queue entry.
pub const QUEUE_LAG_SECONDS: &str = "leadrelay_queue_lag_seconds";
/// Consumed share of each destination's token bucket.
pub const BUCKET_UTILIZATION: &str = "leadrelay_bucket_utilization";
/// Lead creation to acceptance.
pub const DELIVERY_LATENCY_SECONDS: &str = "leadrelay_delivery_latency_seconds";

/// Registers descriptions with the installed recorder.
pub fn describe_metrics() {
    describe_counter!(EVENTS_DELIVERED, "Events accepted by a destination");
    describe_counter!(EVENTS_DEAD, "Entries moved to the dead-letter queue");
    describe_counter!(EVENTS_RETRIED, "Failed attempts scheduled for retry");
    describe_counter!(DECODE_FAILURES, "Queue entries rejected as poison messages");
    describe_counter!(EVENTS_REPROCESSED, "Dead-letter entries replayed");
    describe_gauge!(PENDING_EVENTS, "Pending events in the event store");
    describe_gauge!(IN_FLIGHT_EVENTS, "In-flight events in the event store");
    describe_gauge!(QUEUE_DEPTH, "Unacknowledged durable queue entries");
    describe_gauge!(QUEUE_LAG_SECONDS, "Age of the oldest unacknowledged queue entry");
    describe_gauge!(BUCKET_UTILIZATION, "Consumed share of the destination token bucket");
    describe_histogram!(DELIVERY_LATENCY_SECONDS, "Time from lead creation to acceptance");
}

/// Records event-driven counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsEventHandler;

impl MetricsEventHandler {
    /// Creates the handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventHandler for MetricsEventHandler {
    async fn handle_event(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::Delivered(e) => {
                counter!(EVENTS_DELIVERED, "destination" => e.destination.to_string()).increment(1);
                #[allow(clippy::cast_precision_loss)]
                histogram!(DELIVERY_LATENCY_SECONDS, "destination" => e.destination.to_string())
                    .record(e.latency_ms as f64 / 1000.0);
            },
            PipelineEvent::Failed(e) if e.will_retry => {
                counter!(EVENTS_RETRIED, "destination" => e.destination.to_string()).increment(1);
            },
            PipelineEvent::Failed(_) => {},
            PipelineEvent::DeadLettered(e) => {
                let destination =
                    e.destination.as_ref().map_or_else(|| "none".to_string(), ToString::to_string);
                counter!(
                    EVENTS_DEAD,
                    "destination" => destination,
                    "error_class" => e.error_class.as_str()
                )
                .increment(1);
                if e.error_class == ErrorClass::Decode {
                    counter!(DECODE_FAILURES).increment(1);
                }
            },
            PipelineEvent::Reprocessed(e) => {
                counter!(EVENTS_REPROCESSED, "destination" => e.destination.to_string())
                    .increment(1);
            },
        }
    }
}

/// Publishes store status gauges.
#[allow(clippy::cast_precision_loss)]
pub fn record_status_counts(counts: &StatusCounts) {
    gauge!(PENDING_EVENTS).set(counts.pending as f64);
    gauge!(IN_FLIGHT_EVENTS).set(counts.in_flight as f64);
}

/// Publishes queue depth and lag gauges.
#[allow(clippy::cast_precision_loss)]
pub fn record_queue_depth(depth: &QueueDepth, lag: std::time::Duration) {
    gauge!(QUEUE_DEPTH).set(depth.unacked as f64);
    gauge!(QUEUE_LAG_SECONDS).set(lag.as_secs_f64());
}

/// Publishes one destination's bucket utilization.
pub fn record_bucket_utilization(destination: &str, utilization: f64) {
    gauge!(BUCKET_UTILIZATION, "destination" => destination.to_string()).set(utilization);
}
