//! Per-destination token bucket.
//!
//! Tokens refill continuously at `tokens / interval` up to a capacity of
//! `tokens`. A batch needs one token per event. When the bucket cannot cover
//! a batch, the caller sleeps on the injected clock until enough tokens have
//! accrued, so waiting never spins. If the wait would run past the caller's
//! deadline, the tokens taken so far are refunded and the acquisition fails
//! with `CapacityExceeded`.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use leadrelay_core::{Clock, DestinationName, RateLimit};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::PipelineError;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket for one destination.
#[derive(Debug)]
pub struct TokenBucket {
    destination: DestinationName,
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(destination: DestinationName, limit: RateLimit, clock: Arc<dyn Clock>) -> Self {
        let capacity = f64::from(limit.tokens.max(1));
        Self {
            destination,
            capacity,
            refill_per_sec: limit.per_second().max(f64::EPSILON),
            state: Mutex::new(BucketState { tokens: capacity, last_refill: clock.now() }),
            clock,
        }
    }

    /// Destination this bucket throttles.
    pub fn destination(&self) -> &DestinationName {
        &self.destination
    }

    /// Maximum burst size.
    pub fn capacity(&self) -> u32 {
        // Capacity was built from a u32.
        self.capacity as u32
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }

    /// Takes `count` tokens, waiting at most `max_wait` for them to accrue.
    ///
    /// Batches larger than the capacity are served in chunks as tokens
    /// refill.
    ///
    /// # Errors
    ///
    /// `PipelineError::CapacityExceeded` when the tokens cannot be gathered
    /// within `max_wait`. Nothing is consumed in that case.
    pub async fn acquire(&self, count: u32, max_wait: Duration) -> Result<(), PipelineError> {
        if count == 0 {
            return Ok(());
        }

        let needed_total = f64::from(count);
        let started = self.clock.now();
        let mut acquired = 0.0_f64;

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);

                let take = state.tokens.floor().min(needed_total - acquired).max(0.0);
                state.tokens -= take;
                acquired += take;
                if acquired >= needed_total {
                    return Ok(());
                }

                let target = (needed_total - acquired).min(self.capacity);
                Duration::from_secs_f64(((target - state.tokens) / self.refill_per_sec).max(0.0))
            };

            let elapsed = self.clock.now().saturating_duration_since(started);
            if elapsed + wait > max_wait {
                self.refund(acquired).await;
                debug!(
                    destination = %self.destination,
                    needed = count,
                    wait_ms = wait.as_millis() as u64,
                    "token budget exhausted before deadline"
                );
                return Err(PipelineError::CapacityExceeded {
                    destination: self.destination.to_string(),
                    needed: count,
                });
            }

            self.clock.sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    async fn refund(&self, tokens: f64) {
        if tokens <= 0.0 {
            return;
        }
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens = (state.tokens + tokens).min(self.capacity);
    }

    /// Fraction of the burst capacity currently consumed, in `[0, 1]`.
    pub async fn utilization(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        (1.0 - state.tokens / self.capacity).clamp(0.0, 1.0)
    }
}

/// Token buckets keyed by destination.
pub type BucketMap = BTreeMap<DestinationName, Arc<TokenBucket>>;
