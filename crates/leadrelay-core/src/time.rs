//! Clock abstraction shared by the batcher, rate limiter and scheduler.
//!
//! Everything that waits or stamps a time goes through [`Clock`] so tests can
//! drive backoff, token refill and stale-event recovery without real sleeps.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};

/// Source of monotonic time, wall-clock time and sleeps.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current instant for measuring elapsed time.
    fn now(&self) -> Instant;

    /// Current wall-clock time.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for `duration`.
    ///
    /// `RealClock` maps this to `tokio::time::sleep`; `TestClock` advances
    /// virtual time and yields.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Current wall-clock time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }
}

/// Production clock backed by the OS and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually driven clock for tests.
///
/// Clones share the same timeline, so a clock handed to the pipeline can be
/// advanced from the test body.
#[derive(Debug, Clone)]
pub struct TestClock {
    monotonic_ns: Arc<AtomicU64>,
    system_ns: Arc<AtomicU64>,
    base_instant: Instant,
}

fn saturating_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

impl TestClock {
    /// Creates a clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Creates a clock starting at `start`.
    pub fn with_start_time(start: SystemTime) -> Self {
        let since_epoch = start.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            monotonic_ns: Arc::new(AtomicU64::new(0)),
            system_ns: Arc::new(AtomicU64::new(saturating_nanos(since_epoch))),
            base_instant: Instant::now(),
        }
    }

    /// Creates a clock starting at the UTC timestamp `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self::with_start_time(SystemTime::from(start))
    }

    /// Advances monotonic and wall-clock time by `duration`.
    pub fn advance(&self, duration: Duration) {
        let ns = saturating_nanos(duration);
        self.monotonic_ns.fetch_add(ns, Ordering::AcqRel);
        self.system_ns.fetch_add(ns, Ordering::AcqRel);
    }

    /// Moves wall-clock time to `time`. Monotonic time never goes backwards.
    pub fn jump_to(&self, time: SystemTime) {
        let target_ns = saturating_nanos(time.duration_since(UNIX_EPOCH).unwrap_or_default());
        let current_ns = self.system_ns.load(Ordering::Acquire);

        if target_ns > current_ns {
            self.advance(Duration::from_nanos(target_ns - current_ns));
        } else {
            self.system_ns.store(target_ns, Ordering::Release);
        }
    }

    /// Virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.monotonic_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + Duration::from_nanos(self.monotonic_ns.load(Ordering::Acquire))
    }

    fn now_system(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.system_ns.load(Ordering::Acquire))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_both_timelines() {
        let start = UNIX_EPOCH + Duration::from_secs(1_000);
        let clock = TestClock::with_start_time(start);
        let instant = clock.now();

        clock.advance(Duration::from_secs(10));

        assert_eq!(clock.now().duration_since(instant), Duration::from_secs(10));
        assert_eq!(clock.now_system(), start + Duration::from_secs(10));
        assert_eq!(clock.elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn now_utc_follows_system_time() {
        let start = DateTime::parse_from_rfc3339("2025-03-01T12:00:00Z")
            .map(|t| t.with_timezone(&Utc))
            .unwrap();
        let clock = TestClock::starting_at(start);

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now_utc(), start + chrono::Duration::seconds(90));
    }

    #[test]
    fn jump_backwards_keeps_monotonic_time() {
        let clock = TestClock::with_start_time(UNIX_EPOCH + Duration::from_secs(5_000));
        clock.advance(Duration::from_secs(1));

        clock.jump_to(UNIX_EPOCH + Duration::from_secs(2_000));

        assert_eq!(clock.now_system(), UNIX_EPOCH + Duration::from_secs(2_000));
        assert_eq!(clock.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn sleep_advances_virtual_time() {
        let clock = TestClock::new();
        let start = clock.now();

        clock.sleep(Duration::from_secs(5)).await;

        assert_eq!(clock.now().duration_since(start), Duration::from_secs(5));
    }
}
