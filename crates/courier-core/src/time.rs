//! Clock abstraction for reader versioning and retry delays.
//!
//! Reader names carry a wall-clock version suffix and busy-retry loops sleep
//! between attempts; both go through [`Clock`] so tests can run them without
//! real waiting.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Clock abstraction for time operations.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current system time.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the specified duration.
    ///
    /// Production maps to `tokio::time::sleep`; test clocks advance virtual
    /// time immediately.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Milliseconds since the unix epoch, saturating at zero before it.
    fn unix_millis(&self) -> u64 {
        let since_epoch = self.now_system().duration_since(UNIX_EPOCH).unwrap_or_default();
        u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Production clock backed by the system time and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Virtual clock for deterministic tests.
///
/// Clones share the same time. `sleep` advances time instead of waiting and
/// records the total slept duration so tests can assert on retry delays.
#[derive(Debug, Clone)]
pub struct TestClock {
    system_ms: Arc<AtomicU64>,
    slept_ms: Arc<AtomicU64>,
}

impl TestClock {
    /// Creates a clock starting at the given unix time in milliseconds.
    pub fn at_millis(start_ms: u64) -> Self {
        Self {
            system_ms: Arc::new(AtomicU64::new(start_ms)),
            slept_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Creates a clock starting at the current system time.
    pub fn new() -> Self {
        Self::at_millis(RealClock.unix_millis())
    }

    /// Advances the clock by the specified duration.
    pub fn advance(&self, duration: Duration) {
        self.system_ms.fetch_add(millis(duration), Ordering::AcqRel);
    }

    /// Total virtual time spent in `sleep`.
    pub fn total_slept(&self) -> Duration {
        Duration::from_millis(self.slept_ms.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now_system(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.system_ms.load(Ordering::Acquire))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        self.slept_ms.fetch_add(millis(duration), Ordering::AcqRel);
        Box::pin(tokio::task::yield_now())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances() {
        let clock = TestClock::at_millis(1_000);
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.unix_millis(), 3_000);
    }

    #[test]
    fn clones_share_time() {
        let clock = TestClock::at_millis(0);
        let other = clock.clone();
        other.advance(Duration::from_millis(7));
        assert_eq!(clock.unix_millis(), 7);
    }

    #[tokio::test]
    async fn sleep_is_virtual_and_recorded() {
        let clock = TestClock::at_millis(0);
        clock.sleep(Duration::from_millis(250)).await;
        clock.sleep(Duration::from_millis(250)).await;

        assert_eq!(clock.unix_millis(), 500);
        assert_eq!(clock.total_slept(), Duration::from_millis(500));
    }
}
