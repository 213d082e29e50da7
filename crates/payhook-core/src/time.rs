//! Clock abstraction for testable timing.
//!
//! Retry scheduling and the sweeper compare stored timestamps against "now";
//! injecting the clock lets tests drive those comparisons deterministically
//! instead of sleeping.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Time source injected into time-dependent components.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current wall-clock time.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Sleeps for the given duration.
    ///
    /// Production maps to `tokio::time::sleep`; the test clock advances
    /// virtual time and yields immediately.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Creates a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Controllable clock for deterministic tests.
#[derive(Debug, Clone)]
pub struct TestClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl TestClock {
    /// Creates a test clock starting at the current system time.
    pub fn new() -> Self {
        Self { now: Arc::new(Mutex::new(Utc::now())) }
    }

    /// Creates a test clock starting at a fixed time.
    pub fn at(start: DateTime<Utc>) -> Self {
        Self { now: Arc::new(Mutex::new(start)) }
    }

    /// Advances the clock.
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock()
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
    fn test_clock_advances() {
        let clock = TestClock::new();
        let start = clock.now_utc();

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now_utc() - start, chrono::Duration::seconds(90));
    }

    #[tokio::test]
    async fn test_clock_sleep_advances_without_blocking() {
        let clock = TestClock::new();
        let start = clock.now_utc();

        clock.sleep(Duration::from_secs(3600)).await;

        assert_eq!(clock.now_utc() - start, chrono::Duration::hours(1));
    }
}
