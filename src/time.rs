//! Time seams: reading the clock and sleeping are injected dependencies so
//! queue timeouts, cooldowns and backoff schedules are testable without real
//! delays.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Monotonic time source in milliseconds.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds since an arbitrary epoch; never decreases.
    fn now_millis(&self) -> u64;
}

/// Waiting primitive.
#[async_trait]
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    /// Suspend the current task for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by `Instant::now()`.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Production sleeper on the tokio timer wheel.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Test double that is both clock and sleeper: `sleep` returns immediately,
/// advances the clock by the requested duration, and records the request, so
/// a retry loop's whole schedule can be asserted after a single await.
#[derive(Debug, Clone, Default)]
pub struct ManualTime {
    now_millis: Arc<AtomicU64>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl ManualTime {
    /// Fresh double at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        self.now_millis.fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }
}

impl Clock for ManualTime {
    fn now_millis(&self) -> u64 {
        self.now_millis.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sleeper for ManualTime {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(duration);
        self.now_millis.fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_never_decreases() {
        let clock = MonotonicClock::default();
        let first = clock.now_millis();
        let second = clock.now_millis();
        assert!(second >= first);
    }

    #[tokio::test]
    async fn tokio_sleeper_waits_roughly_the_requested_time() {
        let start = Instant::now();
        TokioSleeper.sleep(Duration::from_millis(50)).await;
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn manual_time_advances_instead_of_waiting() {
        let time = ManualTime::new();
        let start = Instant::now();

        time.sleep(Duration::from_secs(30)).await;
        time.sleep(Duration::from_secs(60)).await;

        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(time.now_millis(), 90_000);
        assert_eq!(
            time.sleeps(),
            vec![Duration::from_secs(30), Duration::from_secs(60)]
        );
    }

    #[test]
    fn manual_advance_does_not_record_a_sleep() {
        let time = ManualTime::new();
        time.advance(Duration::from_millis(250));
        assert_eq!(time.now_millis(), 250);
        assert!(time.sleeps().is_empty());
    }
}
