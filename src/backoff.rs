//! Retry delay computation.
//!
//! Exponential growth with a hard cap and bounded jitter. Attempt `n` sleeps
//! `min(cap, base * multiplier^(n-1))`, scaled by a random factor in
//! `[0.5, 1.5)` when jitter is enabled. A provider-advertised `Retry-After`
//! replaces the computed delay but is still clamped to the cap.
//!
//! The RNG is a parameter, not a global, so retry schedules are reproducible
//! under test.

use std::time::Duration;

use rand::Rng;

/// Backoff parameters for one limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the second attempt.
    pub base: Duration,
    /// Growth factor per attempt, at least 1.
    pub multiplier: f64,
    /// Upper bound for any single delay, including `Retry-After` values.
    pub cap: Duration,
    /// Scale each delay by a random factor in `[0.5, 1.5)`.
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            multiplier: 2.0,
            cap: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry `attempt` (1-indexed: attempt 1 is the first
    /// retry), without jitter.
    pub fn raw_delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let millis = self.base.as_millis() as f64 * self.multiplier.powi(exponent);
        // powi saturates to infinity long before u64 does; min() handles both.
        let millis = millis.min(self.cap.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Delay before retry `attempt`, jittered when configured.
    pub fn delay<R: Rng>(&self, attempt: usize, rng: &mut R) -> Duration {
        let raw = self.raw_delay(attempt);
        if !self.jitter || raw.is_zero() {
            return raw;
        }
        let factor: f64 = rng.random_range(0.5..1.5);
        Duration::from_millis((raw.as_millis() as f64 * factor) as u64)
    }

    /// Clamp a provider-advertised delay to the configured cap.
    pub fn clamp(&self, advertised: Duration) -> Duration {
        advertised.min(self.cap)
    }
}
