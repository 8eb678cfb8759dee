//! Counters, gauges and the latency ring behind `metrics()`.
//!
//! Counters are monotonic for the lifetime of a limiter and read without
//! blocking. Latency percentiles come from a fixed ring of the most recent
//! samples; old samples are overwritten, never summed, so a long run cannot
//! grow memory.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::key::RateLimitKey;

/// Samples kept for percentile estimation.
pub(crate) const LATENCY_RING_CAPACITY: usize = 256;

/// Monotonic counters plus the two gauges that track live occupancy.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub total: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub rate_limit_hits: AtomicU64,
    pub retried: AtomicU64,
    pub active: AtomicU64,
    pub queued: AtomicU64,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr_gauge(gauge: &AtomicU64) {
        // Gauges only; monotonic counters never go through here.
        gauge.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Fixed-size ring of recent latency samples in whole milliseconds.
#[derive(Debug)]
pub(crate) struct LatencyRing {
    samples: Vec<u64>,
    next: usize,
    len: usize,
}

impl LatencyRing {
    pub fn new() -> Self {
        Self { samples: vec![0; LATENCY_RING_CAPACITY], next: 0, len: 0 }
    }

    pub fn record(&mut self, millis: u64) {
        self.samples[self.next] = millis;
        self.next = (self.next + 1) % self.samples.len();
        self.len = (self.len + 1).min(self.samples.len());
    }

    /// Average, p50 and p99 over the retained window. Zeros when empty.
    pub fn stats(&self) -> LatencyStats {
        if self.len == 0 {
            return LatencyStats::default();
        }
        let mut window: Vec<u64> = self.samples[..self.len].to_vec();
        window.sort_unstable();
        let sum: u64 = window.iter().sum();
        LatencyStats {
            avg_ms: sum / self.len as u64,
            p50_ms: window[nearest_rank(self.len, 0.50)],
            p99_ms: window[nearest_rank(self.len, 0.99)],
        }
    }
}

fn nearest_rank(len: usize, quantile: f64) -> usize {
    (((len as f64) * quantile).ceil() as usize).saturating_sub(1).min(len - 1)
}

/// Latency summary over the ring window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencyStats {
    /// Mean latency, whole milliseconds.
    pub avg_ms: u64,
    /// Median latency.
    pub p50_ms: u64,
    /// 99th-percentile latency.
    pub p99_ms: u64,
}

/// Point-in-time view of one limiter, cheap to copy and serialize.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Rate-limit bucket these numbers describe.
    pub key: RateLimitKey,
    /// Requests currently holding a concurrency slot.
    pub active_requests: u64,
    /// Configured concurrency ceiling.
    pub max_concurrency: usize,
    /// Live adaptive concurrency limit.
    pub current_concurrency: usize,
    /// Requests waiting for admission.
    pub queue_depth: u64,
    /// Requests ever accepted by `execute`.
    pub total_requests: u64,
    /// Requests that delivered a response.
    pub completed_requests: u64,
    /// Requests that terminated in an error, including cancels and
    /// queue timeouts.
    pub failed_requests: u64,
    /// Rate-limit responses observed, across all attempts.
    pub rate_limit_hits: u64,
    /// Retry attempts scheduled.
    pub retried_requests: u64,
    /// Mean latency over the ring window.
    pub avg_latency_ms: u64,
    /// Median latency over the ring window.
    pub p50_latency_ms: u64,
    /// 99th-percentile latency over the ring window.
    pub p99_latency_ms: u64,
}
