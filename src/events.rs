//! Typed scheduler events.
//!
//! Every limiter publishes these to the registry's bus; TUI and log sinks
//! subscribe outside the core. Each event carries the key of the limiter it
//! came from, and per-request events are ordered `started`, `retrying`*, then
//! exactly one of `completed`/`failed`.

use std::fmt;
use std::time::Duration;

use serde_json::json;

use crate::key::{RateLimitKey, RequestId};

/// One event from one limiter.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerEvent {
    /// Originating rate-limit bucket.
    pub key: RateLimitKey,
    /// What happened.
    pub kind: EventKind,
}

impl SchedulerEvent {
    pub(crate) fn new(key: RateLimitKey, kind: EventKind) -> Self {
        Self { key, kind }
    }

    /// Stable label, e.g. `"request:started"`. Used as the JSON `kind` and in
    /// log lines.
    pub fn label(&self) -> &'static str {
        self.kind.label()
    }
}

/// Event payloads, grouped per concern.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Per-request lifecycle.
    Request(RequestEvent),
    /// Adaptive concurrency changes.
    Concurrency(ConcurrencyEvent),
    /// Upstream quota observations.
    RateLimit(RateLimitEvent),
}

impl EventKind {
    fn label(&self) -> &'static str {
        match self {
            Self::Request(RequestEvent::Started { .. }) => "request:started",
            Self::Request(RequestEvent::Completed { .. }) => "request:completed",
            Self::Request(RequestEvent::Retrying { .. }) => "request:retrying",
            Self::Request(RequestEvent::Failed { .. }) => "request:failed",
            Self::Concurrency(ConcurrencyEvent::Decreased { .. }) => "concurrency:decreased",
            Self::Concurrency(ConcurrencyEvent::Increased { .. }) => "concurrency:increased",
            Self::RateLimit(RateLimitEvent::Hit { .. }) => "ratelimit:hit",
            Self::RateLimit(RateLimitEvent::Warning { .. }) => "ratelimit:warning",
            Self::RateLimit(RateLimitEvent::Learned { .. }) => "ratelimit:learned",
        }
    }
}

/// Lifecycle of a single request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestEvent {
    /// `execute` accepted the request.
    Started {
        /// Correlation id.
        request_id: RequestId,
    },
    /// A response was delivered.
    Completed {
        /// Correlation id.
        request_id: RequestId,
        /// Final-attempt latency.
        latency: Duration,
    },
    /// A retry was scheduled.
    Retrying {
        /// Correlation id.
        request_id: RequestId,
        /// Attempt just failed (1-indexed).
        attempt: usize,
        /// Sleep before the next attempt.
        delay: Duration,
        /// Why the attempt is being repeated.
        reason: RetryReason,
    },
    /// The request terminated in an error.
    Failed {
        /// Correlation id.
        request_id: RequestId,
        /// Error category plus message, e.g. `"cancelled: request cancelled"`.
        error: String,
    },
}

/// Why a retry was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// The provider reported quota exhaustion.
    RateLimited,
    /// A transient network or server failure.
    Transient,
}

impl RetryReason {
    /// Stable lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "ratelimit",
            Self::Transient => "transient",
        }
    }
}

/// Why the concurrency limit moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyReason {
    /// Multiplicative decrease after a rate-limit hit.
    RateLimit,
    /// Additive increase after sustained success.
    Recovery,
}

impl ConcurrencyReason {
    /// Stable lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "ratelimit",
            Self::Recovery => "recovery",
        }
    }
}

/// Adaptive concurrency transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyEvent {
    /// The limit shrank.
    Decreased {
        /// Limit before the change.
        previous: usize,
        /// Limit after the change.
        current: usize,
        /// Trigger.
        reason: ConcurrencyReason,
    },
    /// The limit grew.
    Increased {
        /// Limit before the change.
        previous: usize,
        /// Limit after the change.
        current: usize,
        /// Trigger.
        reason: ConcurrencyReason,
    },
}

/// Upstream quota observations.
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitEvent {
    /// A rate-limit response arrived.
    Hit {
        /// Request that observed it.
        request_id: RequestId,
        /// Advertised delay, when present.
        retry_after: Option<Duration>,
    },
    /// A quota ratio dropped below the warning threshold.
    Warning {
        /// `remaining / limit` for requests, when known.
        request_ratio: Option<f64>,
        /// `remaining / limit` for tokens, when known.
        token_ratio: Option<f64>,
    },
    /// A new `(request_limit, token_limit)` pair was recorded.
    Learned {
        /// Request quota seen in headers before the hit.
        request_limit: Option<u64>,
        /// Token quota seen in headers before the hit.
        token_limit: Option<u64>,
    },
}

// Display is one line per event, label first, key last, mirroring the log
// sink's field order.
impl fmt::Display for SchedulerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            EventKind::Request(RequestEvent::Started { request_id }) => {
                write!(f, "request:started({request_id}) key={}", self.key)
            }
            EventKind::Request(RequestEvent::Completed { request_id, latency }) => {
                write!(f, "request:completed({request_id}, {latency:?}) key={}", self.key)
            }
            EventKind::Request(RequestEvent::Retrying { request_id, attempt, delay, reason }) => {
                write!(
                    f,
                    "request:retrying({request_id}, attempt={attempt}, delay={delay:?}, reason={}) key={}",
                    reason.as_str(),
                    self.key
                )
            }
            EventKind::Request(RequestEvent::Failed { request_id, error }) => {
                write!(f, "request:failed({request_id}, {error}) key={}", self.key)
            }
            EventKind::Concurrency(ConcurrencyEvent::Decreased { previous, current, reason }) => {
                write!(
                    f,
                    "concurrency:decreased({previous} -> {current}, reason={}) key={}",
                    reason.as_str(),
                    self.key
                )
            }
            EventKind::Concurrency(ConcurrencyEvent::Increased { previous, current, reason }) => {
                write!(
                    f,
                    "concurrency:increased({previous} -> {current}, reason={}) key={}",
                    reason.as_str(),
                    self.key
                )
            }
            EventKind::RateLimit(RateLimitEvent::Hit { request_id, retry_after }) => {
                write!(f, "ratelimit:hit({request_id}, retry_after={retry_after:?}) key={}", self.key)
            }
            EventKind::RateLimit(RateLimitEvent::Warning { request_ratio, token_ratio }) => {
                write!(
                    f,
                    "ratelimit:warning(requests={request_ratio:?}, tokens={token_ratio:?}) key={}",
                    self.key
                )
            }
            EventKind::RateLimit(RateLimitEvent::Learned { request_limit, token_limit }) => {
                write!(
                    f,
                    "ratelimit:learned(requests={request_limit:?}, tokens={token_limit:?}) key={}",
                    self.key
                )
            }
        }
    }
}

#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert an event into a JSON value for log-shipping sinks.
pub fn event_to_json(event: &SchedulerEvent) -> serde_json::Value {
    let mut value = match &event.kind {
        EventKind::Request(RequestEvent::Started { request_id }) => json!({
            "request_id": request_id,
        }),
        EventKind::Request(RequestEvent::Completed { request_id, latency }) => json!({
            "request_id": request_id,
            "latency_ms": clamp_u64(latency.as_millis()),
        }),
        EventKind::Request(RequestEvent::Retrying { request_id, attempt, delay, reason }) => json!({
            "request_id": request_id,
            "attempt": *attempt,
            "delay_ms": clamp_u64(delay.as_millis()),
            "reason": reason.as_str(),
        }),
        EventKind::Request(RequestEvent::Failed { request_id, error }) => json!({
            "request_id": request_id,
            "error": error,
        }),
        EventKind::Concurrency(
            ConcurrencyEvent::Decreased { previous, current, reason }
            | ConcurrencyEvent::Increased { previous, current, reason },
        ) => json!({
            "previous": *previous,
            "current": *current,
            "reason": reason.as_str(),
        }),
        EventKind::RateLimit(RateLimitEvent::Hit { request_id, retry_after }) => json!({
            "request_id": request_id,
            "retry_after_ms": retry_after.map(|d| clamp_u64(d.as_millis())),
        }),
        EventKind::RateLimit(RateLimitEvent::Warning { request_ratio, token_ratio }) => json!({
            "request_ratio": request_ratio,
            "token_ratio": token_ratio,
        }),
        EventKind::RateLimit(RateLimitEvent::Learned { request_limit, token_limit }) => json!({
            "request_limit": request_limit,
            "token_limit": token_limit,
        }),
    };
    if let Some(object) = value.as_object_mut() {
        object.insert("kind".to_string(), json!(event.label()));
        object.insert("key".to_string(), json!(event.key.as_str()));
    }
    value
}
