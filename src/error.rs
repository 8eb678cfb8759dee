//! Error taxonomy surfaced by `execute`.
//!
//! Transient failures (rate limits, 5xx, connection resets) are recovered
//! inside the limiter's retry loop and never reach this enum. Everything here
//! is terminal for the request that observed it.

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Terminal failure for a scheduled request.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LimiterError {
    /// The cancel token fired. Re-raised verbatim; never retried and never
    /// counted as a rate-limit hit.
    #[error("request cancelled")]
    Cancelled,

    /// The request waited in the admission queue longer than the configured
    /// cap.
    #[error("queued for {waited_ms}ms, exceeding the {limit_ms}ms queue timeout")]
    QueueTimeout {
        /// Time actually spent waiting, in milliseconds.
        waited_ms: u64,
        /// Configured `queue_timeout` in milliseconds.
        limit_ms: u64,
    },

    /// The admission queue was at its configured bound.
    #[error("admission queue full ({depth} waiting, max {max})")]
    QueueOverflow {
        /// Queue depth observed at rejection.
        depth: usize,
        /// Configured `max_queue_depth`.
        max: usize,
    },

    /// The limiter (or registry) was disposed before or while this request
    /// was waiting.
    #[error("limiter disposed")]
    Disposed,

    /// The provider failed fatally, or retries were exhausted. Carries the
    /// last underlying message.
    #[error("provider call failed after {attempts} attempt(s): {message}")]
    Caller {
        /// Attempts made, including the final one.
        attempts: usize,
        /// Message of the last observed failure.
        message: String,
    },

    /// The provider returned neither `output` nor `error`; the caller
    /// contract requires exactly one.
    #[error("provider returned neither output nor error")]
    MalformedResponse,

    /// Per-execute overrides produced an invalid limiter configuration.
    #[error("invalid limiter configuration: {0}")]
    Config(#[from] ConfigError),
}

impl LimiterError {
    /// True for the user-cancel variant.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// True when the request never got a slot in time.
    pub fn is_queue_timeout(&self) -> bool {
        matches!(self, Self::QueueTimeout { .. })
    }

    /// True when the limiter had already been torn down.
    pub fn is_disposed(&self) -> bool {
        matches!(self, Self::Disposed)
    }

    /// True when the provider itself failed (fatally or after exhausting
    /// retries).
    pub fn is_caller(&self) -> bool {
        matches!(self, Self::Caller { .. })
    }

    /// Short category label used in events and logs.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::QueueTimeout { .. } => "queue-timeout",
            Self::QueueOverflow { .. } => "queue-overflow",
            Self::Disposed => "disposed",
            Self::Caller { .. } => "caller-error",
            Self::MalformedResponse => "malformed-response",
            Self::Config(_) => "invalid-config",
        }
    }

    pub(crate) fn queue_timeout(waited: Duration, limit: Duration) -> Self {
        Self::QueueTimeout {
            waited_ms: waited.as_millis() as u64,
            limit_ms: limit.as_millis() as u64,
        }
    }
}
