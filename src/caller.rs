//! The provider contract consumed by the scheduler.
//!
//! A [`Caller`] wraps one upstream model-provider endpoint behind a single
//! invocation. The scheduler owns no caller lifecycle: it inspects
//! [`CallerConfig`] to derive the rate-limit key, invokes [`Caller::call`]
//! under admission control, and classifies what comes back. Callers are
//! required to honor the cancel token in [`CallOptions`] by aborting their
//! underlying transport and returning [`CallFailure::Aborted`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::key::{RateLimitKey, RequestId};

/// One upstream provider endpoint.
#[async_trait]
pub trait Caller: Send + Sync {
    /// Stable identity for the process lifetime, e.g. `"openai:gpt-4o"`.
    fn id(&self) -> &str;

    /// Configuration record. Inspected only by the key resolver.
    fn config(&self) -> &CallerConfig;

    /// Make a single request. Must return a response with exactly one of
    /// `output` / `error` set, or fail with a [`CallFailure`]. A fired cancel
    /// token must surface as [`CallFailure::Aborted`].
    async fn call(
        &self,
        body: &serde_json::Value,
        ctx: &CallContext,
        opts: &CallOptions,
    ) -> Result<ProviderResponse, CallFailure>;

    /// Optional pacing delay applied after each non-cached success, before
    /// the concurrency slot is released.
    fn delay(&self) -> Option<Duration> {
        None
    }
}

/// Provider configuration, opaque to everything but the key resolver.
///
/// Only the fields that affect remote routing participate in key
/// derivation; `label` and anything a caller stores elsewhere do not.
#[derive(Debug, Clone, Default)]
pub struct CallerConfig {
    /// Upstream endpoint URL.
    pub endpoint: Option<String>,
    /// Credential. Never embedded in keys, metrics, or events.
    pub api_key: Option<String>,
    /// Model selector, e.g. `"gpt-4o"`.
    pub model: Option<String>,
    /// Deployment selector for gateway-style providers.
    pub deployment: Option<String>,
    /// Free-form display label.
    pub label: Option<String>,
}

/// Per-invocation context handed to the caller.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Correlation id for this request.
    pub request_id: RequestId,
    /// Rate-limit bucket the request is scheduled under.
    pub key: RateLimitKey,
    /// 1-indexed attempt number; greater than one on retries.
    pub attempt: usize,
}

/// Options threaded into every invocation.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Cooperative cancel token. Checked before admission, before each
    /// invocation and before each backoff sleep; callers propagate it into
    /// their transport.
    pub cancel: CancellationToken,
    /// Wall-clock cap for a single invocation. Expiry fails this request
    /// only; the run continues.
    pub timeout: Option<Duration>,
}

/// Token accounting reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub prompt: u64,
    /// Tokens in the completion.
    pub completion: u64,
    /// Total billed tokens.
    pub total: u64,
}

/// A non-thrown provider return: either `output` or `error` is set.
#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    /// Model output on success.
    pub output: Option<serde_json::Value>,
    /// Modeled error message, e.g. a quota or content-policy refusal.
    pub error: Option<String>,
    /// Token accounting, when the provider reports it.
    pub token_usage: Option<TokenUsage>,
    /// Provider-side session continuation id.
    pub session_id: Option<String>,
    /// True when served from a cache; cached responses skip pacing delays.
    pub cached: bool,
    /// Response headers, used for rate-limit learning.
    pub headers: Option<HashMap<String, String>>,
}

impl ProviderResponse {
    /// Successful response carrying `output`.
    pub fn output(output: serde_json::Value) -> Self {
        Self { output: Some(output), ..Self::default() }
    }

    /// Modeled-error response carrying `error`.
    pub fn error(message: impl Into<String>) -> Self {
        Self { error: Some(message.into()), ..Self::default() }
    }

    /// Attach response headers.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Mark the response as served from cache.
    pub fn with_cached(mut self, cached: bool) -> Self {
        self.cached = cached;
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        let headers = self.headers.as_ref()?;
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True when the response violates the exactly-one-of contract by
    /// carrying neither `output` nor `error`.
    pub fn is_malformed(&self) -> bool {
        self.output.is_none() && self.error.is_none()
    }
}

/// A thrown provider failure, the third response shape.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallFailure {
    /// Network-level failure: connection reset, DNS, TLS.
    #[error("transport error: {message}")]
    Transport {
        /// Underlying description.
        message: String,
    },

    /// HTTP-level failure with a status code.
    #[error("HTTP {status}: {message}")]
    Http {
        /// Response status.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },

    /// The per-call timeout elapsed.
    #[error("call timed out after {elapsed_ms}ms (limit {limit_ms}ms)")]
    Timeout {
        /// Time spent before expiry, in milliseconds.
        elapsed_ms: u64,
        /// Configured cap, in milliseconds.
        limit_ms: u64,
    },

    /// The cancel token fired and the caller aborted its transport.
    #[error("call aborted")]
    Aborted,

    /// Anything else the caller could not model.
    #[error("{message}")]
    Other {
        /// Underlying description.
        message: String,
    },
}

impl CallFailure {
    /// True for abort-shaped failures; these unwind as `Cancelled` and are
    /// never reclassified.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// HTTP status, when the failure carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn timeout(elapsed: Duration, limit: Duration) -> Self {
        Self::Timeout {
            elapsed_ms: elapsed.as_millis() as u64,
            limit_ms: limit.as_millis() as u64,
        }
    }
}
