#![forbid(unsafe_code)]

//! # Ratewarden
//!
//! Adaptive per-provider rate limiting for concurrent API clients: admission
//! control, retry with backoff, and runtime limit learning.
//!
//! ## What it does
//!
//! - **Per-provider buckets**: callers sharing an endpoint and credential
//!   collapse onto one [`RateLimitKey`]; others are fully isolated.
//! - **Admission control**: up to `current_concurrency` requests run at a
//!   time per bucket; the rest wait in a FIFO queue with a timeout.
//! - **Retries** with capped exponential backoff and jitter; provider
//!   `Retry-After` hints replace the computed delay.
//! - **Adaptive concurrency**: multiplicative shrink on rate-limit hits,
//!   additive growth after sustained success, clamped to
//!   `[min_concurrency, max_concurrency]`.
//! - **Limit learning**: request/token quotas observed in response headers
//!   are recorded and near-exhaustion warnings emitted.
//! - **Cooperative cancellation**: a fired [`CancellationToken`] unwinds
//!   through queueing, invocation and backoff as [`LimiterError::Cancelled`],
//!   never reclassified, so partial evaluation results stay usable.
//!
//! ## Quick start
//!
//! ```rust
//! use async_trait::async_trait;
//! use ratewarden::{
//!     CallContext, CallFailure, CallOptions, Caller, CallerConfig, ExecuteOptions,
//!     LimiterRegistry, ProviderResponse,
//! };
//!
//! struct Echo {
//!     config: CallerConfig,
//! }
//!
//! #[async_trait]
//! impl Caller for Echo {
//!     fn id(&self) -> &str {
//!         "echo"
//!     }
//!
//!     fn config(&self) -> &CallerConfig {
//!         &self.config
//!     }
//!
//!     async fn call(
//!         &self,
//!         body: &serde_json::Value,
//!         _ctx: &CallContext,
//!         _opts: &CallOptions,
//!     ) -> Result<ProviderResponse, CallFailure> {
//!         Ok(ProviderResponse::output(body.clone()))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ratewarden::LimiterError> {
//!     let registry = LimiterRegistry::builder().env().build().expect("valid defaults");
//!     let caller = Echo { config: CallerConfig::default() };
//!
//!     let response = registry
//!         .execute(&caller, &serde_json::json!("hello"), &ExecuteOptions::default())
//!         .await?;
//!     assert!(response.output.is_some());
//!
//!     registry.dispose().await;
//!     Ok(())
//! }
//! ```
//!
//! Subscribe to [`LimiterRegistry::subscribe`] for the typed event stream
//! (request lifecycle, concurrency changes, quota warnings) and read
//! [`LimiterRegistry::metrics`] for per-bucket snapshots.

mod backoff;
mod caller;
mod classify;
mod config;
mod error;
mod events;
mod key;
mod limiter;
mod metrics;
mod registry;
mod sinks;
mod time;

// Re-exports
pub use backoff::BackoffConfig;
pub use caller::{
    CallContext, CallFailure, CallOptions, Caller, CallerConfig, ProviderResponse, TokenUsage,
};
pub use classify::{parse_retry_after, Classifier, ClassifierOverrides, Outcome, QuotaReading};
pub use config::{
    ConfigError, ConfigOverrides, ExecuteOptions, LimiterConfig, RegistryDefaults,
    ENV_DISABLE_SCHEDULER, ENV_MIN_CONCURRENCY, ENV_QUEUE_TIMEOUT_MS,
};
pub use error::LimiterError;
pub use events::{
    event_to_json, ConcurrencyEvent, ConcurrencyReason, EventKind, RateLimitEvent, RequestEvent,
    RetryReason, SchedulerEvent,
};
pub use key::{resolve_key, RateLimitKey, RequestId};
pub use limiter::ProviderLimiter;
pub use metrics::{LatencyStats, MetricsSnapshot};
pub use registry::{LimiterRegistry, LimiterRegistryBuilder};
pub use sinks::{
    emit_best_effort, pump, EventBus, EventSink, LogSink, MemorySink, NullSink,
    DEFAULT_BUS_CAPACITY,
};
pub use time::{Clock, ManualTime, MonotonicClock, Sleeper, TokioSleeper};

// The cancel token type callers plumb through `ExecuteOptions`.
pub use tokio_util::sync::CancellationToken;

pub mod prelude;
