//! Convenient re-exports for common ratewarden types.
pub use crate::{
    backoff::BackoffConfig,
    caller::{CallContext, CallFailure, CallOptions, Caller, CallerConfig, ProviderResponse},
    classify::{Classifier, ClassifierOverrides, Outcome},
    config::{ConfigOverrides, ExecuteOptions, LimiterConfig, RegistryDefaults},
    events::{EventKind, SchedulerEvent},
    key::{resolve_key, RateLimitKey, RequestId},
    metrics::MetricsSnapshot,
    sinks::{EventBus, LogSink, MemorySink, NullSink},
    CancellationToken, LimiterError, LimiterRegistry, ProviderLimiter,
};
