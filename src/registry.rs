//! Process-wide registry of per-key limiters.
//!
//! The registry resolves each caller to its rate-limit key, lazily creates
//! the limiter for keys it has not seen, and reuses it for every subsequent
//! call. Limiters never serialize traffic across keys: the map lock is held
//! only for lookup and first-sight insertion, never across a request.
//!
//! There is deliberately no global instance. The owning runtime constructs
//! one registry and passes it to the subsystems that need it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;

use crate::caller::{CallContext, CallFailure, CallOptions, Caller, ProviderResponse};
use crate::config::{ConfigError, ExecuteOptions, LimiterConfig, RegistryDefaults};
use crate::error::LimiterError;
use crate::events::SchedulerEvent;
use crate::key::{resolve_key, RateLimitKey, RequestId};
use crate::limiter::ProviderLimiter;
use crate::metrics::MetricsSnapshot;
use crate::sinks::{EventBus, DEFAULT_BUS_CAPACITY};
use crate::time::{Clock, MonotonicClock, Sleeper, TokioSleeper};

/// Registry of adaptive limiters, one per rate-limit key.
pub struct LimiterRegistry {
    defaults: RegistryDefaults,
    states: RwLock<HashMap<RateLimitKey, Arc<ProviderLimiter>>>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    rng_seed: Option<u64>,
    next_seq: AtomicU64,
    disposed: AtomicBool,
}

impl std::fmt::Debug for LimiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterRegistry")
            .field("keys", &self.read_states().len())
            .field("scheduler_enabled", &self.defaults.scheduler_enabled)
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

impl LimiterRegistry {
    /// Registry with built-in defaults.
    pub fn new() -> Self {
        LimiterRegistryBuilder::new().build().expect("built-in defaults validate")
    }

    /// Start configuring a registry.
    pub fn builder() -> LimiterRegistryBuilder {
        LimiterRegistryBuilder::new()
    }

    /// Schedule one request for `caller` under its rate-limit key.
    ///
    /// With the scheduler disabled (config or `DISABLE_ADAPTIVE_SCHEDULER`)
    /// the call goes straight through: no limiter is created, no events fire
    /// and no metrics accumulate.
    pub async fn execute(
        &self,
        caller: &dyn Caller,
        body: &serde_json::Value,
        opts: &ExecuteOptions,
    ) -> Result<ProviderResponse, LimiterError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(LimiterError::Disposed);
        }

        let key = resolve_key(caller);
        let request_id = self.mint_request_id(&key);

        if !self.defaults.scheduler_enabled {
            return Self::bypass(caller, body, &key, request_id, opts).await;
        }

        let limiter = self.limiter_for(&key, opts)?;
        limiter.execute(request_id, caller, body, opts).await
    }

    /// Direct invocation without admission control or retries. Abort shapes
    /// still surface as `Cancelled`; everything else maps to a single-attempt
    /// caller error.
    async fn bypass(
        caller: &dyn Caller,
        body: &serde_json::Value,
        key: &RateLimitKey,
        request_id: RequestId,
        opts: &ExecuteOptions,
    ) -> Result<ProviderResponse, LimiterError> {
        let ctx = CallContext { request_id, key: key.clone(), attempt: 1 };
        let call_opts = CallOptions { cancel: opts.cancel.clone(), timeout: opts.timeout };
        match caller.call(body, &ctx, &call_opts).await {
            Ok(response) => Ok(response),
            Err(failure) if failure.is_abort() => Err(LimiterError::Cancelled),
            Err(failure) => {
                Err(LimiterError::Caller { attempts: 1, message: failure.to_string() })
            }
        }
    }

    /// The limiter currently registered for `key`, if any.
    pub fn limiter(&self, key: &RateLimitKey) -> Option<Arc<ProviderLimiter>> {
        self.read_states().get(key).cloned()
    }

    /// Point-in-time metrics for every known key.
    pub fn metrics(&self) -> HashMap<RateLimitKey, MetricsSnapshot> {
        self.read_states()
            .iter()
            .map(|(key, state)| (key.clone(), state.metrics()))
            .collect()
    }

    /// Subscribe to the aggregate event stream of all limiters.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.bus.subscribe()
    }

    /// The shared event bus (drop accounting, extra subscriptions).
    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Dispose every limiter, rejecting queued work and draining in-flight
    /// requests, then forget them. Idempotent.
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        let states: Vec<Arc<ProviderLimiter>> = {
            let mut states = self.write_states();
            states.drain().map(|(_, state)| state).collect()
        };
        for state in states {
            state.dispose().await;
        }
    }

    fn limiter_for(
        &self,
        key: &RateLimitKey,
        opts: &ExecuteOptions,
    ) -> Result<Arc<ProviderLimiter>, ConfigError> {
        if let Some(state) = self.read_states().get(key) {
            return Ok(state.clone());
        }

        // Build outside the write lock; on a lost race the spare is dropped
        // and the winner's limiter is reused.
        let config = opts.config.apply(&self.defaults.limiter);
        let mut limiter = ProviderLimiter::new(key.clone(), config, self.bus.clone())?
            .with_clock(self.clock.clone())
            .with_sleeper(self.sleeper.clone());
        if let Some(seed) = self.rng_seed {
            limiter = limiter.with_rng_seed(seed);
        }

        let mut states = self.write_states();
        let state = states.entry(key.clone()).or_insert_with(|| Arc::new(limiter));
        Ok(state.clone())
    }

    fn mint_request_id(&self, key: &RateLimitKey) -> RequestId {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        RequestId::mint(key, seq, rand::random::<u32>())
    }

    fn read_states(&self) -> RwLockReadGuard<'_, HashMap<RateLimitKey, Arc<ProviderLimiter>>> {
        self.states.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_states(&self) -> RwLockWriteGuard<'_, HashMap<RateLimitKey, Arc<ProviderLimiter>>> {
        self.states.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`LimiterRegistry`].
pub struct LimiterRegistryBuilder {
    defaults: RegistryDefaults,
    bus_capacity: usize,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    rng_seed: Option<u64>,
}

impl LimiterRegistryBuilder {
    fn new() -> Self {
        Self {
            defaults: RegistryDefaults::default(),
            bus_capacity: DEFAULT_BUS_CAPACITY,
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            rng_seed: None,
        }
    }

    /// Replace the whole default set.
    pub fn defaults(mut self, defaults: RegistryDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Template for newly created limiters.
    pub fn limiter_defaults(mut self, limiter: LimiterConfig) -> Self {
        self.defaults.limiter = limiter;
        self
    }

    /// Enable or disable scheduling (bypass mode when disabled).
    pub fn scheduler_enabled(mut self, enabled: bool) -> Self {
        self.defaults.scheduler_enabled = enabled;
        self
    }

    /// Apply `MIN_CONCURRENCY`, `DISABLE_ADAPTIVE_SCHEDULER` and
    /// `QUEUE_TIMEOUT_MS` over the current defaults.
    pub fn env(mut self) -> Self {
        self.defaults = self.defaults.apply_env();
        self
    }

    /// Event bus channel capacity.
    pub fn bus_capacity(mut self, capacity: usize) -> Self {
        self.bus_capacity = capacity;
        self
    }

    /// Override the clock shared by every limiter (deterministic tests).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the sleeper shared by every limiter (deterministic tests).
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Seed for each limiter's jitter RNG (reproducible schedules).
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Validate defaults and build the registry.
    pub fn build(self) -> Result<LimiterRegistry, ConfigError> {
        self.defaults.limiter.validate()?;
        Ok(LimiterRegistry {
            defaults: self.defaults,
            states: RwLock::new(HashMap::new()),
            bus: EventBus::new(self.bus_capacity),
            clock: self.clock,
            sleeper: self.sleeper,
            rng_seed: self.rng_seed,
            next_seq: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caller::CallerConfig;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct EchoCaller {
        id: String,
        config: CallerConfig,
        calls: AtomicUsize,
        fail_with: Option<CallFailure>,
    }

    impl EchoCaller {
        fn new(id: &str, api_key: &str) -> Self {
            Self {
                id: id.to_string(),
                config: CallerConfig {
                    endpoint: Some("https://api.example.com/v1".to_string()),
                    api_key: Some(api_key.to_string()),
                    model: Some("m1".to_string()),
                    ..CallerConfig::default()
                },
                calls: AtomicUsize::new(0),
                fail_with: None,
            }
        }

        fn failing(id: &str, failure: CallFailure) -> Self {
            let mut caller = Self::new(id, "k");
            caller.fail_with = Some(failure);
            caller
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Caller for EchoCaller {
        fn id(&self) -> &str {
            &self.id
        }

        fn config(&self) -> &CallerConfig {
            &self.config
        }

        async fn call(
            &self,
            body: &serde_json::Value,
            _ctx: &CallContext,
            _opts: &CallOptions,
        ) -> Result<ProviderResponse, CallFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(failure) => Err(failure.clone()),
                None => Ok(ProviderResponse::output(body.clone())),
            }
        }
    }

    #[tokio::test]
    async fn same_configuration_reuses_one_limiter() {
        let registry = LimiterRegistry::new();
        let a = EchoCaller::new("openai", "sk-1");
        let b = EchoCaller::new("openai", "sk-1");

        registry.execute(&a, &serde_json::json!("x"), &ExecuteOptions::default()).await.unwrap();
        registry.execute(&b, &serde_json::json!("y"), &ExecuteOptions::default()).await.unwrap();

        let metrics = registry.metrics();
        assert_eq!(metrics.len(), 1);
        let snapshot = metrics.values().next().unwrap();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.completed_requests, 2);
    }

    #[tokio::test]
    async fn distinct_credentials_get_distinct_limiters() {
        let registry = LimiterRegistry::new();
        let a = EchoCaller::new("openai", "sk-1");
        let b = EchoCaller::new("openai", "sk-2");

        registry.execute(&a, &serde_json::json!(1), &ExecuteOptions::default()).await.unwrap();
        registry.execute(&b, &serde_json::json!(2), &ExecuteOptions::default()).await.unwrap();

        assert_eq!(registry.metrics().len(), 2);
    }

    #[tokio::test]
    async fn bypass_mode_creates_no_state_and_forwards_results() {
        let registry =
            LimiterRegistry::builder().scheduler_enabled(false).build().expect("builds");
        let caller = EchoCaller::new("openai", "sk-1");

        let response = registry
            .execute(&caller, &serde_json::json!("direct"), &ExecuteOptions::default())
            .await
            .expect("direct result");
        assert_eq!(response.output, Some(serde_json::json!("direct")));
        assert_eq!(caller.calls(), 1);
        assert!(registry.metrics().is_empty());
    }

    #[tokio::test]
    async fn bypass_mode_still_distinguishes_aborts() {
        let registry =
            LimiterRegistry::builder().scheduler_enabled(false).build().expect("builds");
        let caller = EchoCaller::failing("openai", CallFailure::Aborted);

        let err = registry
            .execute(&caller, &serde_json::Value::Null, &ExecuteOptions::default())
            .await
            .expect_err("abort surfaces");
        assert!(err.is_cancelled());

        let failing = EchoCaller::failing("azure", CallFailure::Http {
            status: 400,
            message: "bad request".into(),
        });
        let err = registry
            .execute(&failing, &serde_json::Value::Null, &ExecuteOptions::default())
            .await
            .expect_err("errors propagate");
        assert!(err.is_caller());
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_rejects_later_calls() {
        let registry = LimiterRegistry::new();
        let caller = EchoCaller::new("openai", "sk-1");
        registry.execute(&caller, &serde_json::json!(1), &ExecuteOptions::default()).await.unwrap();

        registry.dispose().await;
        registry.dispose().await;

        let err = registry
            .execute(&caller, &serde_json::json!(2), &ExecuteOptions::default())
            .await
            .expect_err("disposed");
        assert!(err.is_disposed());
        assert!(registry.metrics().is_empty());
    }

    #[tokio::test]
    async fn execute_overrides_shape_the_limiter_at_first_sight() {
        let registry = LimiterRegistry::new();
        let caller = EchoCaller::new("openai", "sk-1");
        let opts = ExecuteOptions {
            config: crate::config::ConfigOverrides {
                max_concurrency: Some(2),
                ..Default::default()
            },
            ..Default::default()
        };
        registry.execute(&caller, &serde_json::json!(1), &opts).await.unwrap();

        let key = resolve_key(&caller);
        let limiter = registry.limiter(&key).expect("created");
        assert_eq!(limiter.metrics().max_concurrency, 2);

        // Later calls with different overrides reuse the existing limiter.
        let other = ExecuteOptions {
            config: crate::config::ConfigOverrides {
                max_concurrency: Some(9),
                ..Default::default()
            },
            ..Default::default()
        };
        registry.execute(&caller, &serde_json::json!(2), &other).await.unwrap();
        assert_eq!(limiter.metrics().max_concurrency, 2);
    }

    #[tokio::test]
    async fn invalid_overrides_surface_as_config_errors() {
        let registry = LimiterRegistry::new();
        let caller = EchoCaller::new("openai", "sk-1");
        let opts = ExecuteOptions {
            config: crate::config::ConfigOverrides {
                max_concurrency: Some(0),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = registry
            .execute(&caller, &serde_json::Value::Null, &opts)
            .await
            .expect_err("invalid config");
        assert!(matches!(err, LimiterError::Config(_)));
    }

    #[tokio::test]
    async fn request_ids_are_unique_per_registry() {
        let registry = LimiterRegistry::new();
        let key = RateLimitKey::new("openai:api.example.com:0000");
        let a = registry.mint_request_id(&key);
        let b = registry.mint_request_id(&key);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with(key.as_str()));
    }
}
