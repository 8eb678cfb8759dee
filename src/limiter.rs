//! Per-key scheduler state: admission, retry, adaptive concurrency and
//! metrics for one upstream rate-limit bucket.
//!
//! One `ProviderLimiter` exists per rate-limit key. It admits up to
//! `current_concurrency` requests at a time, parks the rest in a FIFO queue
//! with a per-request timeout, retries rate-limited and transient failures
//! with capped exponential backoff, shrinks its concurrency limit
//! multiplicatively on rate-limit hits and grows it additively after
//! sustained success.
//!
//! Locking: all mutable state lives behind one short-lived mutex. The lock is
//! never held across a caller invocation, a sleep, or event delivery; events
//! are prepared inside the critical region and published after it is
//! released.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{oneshot, Notify};

use crate::caller::{CallContext, CallFailure, CallOptions, Caller, ProviderResponse};
use crate::classify::{Classifier, Outcome, QuotaReading};
use crate::config::{ConfigError, ExecuteOptions, LimiterConfig};
use crate::error::LimiterError;
use crate::events::{
    ConcurrencyEvent, ConcurrencyReason, EventKind, RateLimitEvent, RequestEvent, RetryReason,
    SchedulerEvent,
};
use crate::key::{RateLimitKey, RequestId};
use crate::metrics::{Counters, LatencyRing, MetricsSnapshot};
use crate::sinks::EventBus;
use crate::time::{Clock, MonotonicClock, Sleeper, TokioSleeper};

/// Remaining/limit ratio below which `ratelimit:warning` fires.
const QUOTA_WARNING_RATIO: f64 = 0.1;

/// What an admission waiter eventually hears.
enum Admission {
    Granted,
    Disposed,
}

/// A request parked in the FIFO queue.
struct Waiter {
    request_id: RequestId,
    admit: oneshot::Sender<Admission>,
}

/// State mutated only inside the critical region.
struct Inner {
    in_flight: HashSet<RequestId>,
    queue: VecDeque<Waiter>,
    consecutive_successes: u64,
    last_rate_limit_at: Option<u64>,
    last_seen_request_limit: Option<u64>,
    last_seen_token_limit: Option<u64>,
    learned_request_limit: Option<u64>,
    learned_token_limit: Option<u64>,
    learned_pairs: HashSet<(Option<u64>, Option<u64>)>,
    quota_warned: bool,
}

/// Adaptive rate-limit scheduler for a single provider bucket.
pub struct ProviderLimiter {
    key: RateLimitKey,
    config: LimiterConfig,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    current_concurrency: AtomicUsize,
    disposed: AtomicBool,
    counters: Counters,
    inner: Mutex<Inner>,
    latency: Mutex<LatencyRing>,
    rng: Mutex<StdRng>,
    drained: Notify,
}

impl std::fmt::Debug for ProviderLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderLimiter")
            .field("key", &self.key)
            .field("current_concurrency", &self.current_concurrency.load(Ordering::Relaxed))
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

impl ProviderLimiter {
    /// Limiter for `key` publishing to `bus`. Starts at full concurrency.
    pub fn new(key: RateLimitKey, config: LimiterConfig, bus: EventBus) -> Result<Self, ConfigError> {
        config.validate()?;
        let start = config.max_concurrency;
        Ok(Self {
            key,
            config,
            bus,
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            current_concurrency: AtomicUsize::new(start),
            disposed: AtomicBool::new(false),
            counters: Counters::default(),
            inner: Mutex::new(Inner {
                in_flight: HashSet::new(),
                queue: VecDeque::new(),
                consecutive_successes: 0,
                last_rate_limit_at: None,
                last_seen_request_limit: None,
                last_seen_token_limit: None,
                learned_request_limit: None,
                learned_token_limit: None,
                learned_pairs: HashSet::new(),
                quota_warned: false,
            }),
            latency: Mutex::new(LatencyRing::new()),
            rng: Mutex::new(StdRng::from_os_rng()),
            drained: Notify::new(),
        })
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the sleeper (deterministic tests).
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Seed the jitter RNG (reproducible retry schedules).
    pub fn with_rng_seed(self, seed: u64) -> Self {
        *self.lock_rng() = StdRng::seed_from_u64(seed);
        self
    }

    /// The bucket this limiter schedules.
    pub fn key(&self) -> &RateLimitKey {
        &self.key
    }

    /// Live adaptive concurrency limit.
    pub fn current_concurrency(&self) -> usize {
        self.current_concurrency.load(Ordering::Acquire)
    }

    /// Requests currently waiting for admission.
    pub fn queue_depth(&self) -> usize {
        Counters::get(&self.counters.queued) as usize
    }

    /// Run one request under admission control and retry policy.
    pub async fn execute(
        &self,
        request_id: RequestId,
        caller: &dyn Caller,
        body: &serde_json::Value,
        opts: &ExecuteOptions,
    ) -> Result<ProviderResponse, LimiterError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(LimiterError::Disposed);
        }

        Counters::incr(&self.counters.total);
        self.publish(EventKind::Request(RequestEvent::Started { request_id: request_id.clone() }));

        if opts.cancel.is_cancelled() {
            return self.finish_failed(&request_id, LimiterError::Cancelled);
        }

        if let Err(err) = self.acquire_slot(&request_id, opts).await {
            return self.finish_failed(&request_id, err);
        }

        let outcome = self.run_attempts(&request_id, caller, body, opts).await;
        self.release_slot(&request_id);

        match outcome {
            Ok(response) => Ok(response),
            Err(err) => self.finish_failed(&request_id, err),
        }
    }

    /// Non-blocking point-in-time view of this limiter.
    pub fn metrics(&self) -> MetricsSnapshot {
        let latency = self.lock_latency().stats();
        MetricsSnapshot {
            key: self.key.clone(),
            active_requests: Counters::get(&self.counters.active),
            max_concurrency: self.config.max_concurrency,
            current_concurrency: self.current_concurrency(),
            queue_depth: Counters::get(&self.counters.queued),
            total_requests: Counters::get(&self.counters.total),
            completed_requests: Counters::get(&self.counters.completed),
            failed_requests: Counters::get(&self.counters.failed),
            rate_limit_hits: Counters::get(&self.counters.rate_limit_hits),
            retried_requests: Counters::get(&self.counters.retried),
            avg_latency_ms: latency.avg_ms,
            p50_latency_ms: latency.p50_ms,
            p99_latency_ms: latency.p99_ms,
        }
    }

    /// Tear down: reject queued requests, fail future `execute` calls, and
    /// wait for in-flight work to drain. Idempotent; repeat calls also wait
    /// for the drain.
    pub async fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            let waiters: Vec<Waiter> = {
                let mut inner = self.lock_inner();
                inner.queue.drain(..).collect()
            };
            for waiter in waiters {
                Counters::decr_gauge(&self.counters.queued);
                let _ = waiter.admit.send(Admission::Disposed);
            }
            tracing::debug!(key = %self.key, "limiter disposed");
        }

        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lock_inner().in_flight.is_empty() {
                return;
            }
            notified.await;
        }
    }

    // ── admission ────────────────────────────────────────────────────────

    async fn acquire_slot(
        &self,
        request_id: &RequestId,
        opts: &ExecuteOptions,
    ) -> Result<(), LimiterError> {
        let mut wait_rx = {
            let mut inner = self.lock_inner();
            if self.disposed.load(Ordering::Acquire) {
                return Err(LimiterError::Disposed);
            }
            // Newcomers go behind existing waiters even when a slot is free
            // (possible transiently after a shrink): admission stays FIFO.
            if inner.queue.is_empty()
                && inner.in_flight.len() < self.current_concurrency.load(Ordering::Acquire)
            {
                inner.in_flight.insert(request_id.clone());
                Counters::incr(&self.counters.active);
                return Ok(());
            }
            if let Some(max) = self.config.max_queue_depth {
                if inner.queue.len() >= max {
                    return Err(LimiterError::QueueOverflow { depth: inner.queue.len(), max });
                }
            }
            let (admit, wait_rx) = oneshot::channel();
            inner.queue.push_back(Waiter { request_id: request_id.clone(), admit });
            Counters::incr(&self.counters.queued);
            wait_rx
        };

        enum Wait {
            Admission(Result<Admission, oneshot::error::RecvError>),
            Cancelled,
            TimedOut,
        }

        let enqueued_at = self.clock.now_millis();
        let wait = tokio::select! {
            admission = &mut wait_rx => Wait::Admission(admission),
            _ = opts.cancel.cancelled() => Wait::Cancelled,
            _ = self.sleeper.sleep(self.config.queue_timeout) => Wait::TimedOut,
        };
        match wait {
            Wait::Admission(admission) => Self::admission_result(admission),
            Wait::Cancelled => {
                self.abandon_wait(request_id, wait_rx, LimiterError::Cancelled).await
            }
            Wait::TimedOut => {
                let waited =
                    Duration::from_millis(self.clock.now_millis().saturating_sub(enqueued_at));
                let err = LimiterError::queue_timeout(waited, self.config.queue_timeout);
                self.abandon_wait(request_id, wait_rx, err).await
            }
        }
    }

    fn admission_result(
        admission: Result<Admission, oneshot::error::RecvError>,
    ) -> Result<(), LimiterError> {
        match admission {
            Ok(Admission::Granted) => Ok(()),
            Ok(Admission::Disposed) | Err(_) => Err(LimiterError::Disposed),
        }
    }

    /// Leave the queue after a timeout or cancel. If the dispatcher already
    /// popped this waiter the grant is imminent: await it and either keep the
    /// slot (timeout lost the race) or hand it straight back (cancelled).
    async fn abandon_wait(
        &self,
        request_id: &RequestId,
        mut wait_rx: oneshot::Receiver<Admission>,
        err: LimiterError,
    ) -> Result<(), LimiterError> {
        let removed = {
            let mut inner = self.lock_inner();
            let before = inner.queue.len();
            inner.queue.retain(|waiter| &waiter.request_id != request_id);
            before != inner.queue.len()
        };
        if removed {
            Counters::decr_gauge(&self.counters.queued);
            return Err(err);
        }

        match (&mut wait_rx).await {
            Ok(Admission::Granted) => {
                if err.is_cancelled() {
                    self.release_slot(request_id);
                    Err(LimiterError::Cancelled)
                } else {
                    Ok(())
                }
            }
            Ok(Admission::Disposed) | Err(_) => Err(LimiterError::Disposed),
        }
    }

    fn release_slot(&self, request_id: &RequestId) {
        {
            let mut inner = self.lock_inner();
            if inner.in_flight.remove(request_id) {
                Counters::decr_gauge(&self.counters.active);
            }
        }
        self.dispatch_queue();
        self.drained.notify_waiters();
    }

    /// Admit queue heads while capacity allows. After a shrink this is a
    /// no-op until enough in-flight work drains.
    fn dispatch_queue(&self) {
        loop {
            let waiter = {
                let mut inner = self.lock_inner();
                if self.disposed.load(Ordering::Acquire) {
                    return;
                }
                if inner.in_flight.len() >= self.current_concurrency.load(Ordering::Acquire) {
                    return;
                }
                match inner.queue.pop_front() {
                    Some(waiter) => {
                        inner.in_flight.insert(waiter.request_id.clone());
                        Counters::decr_gauge(&self.counters.queued);
                        Counters::incr(&self.counters.active);
                        waiter
                    }
                    None => return,
                }
            };
            if waiter.admit.send(Admission::Granted).is_err() {
                // The waiter's future was dropped wholesale; free its slot
                // and keep dispatching.
                let mut inner = self.lock_inner();
                if inner.in_flight.remove(&waiter.request_id) {
                    Counters::decr_gauge(&self.counters.active);
                }
            }
        }
    }

    // ── invocation and retry ─────────────────────────────────────────────

    async fn run_attempts(
        &self,
        request_id: &RequestId,
        caller: &dyn Caller,
        body: &serde_json::Value,
        opts: &ExecuteOptions,
    ) -> Result<ProviderResponse, LimiterError> {
        let classifier = Classifier::new(opts.classifier.clone());
        let call_opts = CallOptions { cancel: opts.cancel.clone(), timeout: opts.timeout };

        for attempt in 1..=self.config.max_attempts {
            if opts.cancel.is_cancelled() {
                return Err(LimiterError::Cancelled);
            }

            let ctx = CallContext {
                request_id: request_id.clone(),
                key: self.key.clone(),
                attempt,
            };
            let started = self.clock.now_millis();
            let result = self.invoke(caller, body, &ctx, &call_opts).await;
            let latency = Duration::from_millis(self.clock.now_millis().saturating_sub(started));

            if let Ok(response) = &result {
                for event in self.observe_quota(response) {
                    self.publish(event);
                }
            }

            match classifier.classify(result) {
                Outcome::Success(response) => {
                    for event in self.note_success(latency) {
                        self.publish(event);
                    }
                    self.publish(EventKind::Request(RequestEvent::Completed {
                        request_id: request_id.clone(),
                        latency,
                    }));
                    if !response.cached {
                        if let Some(delay) = caller.delay() {
                            self.sleeper.sleep(delay).await;
                        }
                    }
                    return Ok(response);
                }
                Outcome::Cancelled => return Err(LimiterError::Cancelled),
                Outcome::Malformed => return Err(LimiterError::MalformedResponse),
                Outcome::Fatal { message } => {
                    return Err(LimiterError::Caller { attempts: attempt, message });
                }
                Outcome::RateLimited { retry_after } => {
                    for event in self.note_rate_limit(request_id, retry_after) {
                        self.publish(event);
                    }
                    if attempt == self.config.max_attempts {
                        return Err(LimiterError::Caller {
                            attempts: attempt,
                            message: "rate limited by provider".to_string(),
                        });
                    }
                    let delay = match retry_after {
                        Some(advertised) => self.config.backoff.clamp(advertised),
                        None => self.next_backoff(attempt),
                    };
                    self.retry_sleep(request_id, attempt, delay, RetryReason::RateLimited, opts)
                        .await?;
                }
                Outcome::Retryable { message } => {
                    if attempt == self.config.max_attempts {
                        return Err(LimiterError::Caller { attempts: attempt, message });
                    }
                    let delay = self.next_backoff(attempt);
                    self.retry_sleep(request_id, attempt, delay, RetryReason::Transient, opts)
                        .await?;
                }
            }
        }
        unreachable!("retry loop returns within max_attempts")
    }

    async fn invoke(
        &self,
        caller: &dyn Caller,
        body: &serde_json::Value,
        ctx: &CallContext,
        call_opts: &CallOptions,
    ) -> Result<ProviderResponse, CallFailure> {
        match call_opts.timeout {
            Some(limit) => {
                let started = self.clock.now_millis();
                match tokio::time::timeout(limit, caller.call(body, ctx, call_opts)).await {
                    Ok(result) => result,
                    Err(_) => {
                        let elapsed = Duration::from_millis(
                            self.clock.now_millis().saturating_sub(started),
                        );
                        Err(CallFailure::timeout(elapsed.max(limit), limit))
                    }
                }
            }
            None => caller.call(body, ctx, call_opts).await,
        }
    }

    async fn retry_sleep(
        &self,
        request_id: &RequestId,
        attempt: usize,
        delay: Duration,
        reason: RetryReason,
        opts: &ExecuteOptions,
    ) -> Result<(), LimiterError> {
        Counters::incr(&self.counters.retried);
        self.publish(EventKind::Request(RequestEvent::Retrying {
            request_id: request_id.clone(),
            attempt,
            delay,
            reason,
        }));
        tokio::select! {
            _ = opts.cancel.cancelled() => Err(LimiterError::Cancelled),
            _ = self.sleeper.sleep(delay) => Ok(()),
        }
    }

    fn next_backoff(&self, attempt: usize) -> Duration {
        let mut rng = self.lock_rng();
        self.config.backoff.delay(attempt, &mut *rng)
    }

    // ── adaptive concurrency and learning ────────────────────────────────

    fn note_success(&self, latency: Duration) -> Vec<EventKind> {
        Counters::incr(&self.counters.completed);
        self.lock_latency().record(latency.as_millis() as u64);

        let mut events = Vec::new();
        let mut inner = self.lock_inner();
        inner.consecutive_successes += 1;
        if inner.consecutive_successes >= self.config.grow_after {
            let now = self.clock.now_millis();
            let cooled = match inner.last_rate_limit_at {
                Some(at) => now.saturating_sub(at) >= self.config.cooldown.as_millis() as u64,
                None => true,
            };
            if cooled {
                inner.consecutive_successes = 0;
                let current = self.current_concurrency.load(Ordering::Acquire);
                if current < self.config.max_concurrency {
                    let next =
                        (current + self.config.grow_step).min(self.config.max_concurrency);
                    self.current_concurrency.store(next, Ordering::Release);
                    tracing::info!(
                        key = %self.key,
                        previous = current,
                        current = next,
                        "concurrency increased after sustained success"
                    );
                    events.push(EventKind::Concurrency(ConcurrencyEvent::Increased {
                        previous: current,
                        current: next,
                        reason: ConcurrencyReason::Recovery,
                    }));
                }
            }
        }
        drop(inner);

        // Growth may have opened capacity for parked waiters.
        if !events.is_empty() {
            self.dispatch_queue();
        }
        events
    }

    fn note_rate_limit(
        &self,
        request_id: &RequestId,
        retry_after: Option<Duration>,
    ) -> Vec<EventKind> {
        Counters::incr(&self.counters.rate_limit_hits);

        let mut events = vec![EventKind::RateLimit(RateLimitEvent::Hit {
            request_id: request_id.clone(),
            retry_after,
        })];

        let mut inner = self.lock_inner();
        inner.consecutive_successes = 0;
        inner.last_rate_limit_at = Some(self.clock.now_millis());

        let current = self.current_concurrency.load(Ordering::Acquire);
        let shrunk = ((current as f64) * self.config.shrink_factor).floor() as usize;
        let next = shrunk.max(self.config.min_concurrency);
        if next < current {
            self.current_concurrency.store(next, Ordering::Release);
            tracing::warn!(
                key = %self.key,
                previous = current,
                current = next,
                "concurrency reduced after rate limit"
            );
            events.push(EventKind::Concurrency(ConcurrencyEvent::Decreased {
                previous: current,
                current: next,
                reason: ConcurrencyReason::RateLimit,
            }));
        }

        let pair = (inner.last_seen_request_limit, inner.last_seen_token_limit);
        if pair != (None, None) && !inner.learned_pairs.contains(&pair) {
            inner.learned_pairs.insert(pair);
            inner.learned_request_limit = pair.0;
            inner.learned_token_limit = pair.1;
            events.push(EventKind::RateLimit(RateLimitEvent::Learned {
                request_limit: pair.0,
                token_limit: pair.1,
            }));
        }
        events
    }

    fn observe_quota(&self, response: &ProviderResponse) -> Vec<EventKind> {
        let Some(reading) = QuotaReading::from_response(response) else {
            return Vec::new();
        };

        let mut events = Vec::new();
        let mut inner = self.lock_inner();
        if reading.request_limit.is_some() {
            inner.last_seen_request_limit = reading.request_limit;
        }
        if reading.token_limit.is_some() {
            inner.last_seen_token_limit = reading.token_limit;
        }

        let request_ratio = reading.request_ratio();
        let token_ratio = reading.token_ratio();
        let near_exhaustion = request_ratio.is_some_and(|r| r < QUOTA_WARNING_RATIO)
            || token_ratio.is_some_and(|r| r < QUOTA_WARNING_RATIO);

        // Warn on the downward crossing only; re-arm once the quota recovers.
        if near_exhaustion && !inner.quota_warned {
            inner.quota_warned = true;
            events.push(EventKind::RateLimit(RateLimitEvent::Warning {
                request_ratio,
                token_ratio,
            }));
        } else if !near_exhaustion && (request_ratio.is_some() || token_ratio.is_some()) {
            inner.quota_warned = false;
        }
        events
    }

    /// Learned request/token quota, when a rate-limit hit has recorded one.
    pub fn learned_limits(&self) -> (Option<u64>, Option<u64>) {
        let inner = self.lock_inner();
        (inner.learned_request_limit, inner.learned_token_limit)
    }

    // ── plumbing ─────────────────────────────────────────────────────────

    fn finish_failed(
        &self,
        request_id: &RequestId,
        err: LimiterError,
    ) -> Result<ProviderResponse, LimiterError> {
        Counters::incr(&self.counters.failed);
        self.publish(EventKind::Request(RequestEvent::Failed {
            request_id: request_id.clone(),
            error: format!("{}: {}", err.category(), err),
        }));
        Err(err)
    }

    fn publish(&self, kind: EventKind) {
        self.bus.publish(SchedulerEvent::new(self.key.clone(), kind));
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_latency(&self) -> MutexGuard<'_, LatencyRing> {
        self.latency.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
