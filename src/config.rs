//! Limiter and registry configuration.
//!
//! Invalid combinations are rejected at construction time with a typed
//! error, never at request time. Environment knobs are applied to registry
//! defaults only; explicit per-execute overrides always win over both.

use std::time::Duration;

use thiserror::Error;

use crate::backoff::BackoffConfig;
use crate::classify::ClassifierOverrides;
use tokio_util::sync::CancellationToken;

/// `MIN_CONCURRENCY`: floor for adaptive shrinking (default 1).
pub const ENV_MIN_CONCURRENCY: &str = "MIN_CONCURRENCY";
/// `DISABLE_ADAPTIVE_SCHEDULER`: a truthy value switches the registry to
/// bypass mode.
pub const ENV_DISABLE_SCHEDULER: &str = "DISABLE_ADAPTIVE_SCHEDULER";
/// `QUEUE_TIMEOUT_MS`: per-request queue wait cap.
pub const ENV_QUEUE_TIMEOUT_MS: &str = "QUEUE_TIMEOUT_MS";

/// Invalid configuration, reported before any request runs.
#[derive(Debug, Clone, Copy, Error, PartialEq)]
pub enum ConfigError {
    /// `max_concurrency` must admit at least one request.
    #[error("max_concurrency must be at least 1")]
    ZeroMaxConcurrency,

    /// The shrink floor cannot exceed the ceiling.
    #[error("min_concurrency {min} exceeds max_concurrency {max}")]
    MinAboveMax {
        /// Configured floor.
        min: usize,
        /// Configured ceiling.
        max: usize,
    },

    /// `shrink_factor` must lie strictly between 0 and 1.
    #[error("shrink_factor must be in (0, 1), got {0}")]
    InvalidShrinkFactor(f64),

    /// Backoff growth below 1 would shrink delays on consecutive failures.
    #[error("backoff multiplier must be at least 1, got {0}")]
    InvalidMultiplier(f64),

    /// At least one attempt is required.
    #[error("max_attempts must be at least 1")]
    ZeroMaxAttempts,

    /// Growing by zero slots would never recover capacity.
    #[error("grow_step must be at least 1")]
    ZeroGrowStep,

    /// The success threshold for growth must be positive.
    #[error("grow_after must be at least 1")]
    ZeroGrowAfter,
}

/// Per-key limiter parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterConfig {
    /// Hard concurrency ceiling.
    pub max_concurrency: usize,
    /// Floor the adaptive controller may shrink to.
    pub min_concurrency: usize,
    /// How long a request may wait for admission before failing.
    pub queue_timeout: Duration,
    /// Optional queue bound; `None` means unbounded.
    pub max_queue_depth: Option<usize>,
    /// Total attempts per request, including the first.
    pub max_attempts: usize,
    /// Retry delay schedule.
    pub backoff: BackoffConfig,
    /// Multiplicative decrease applied to the concurrency limit on a
    /// rate-limit hit.
    pub shrink_factor: f64,
    /// Additive increase applied after sustained success.
    pub grow_step: usize,
    /// Consecutive successes required before growing.
    pub grow_after: u64,
    /// Minimum quiet period after a rate-limit hit before growth resumes.
    pub cooldown: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            min_concurrency: 1,
            queue_timeout: Duration::from_secs(300),
            max_queue_depth: None,
            max_attempts: 10,
            backoff: BackoffConfig::default(),
            shrink_factor: 0.5,
            grow_step: 1,
            grow_after: 20,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl LimiterConfig {
    /// Check every bound the admission and adaptive logic relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::ZeroMaxConcurrency);
        }
        if self.min_concurrency > self.max_concurrency {
            return Err(ConfigError::MinAboveMax {
                min: self.min_concurrency,
                max: self.max_concurrency,
            });
        }
        if !(self.shrink_factor > 0.0 && self.shrink_factor < 1.0) {
            return Err(ConfigError::InvalidShrinkFactor(self.shrink_factor));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier(self.backoff.multiplier));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroMaxAttempts);
        }
        if self.grow_step == 0 {
            return Err(ConfigError::ZeroGrowStep);
        }
        if self.grow_after == 0 {
            return Err(ConfigError::ZeroGrowAfter);
        }
        Ok(())
    }
}

/// Field-wise overrides merged over registry defaults when a limiter is
/// first created for a key.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override for [`LimiterConfig::max_concurrency`].
    pub max_concurrency: Option<usize>,
    /// Override for [`LimiterConfig::min_concurrency`].
    pub min_concurrency: Option<usize>,
    /// Override for [`LimiterConfig::queue_timeout`].
    pub queue_timeout: Option<Duration>,
    /// Override for [`LimiterConfig::max_queue_depth`].
    pub max_queue_depth: Option<usize>,
    /// Override for [`LimiterConfig::max_attempts`].
    pub max_attempts: Option<usize>,
    /// Override for [`LimiterConfig::backoff`].
    pub backoff: Option<BackoffConfig>,
    /// Override for [`LimiterConfig::shrink_factor`].
    pub shrink_factor: Option<f64>,
    /// Override for [`LimiterConfig::grow_step`].
    pub grow_step: Option<usize>,
    /// Override for [`LimiterConfig::grow_after`].
    pub grow_after: Option<u64>,
    /// Override for [`LimiterConfig::cooldown`].
    pub cooldown: Option<Duration>,
}

impl ConfigOverrides {
    /// True when no field is overridden.
    pub fn is_empty(&self) -> bool {
        self.max_concurrency.is_none()
            && self.min_concurrency.is_none()
            && self.queue_timeout.is_none()
            && self.max_queue_depth.is_none()
            && self.max_attempts.is_none()
            && self.backoff.is_none()
            && self.shrink_factor.is_none()
            && self.grow_step.is_none()
            && self.grow_after.is_none()
            && self.cooldown.is_none()
    }

    /// Merge these overrides over `base`.
    pub fn apply(&self, base: &LimiterConfig) -> LimiterConfig {
        LimiterConfig {
            max_concurrency: self.max_concurrency.unwrap_or(base.max_concurrency),
            min_concurrency: self.min_concurrency.unwrap_or(base.min_concurrency),
            queue_timeout: self.queue_timeout.unwrap_or(base.queue_timeout),
            max_queue_depth: self.max_queue_depth.or(base.max_queue_depth),
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            backoff: self.backoff.unwrap_or(base.backoff),
            shrink_factor: self.shrink_factor.unwrap_or(base.shrink_factor),
            grow_step: self.grow_step.unwrap_or(base.grow_step),
            grow_after: self.grow_after.unwrap_or(base.grow_after),
            cooldown: self.cooldown.unwrap_or(base.cooldown),
        }
    }
}

/// Per-execute options.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Limiter overrides; consulted only when this call is the first for its
    /// key and therefore constructs the limiter.
    pub config: ConfigOverrides,
    /// Caller-supplied classification hooks.
    pub classifier: ClassifierOverrides,
    /// Cooperative cancel token for the whole request, including queue wait
    /// and backoff sleeps.
    pub cancel: CancellationToken,
    /// Per-call timeout; expiry fails this request only.
    pub timeout: Option<Duration>,
}

/// Registry-wide defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryDefaults {
    /// Template for newly created limiters.
    pub limiter: LimiterConfig,
    /// When false, `execute` bypasses scheduling entirely.
    pub scheduler_enabled: bool,
}

impl Default for RegistryDefaults {
    fn default() -> Self {
        Self { limiter: LimiterConfig::default(), scheduler_enabled: true }
    }
}

impl RegistryDefaults {
    /// Built-in defaults with environment knobs applied.
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    /// Apply `MIN_CONCURRENCY`, `DISABLE_ADAPTIVE_SCHEDULER` and
    /// `QUEUE_TIMEOUT_MS` over these defaults. Unparsable values are ignored
    /// with a warning.
    pub fn apply_env(mut self) -> Self {
        if let Some(value) = read_env(ENV_MIN_CONCURRENCY) {
            match value.parse::<usize>() {
                Ok(min) if min >= 1 => self.limiter.min_concurrency = min,
                _ => tracing::warn!(%value, "ignoring unparsable MIN_CONCURRENCY"),
            }
        }
        if let Some(value) = read_env(ENV_QUEUE_TIMEOUT_MS) {
            match value.parse::<u64>() {
                Ok(ms) => self.limiter.queue_timeout = Duration::from_millis(ms),
                Err(_) => tracing::warn!(%value, "ignoring unparsable QUEUE_TIMEOUT_MS"),
            }
        }
        if let Some(value) = read_env(ENV_DISABLE_SCHEDULER) {
            if is_truthy(&value) {
                self.scheduler_enabled = false;
            }
        }
        self
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
