//! Response and failure classification.
//!
//! Pure decision logic: given what a caller returned (or threw), decide
//! whether the request succeeded, hit a rate limit, deserves a retry, failed
//! for good, or was cancelled. The limiter's retry loop acts on the
//! [`Outcome`]; nothing here sleeps, counts, or emits events.
//!
//! Abort-shaped failures are special-cased first and always map to
//! [`Outcome::Cancelled`]: a fired cancel token must unwind through every
//! layer without being reclassified as a retryable error.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::caller::{CallFailure, ProviderResponse};

/// Classification of a single caller invocation.
#[derive(Debug)]
pub enum Outcome {
    /// Deliver the response to the caller of `execute`.
    Success(ProviderResponse),
    /// Upstream quota exhausted; retry after the advertised or computed delay.
    RateLimited {
        /// Parsed `Retry-After`, when the provider sent one.
        retry_after: Option<Duration>,
    },
    /// Transient failure worth another attempt.
    Retryable {
        /// Underlying description, kept for the terminal error if retries run out.
        message: String,
    },
    /// Non-recoverable failure.
    Fatal {
        /// Underlying description.
        message: String,
    },
    /// The response violated the exactly-one-of `output`/`error` contract.
    Malformed,
    /// The cancel token fired; re-raise, never retry.
    Cancelled,
}

type ResponsePredicate = dyn Fn(&ProviderResponse) -> bool + Send + Sync;
type RetryAfterFn = dyn Fn(&ProviderResponse) -> Option<Duration> + Send + Sync;

/// Caller-supplied hooks that take precedence over the default rules.
#[derive(Clone, Default)]
pub struct ClassifierOverrides {
    /// Detect provider-specific rate limiting the default text/status rules
    /// would miss (e.g. soft throttling reported inside a 200 body).
    pub is_rate_limited: Option<Arc<ResponsePredicate>>,
    /// Extract a provider-specific retry delay.
    pub retry_after: Option<Arc<RetryAfterFn>>,
}

impl fmt::Debug for ClassifierOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassifierOverrides")
            .field("is_rate_limited", &self.is_rate_limited.is_some())
            .field("retry_after", &self.retry_after.is_some())
            .finish()
    }
}

impl ClassifierOverrides {
    /// Install a rate-limit predicate.
    pub fn rate_limited_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ProviderResponse) -> bool + Send + Sync + 'static,
    {
        self.is_rate_limited = Some(Arc::new(predicate));
        self
    }

    /// Install a retry-after extractor.
    pub fn retry_after_from<F>(mut self, extract: F) -> Self
    where
        F: Fn(&ProviderResponse) -> Option<Duration> + Send + Sync + 'static,
    {
        self.retry_after = Some(Arc::new(extract));
        self
    }
}

/// Stateless classifier: default rules plus optional caller overrides.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    overrides: ClassifierOverrides,
}

impl Classifier {
    /// Classifier with caller-supplied overrides.
    pub fn new(overrides: ClassifierOverrides) -> Self {
        Self { overrides }
    }

    /// Classify a caller invocation result.
    pub fn classify(&self, result: Result<ProviderResponse, CallFailure>) -> Outcome {
        match result {
            Ok(response) => self.classify_response(response),
            Err(failure) => Self::classify_failure(failure),
        }
    }

    fn classify_response(&self, response: ProviderResponse) -> Outcome {
        if let Some(is_rate_limited) = &self.overrides.is_rate_limited {
            if is_rate_limited(&response) {
                return Outcome::RateLimited { retry_after: self.retry_after(&response) };
            }
        }

        if response.is_malformed() {
            return Outcome::Malformed;
        }

        match &response.error {
            Some(message) if looks_rate_limited(message) => {
                Outcome::RateLimited { retry_after: self.retry_after(&response) }
            }
            // A modeled error with no status information: nothing signals it
            // is transient, so it is terminal for this request.
            Some(message) => Outcome::Fatal { message: message.clone() },
            None => Outcome::Success(response),
        }
    }

    fn classify_failure(failure: CallFailure) -> Outcome {
        if failure.is_abort() {
            return Outcome::Cancelled;
        }
        match failure {
            CallFailure::Http { status: 429, message } => {
                let retry_after = retry_after_hint(&message);
                Outcome::RateLimited { retry_after }
            }
            CallFailure::Http { status, message } if (500..600).contains(&status) => {
                Outcome::Retryable { message: format!("HTTP {status}: {message}") }
            }
            CallFailure::Http { status, message } => {
                Outcome::Fatal { message: format!("HTTP {status}: {message}") }
            }
            CallFailure::Transport { message } => Outcome::Retryable { message },
            failure @ CallFailure::Timeout { .. } => Outcome::Fatal { message: failure.to_string() },
            CallFailure::Other { message } if looks_rate_limited(&message) => {
                Outcome::RateLimited { retry_after: retry_after_hint(&message) }
            }
            CallFailure::Other { message } => Outcome::Fatal { message },
            CallFailure::Aborted => Outcome::Cancelled,
        }
    }

    fn retry_after(&self, response: &ProviderResponse) -> Option<Duration> {
        if let Some(extract) = &self.overrides.retry_after {
            if let Some(delay) = extract(response) {
                return Some(delay);
            }
        }
        response.header("retry-after").and_then(parse_retry_after)
    }
}

/// Text heuristics for quota exhaustion, applied to modeled error bodies.
fn looks_rate_limited(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("429")
        || lower.contains("rate limit")
        || lower.contains("rate-limit")
        || lower.contains("too many requests")
        || lower.contains("quota")
}

/// `Retry-After` per RFC 9110: delta-seconds first, HTTP-date second.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    match httpdate::parse_http_date(value) {
        Ok(when) => match when.duration_since(SystemTime::now()) {
            Ok(delay) => Some(delay),
            // A date in the past still means "you were limited"; retry now.
            Err(_) => Some(Duration::ZERO),
        },
        Err(_) => None,
    }
}

/// Some providers put `retry after Ns` in the body instead of a header.
fn retry_after_hint(message: &str) -> Option<Duration> {
    let lower = message.to_ascii_lowercase();
    let idx = lower.find("retry after ")?;
    let rest = &lower[idx + "retry after ".len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let seconds = digits.parse::<u64>().ok()?;
    Some(Duration::from_secs(seconds))
}

/// Quota counters extracted from response headers, OpenAI-style
/// `x-ratelimit-*` names with a fallback to the bare pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaReading {
    /// Request quota for the current window.
    pub request_limit: Option<u64>,
    /// Requests remaining in the current window.
    pub request_remaining: Option<u64>,
    /// Token quota for the current window.
    pub token_limit: Option<u64>,
    /// Tokens remaining in the current window.
    pub token_remaining: Option<u64>,
}

impl QuotaReading {
    /// Parse quota headers out of a response. Returns `None` when the
    /// response carries no recognizable quota information.
    pub fn from_response(response: &ProviderResponse) -> Option<Self> {
        let number = |name: &str| response.header(name).and_then(|v| v.trim().parse::<u64>().ok());

        let reading = Self {
            request_limit: number("x-ratelimit-limit-requests").or_else(|| number("x-ratelimit-limit")),
            request_remaining: number("x-ratelimit-remaining-requests")
                .or_else(|| number("x-ratelimit-remaining")),
            token_limit: number("x-ratelimit-limit-tokens"),
            token_remaining: number("x-ratelimit-remaining-tokens"),
        };

        if reading == Self::default() {
            None
        } else {
            Some(reading)
        }
    }

    /// `remaining / limit` for the request quota.
    pub fn request_ratio(&self) -> Option<f64> {
        ratio(self.request_remaining, self.request_limit)
    }

    /// `remaining / limit` for the token quota.
    pub fn token_ratio(&self) -> Option<f64> {
        ratio(self.token_remaining, self.token_limit)
    }
}

fn ratio(remaining: Option<u64>, limit: Option<u64>) -> Option<f64> {
    match (remaining, limit) {
        (Some(remaining), Some(limit)) if limit > 0 => Some(remaining as f64 / limit as f64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn with_headers(pairs: &[(&str, &str)]) -> ProviderResponse {
        let headers: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ProviderResponse::output(serde_json::Value::Null).with_headers(headers)
    }

    #[test]
    fn plain_output_is_success() {
        let outcome = Classifier::default().classify(Ok(ProviderResponse::output(serde_json::json!("ok"))));
        assert!(matches!(outcome, Outcome::Success(_)));
    }

    #[test]
    fn malformed_response_is_flagged() {
        let outcome = Classifier::default().classify(Ok(ProviderResponse::default()));
        assert!(matches!(outcome, Outcome::Malformed));
    }

    #[test]
    fn modeled_rate_limit_text_is_detected() {
        for message in ["Rate limit exceeded", "quota exhausted for project", "HTTP 429", "Too Many Requests"] {
            let outcome = Classifier::default().classify(Ok(ProviderResponse::error(message)));
            assert!(matches!(outcome, Outcome::RateLimited { .. }), "message: {message}");
        }
    }

    #[test]
    fn modeled_error_without_limit_text_is_fatal() {
        let outcome = Classifier::default().classify(Ok(ProviderResponse::error("invalid api key")));
        match outcome {
            Outcome::Fatal { message } => assert_eq!(message, "invalid api key"),
            other => panic!("expected Fatal, got {other:?}"),
        }
    }

    #[test]
    fn thrown_429_is_rate_limited_with_body_hint() {
        let outcome = Classifier::default().classify(Err(CallFailure::Http {
            status: 429,
            message: "slow down, retry after 7s".into(),
        }));
        match outcome {
            Outcome::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn server_errors_and_transport_failures_are_retryable() {
        let classifier = Classifier::default();
        assert!(matches!(
            classifier.classify(Err(CallFailure::Http { status: 503, message: "overloaded".into() })),
            Outcome::Retryable { .. }
        ));
        assert!(matches!(
            classifier.classify(Err(CallFailure::Transport { message: "connection reset".into() })),
            Outcome::Retryable { .. }
        ));
    }

    #[test]
    fn client_errors_and_timeouts_are_fatal() {
        let classifier = Classifier::default();
        assert!(matches!(
            classifier.classify(Err(CallFailure::Http { status: 401, message: "unauthorized".into() })),
            Outcome::Fatal { .. }
        ));
        assert!(matches!(
            classifier.classify(Err(CallFailure::timeout(
                Duration::from_millis(1001),
                Duration::from_millis(1000)
            ))),
            Outcome::Fatal { .. }
        ));
    }

    #[test]
    fn aborts_are_never_reclassified() {
        let outcome = Classifier::default().classify(Err(CallFailure::Aborted));
        assert!(matches!(outcome, Outcome::Cancelled));
    }

    #[test]
    fn retry_after_header_in_seconds() {
        let classifier = Classifier::default();
        let response = {
            let mut r = with_headers(&[("Retry-After", "12")]);
            r.output = None;
            r.error = Some("rate limit".into());
            r
        };
        match classifier.classify(Ok(response)) {
            Outcome::RateLimited { retry_after } => assert_eq!(retry_after, Some(Duration::from_secs(12))),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn retry_after_http_date_in_the_past_means_now() {
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn retry_after_garbage_is_ignored() {
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn override_predicate_wins_over_defaults() {
        let overrides = ClassifierOverrides::default()
            .rate_limited_when(|r| {
                r.output
                    .as_ref()
                    .and_then(|o| o.as_str())
                    .is_some_and(|s| s.contains("throttled"))
            })
            .retry_after_from(|_| Some(Duration::from_millis(250)));
        let classifier = Classifier::new(overrides);

        let outcome = classifier.classify(Ok(ProviderResponse::output(serde_json::json!("throttled: try later"))));
        match outcome {
            Outcome::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_millis(250)));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn quota_reading_parses_openai_style_headers() {
        let response = with_headers(&[
            ("x-ratelimit-limit-requests", "100"),
            ("x-ratelimit-remaining-requests", "5"),
            ("x-ratelimit-limit-tokens", "20000"),
            ("x-ratelimit-remaining-tokens", "19000"),
        ]);
        let reading = QuotaReading::from_response(&response).expect("quota headers present");
        assert_eq!(reading.request_limit, Some(100));
        assert_eq!(reading.request_ratio(), Some(0.05));
        assert_eq!(reading.token_ratio(), Some(0.95));
    }

    #[test]
    fn quota_reading_falls_back_to_bare_pair() {
        let response = with_headers(&[("x-ratelimit-limit", "60"), ("x-ratelimit-remaining", "59")]);
        let reading = QuotaReading::from_response(&response).expect("quota headers present");
        assert_eq!(reading.request_limit, Some(60));
        assert_eq!(reading.request_remaining, Some(59));
        assert_eq!(reading.token_limit, None);
    }

    #[test]
    fn quota_reading_absent_without_headers() {
        let response = ProviderResponse::output(serde_json::Value::Null);
        assert_eq!(QuotaReading::from_response(&response), None);
    }
}
