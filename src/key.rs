//! Rate-limit keys and request identifiers.
//!
//! A [`RateLimitKey`] names one upstream quota bucket: callers that share an
//! endpoint and credential collapse to the same key and therefore the same
//! limiter; callers that differ in either never share one. Keys carry no
//! secret material (credentials enter only as a truncated SHA-256
//! fingerprint) and are stable across restarts for the same configuration, so
//! operators can correlate metrics between runs.

use std::fmt;

use sha2::{Digest, Sha256};
use url::Url;

use crate::caller::Caller;

/// Bytes of the SHA-256 digest kept in the fingerprint (64 bits, hex-encoded).
const FINGERPRINT_BYTES: usize = 8;

/// Stable string key identifying one upstream rate-limit bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    /// Wrap a pre-computed key. Prefer [`resolve_key`] for callers.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Locally unique request identifier, `"{key}-{seq}-{rand}"`. Only used for
/// correlation in events and logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub struct RequestId(String);

impl RequestId {
    pub(crate) fn mint(key: &RateLimitKey, seq: u64, rand: u32) -> Self {
        Self(format!("{}-{}-{:08x}", key.as_str(), seq, rand))
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the rate-limit key for a caller.
///
/// The key is `"{id}:{host}:{fingerprint}"`:
/// - `id` is the caller's stable identity,
/// - `host` is the normalized endpoint host (lowercased, port kept when
///   non-default, `"local"` when no endpoint is configured),
/// - `fingerprint` is the first 64 bits of a SHA-256 over the credential and
///   the model/deployment selectors, hex-encoded.
///
/// The function is pure: identical configuration yields an identical key in
/// every process.
pub fn resolve_key(caller: &dyn Caller) -> RateLimitKey {
    let config = caller.config();

    let host = config
        .endpoint
        .as_deref()
        .map(normalize_host)
        .unwrap_or_else(|| "local".to_string());

    let mut hasher = Sha256::new();
    hasher.update(config.api_key.as_deref().unwrap_or("").as_bytes());
    hasher.update([0u8]);
    hasher.update(config.model.as_deref().unwrap_or("").as_bytes());
    hasher.update([0u8]);
    hasher.update(config.deployment.as_deref().unwrap_or("").as_bytes());
    let digest = hasher.finalize();
    let fingerprint = hex::encode(&digest[..FINGERPRINT_BYTES]);

    RateLimitKey(format!("{}:{}:{}", caller.id(), host, fingerprint))
}

/// Lowercased host (plus explicit port) from an endpoint string. Endpoints
/// that do not parse as URLs are used verbatim, lowercased, so misconfigured
/// callers still partition deterministically.
fn normalize_host(endpoint: &str) -> String {
    match Url::parse(endpoint) {
        Ok(url) => {
            let host = url.host_str().unwrap_or("local").to_ascii_lowercase();
            match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host,
            }
        }
        Err(_) => endpoint.trim().to_ascii_lowercase(),
    }
}
