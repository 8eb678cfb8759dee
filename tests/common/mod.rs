//! Shared test caller: scripted responses, optional simulated latency, and
//! cooperative cancel handling, so scheduler behavior can be exercised
//! without any real provider.

#![allow(dead_code)] // each test binary uses a different slice of the helpers

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ratewarden::{
    CallContext, CallFailure, CallOptions, Caller, CallerConfig, ProviderResponse,
};

/// Route scheduler logs into the test output when `RUST_LOG` asks for them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub struct StubCaller {
    id: String,
    config: CallerConfig,
    latency: Duration,
    script: Mutex<VecDeque<Result<ProviderResponse, CallFailure>>>,
    calls: Arc<AtomicUsize>,
    bodies: Mutex<Vec<serde_json::Value>>,
}

impl StubCaller {
    /// Caller whose key is derived from `id` (same id, same bucket).
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            config: CallerConfig {
                endpoint: Some("https://api.example.test/v1".to_string()),
                api_key: Some(format!("key-{id}")),
                model: Some("test-model".to_string()),
                ..CallerConfig::default()
            },
            latency: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            calls: Arc::new(AtomicUsize::new(0)),
            bodies: Mutex::new(Vec::new()),
        }
    }

    /// Simulate upstream work; the sleep honors the cancel token by
    /// returning an abort failure, the way a real transport would.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue scripted results, consumed one per call; when the script runs
    /// dry every further call succeeds with an `"ok"` output.
    pub fn with_script(self, script: Vec<Result<ProviderResponse, CallFailure>>) -> Self {
        *self.script.lock().unwrap() = script.into();
        self
    }

    pub fn rate_limited(message: &str) -> Result<ProviderResponse, CallFailure> {
        Err(CallFailure::Http { status: 429, message: message.to_string() })
    }

    pub fn ok(value: serde_json::Value) -> Result<ProviderResponse, CallFailure> {
        Ok(ProviderResponse::output(value))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Bodies in the order the scheduler actually invoked them.
    pub fn bodies(&self) -> Vec<serde_json::Value> {
        self.bodies.lock().unwrap().clone()
    }
}

#[async_trait]
impl Caller for StubCaller {
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
        opts: &CallOptions,
    ) -> Result<ProviderResponse, CallFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.bodies.lock().unwrap().push(body.clone());

        if !self.latency.is_zero() {
            tokio::select! {
                _ = opts.cancel.cancelled() => return Err(CallFailure::Aborted),
                _ = tokio::time::sleep(self.latency) => {}
            }
        }

        match self.script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(ProviderResponse::output(serde_json::json!("ok"))),
        }
    }
}
