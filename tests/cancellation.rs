//! Cancel discipline: user cancel unwinds as `Cancelled` everywhere, while a
//! per-call timeout fails only the request that hit it.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::StubCaller;
use ratewarden::{
    CancellationToken, ConfigOverrides, EventKind, ExecuteOptions, LimiterRegistry, RequestEvent,
};

#[tokio::test]
async fn user_cancel_fails_in_flight_and_queued_requests() {
    common::init_tracing();
    let registry = Arc::new(LimiterRegistry::new());
    let mut events = registry.subscribe();
    let caller = Arc::new(StubCaller::new("cancellable").with_latency(Duration::from_millis(500)));

    let cancel = CancellationToken::new();
    let options = ExecuteOptions {
        config: ConfigOverrides { max_concurrency: Some(1), ..Default::default() },
        cancel: cancel.clone(),
        ..Default::default()
    };

    // First request completes before the cancel fires.
    let quick = StubCaller::new("cancellable");
    registry
        .execute(&quick, &serde_json::json!(0), &options)
        .await
        .expect("first request completes");

    // Second occupies the only slot; third waits in the queue.
    let mut handles = Vec::new();
    for seq in 1..=2 {
        let registry = registry.clone();
        let caller = caller.clone();
        let options = options.clone();
        handles.push(tokio::spawn(async move {
            registry.execute(caller.as_ref(), &serde_json::json!(seq), &options).await
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    cancel.cancel();

    for handle in handles {
        let err = handle.await.expect("task").expect_err("cancelled");
        assert!(err.is_cancelled(), "expected Cancelled, got {err:?}");
    }

    let mut cancelled_failures = 0;
    while let Ok(event) = events.try_recv() {
        if let EventKind::Request(RequestEvent::Failed { error, .. }) = &event.kind {
            assert!(error.contains("cancelled"), "failure identifies the cancel: {error}");
            cancelled_failures += 1;
        }
    }
    assert_eq!(cancelled_failures, 2);

    let metrics = registry.metrics();
    let snapshot = metrics.values().next().expect("one bucket");
    assert_eq!(snapshot.completed_requests, 1);
    assert_eq!(snapshot.failed_requests, 2);
    // Cancels are not provider failures: nothing was retried, nothing counted
    // as a rate limit.
    assert_eq!(snapshot.rate_limit_hits, 0);
    assert_eq!(snapshot.retried_requests, 0);
}

#[tokio::test]
async fn cancel_during_backoff_stops_the_retry_loop() {
    let registry = LimiterRegistry::new();
    let caller = StubCaller::new("backoff-cancel")
        .with_script(vec![StubCaller::rate_limited("retry after 30s")]);

    let cancel = CancellationToken::new();
    let options = ExecuteOptions { cancel: cancel.clone(), ..Default::default() };

    let cancel_trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_trigger.cancel();
    });

    let err = registry
        .execute(&caller, &serde_json::Value::Null, &options)
        .await
        .expect_err("cancel interrupts the backoff sleep");
    assert!(err.is_cancelled());
    assert_eq!(caller.calls(), 1, "no second attempt after the cancel");
}

#[tokio::test]
async fn per_call_timeout_fails_one_row_and_the_run_continues() {
    let registry = LimiterRegistry::new();
    let slow = StubCaller::new("timeouty").with_latency(Duration::from_millis(300));

    let options = ExecuteOptions { timeout: Some(Duration::from_millis(50)), ..Default::default() };
    let err = registry
        .execute(&slow, &serde_json::json!("slow"), &options)
        .await
        .expect_err("per-call timeout");
    assert!(err.is_caller(), "timeout is terminal for this request: {err:?}");
    assert!(err.to_string().contains("timed out"));
    assert!(!err.is_cancelled(), "a timeout is not a user cancel");

    // The same bucket keeps serving subsequent requests.
    let quick = StubCaller::new("timeouty");
    registry
        .execute(&quick, &serde_json::json!("quick"), &ExecuteOptions::default())
        .await
        .expect("next request succeeds");

    let metrics = registry.metrics();
    let snapshot = metrics.values().next().expect("one bucket");
    assert_eq!(snapshot.completed_requests, 1);
    assert_eq!(snapshot.failed_requests, 1);
}

#[tokio::test]
async fn pre_cancelled_token_never_reaches_the_provider() {
    let registry = LimiterRegistry::new();
    let caller = StubCaller::new("untouched");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let options = ExecuteOptions { cancel, ..Default::default() };

    let err = registry
        .execute(&caller, &serde_json::Value::Null, &options)
        .await
        .expect_err("cancelled before admission");
    assert!(err.is_cancelled());
    assert_eq!(caller.calls(), 0);
}
