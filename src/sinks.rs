//! Event delivery: the broadcast bus the limiters publish to, and
//! `tower::Service` sinks for consumers that want events pushed at them.
//!
//! Publication is synchronous and non-blocking: a limiter never waits on a
//! slow subscriber, and delivery never happens inside a limiter's critical
//! region. Subscribers that fall behind lose the oldest events and the loss
//! is counted, never silently absorbed.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tokio::sync::broadcast;
use tower::Service;

use crate::events::SchedulerEvent;

/// Default bus capacity; beyond this, lagging subscribers skip events.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// A consumer of scheduler events, expressed as a `tower::Service` so sinks
/// compose with the wider tower ecosystem.
pub trait EventSink:
    Service<SchedulerEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// Error type produced by this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Emit honoring `poll_ready`, swallowing sink errors: telemetry must never
/// fail a request.
pub async fn emit_best_effort<S>(sink: S, event: SchedulerEvent)
where
    S: Service<SchedulerEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready) = sink.ready_oneshot().await {
        let _ = ready.call(event).await;
    }
}

/// Fan-out bus between limiters and subscribers.
///
/// `publish` is synchronous: it hands the event to the broadcast channel and
/// returns. Events published while no subscriber exists are counted as
/// dropped.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<SchedulerEvent>>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// Bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender: Arc::new(sender), dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// New receiver observing every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }

    /// Publish without blocking. Returns whether any subscriber received it.
    pub fn publish(&self, event: SchedulerEvent) -> bool {
        match self.sender.send(event) {
            Ok(_) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Live subscriber count.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Events published while nobody was subscribed.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

/// Forward bus events into a sink until the bus closes. Lagged gaps are
/// logged and skipped. Spawn this next to a `LogSink` or `MemorySink` for
/// push-style consumption.
pub async fn pump<S>(mut receiver: broadcast::Receiver<SchedulerEvent>, sink: S)
where
    S: Service<SchedulerEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    loop {
        match receiver.recv().await {
            Ok(event) => emit_best_effort(sink.clone(), event).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event subscriber lagging, events skipped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

type SinkFuture<E> = BoxFuture<'static, Result<(), E>>;

/// Discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<SchedulerEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: SchedulerEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl EventSink for NullSink {
    type SinkError = Infallible;
}

/// Logs every event through `tracing` at info level.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<SchedulerEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: SchedulerEvent) -> Self::Future {
        tracing::info!(kind = event.label(), key = %event.key, event = %event, "scheduler_event");
        Box::pin(async { Ok(()) })
    }
}

impl EventSink for LogSink {
    type SinkError = Infallible;
}

/// Buffers events in memory with bounded capacity; oldest events are evicted
/// first. The workhorse for assertions in tests and for TUI snapshots.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<SchedulerEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Sink retaining up to 10k events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Sink retaining up to `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Copy of the retained events, oldest first.
    pub fn events(&self) -> Vec<SchedulerEvent> {
        self.lock().clone()
    }

    /// Retained events matching a label, oldest first.
    pub fn events_labeled(&self, label: &str) -> Vec<SchedulerEvent> {
        self.lock().iter().filter(|e| e.label() == label).cloned().collect()
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Events evicted due to the capacity bound.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Drop all retained events.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SchedulerEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<SchedulerEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: SchedulerEvent) -> Self::Future {
        let mut events = self.lock();
        if events.len() >= self.capacity {
            events.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        events.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl EventSink for MemorySink {
    type SinkError = Infallible;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, RequestEvent};
    use crate::key::{RateLimitKey, RequestId};

    fn event(seq: u64) -> SchedulerEvent {
        let key = RateLimitKey::new("stub:local:0000");
        SchedulerEvent::new(
            key.clone(),
            EventKind::Request(RequestEvent::Started { request_id: RequestId::mint(&key, seq, 0) }),
        )
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        assert!(bus.publish(event(1)));
        let received = rx.recv().await.expect("event delivered");
        assert_eq!(received.label(), "request:started");
    }

    #[tokio::test]
    async fn bus_counts_drops_without_subscribers() {
        let bus = EventBus::default();
        assert!(!bus.publish(event(1)));
        assert_eq!(bus.dropped_count(), 1);
        assert_eq!(bus.receiver_count(), 0);
    }

    #[tokio::test]
    async fn memory_sink_evicts_oldest_at_capacity() {
        let mut sink = MemorySink::with_capacity(2);
        for seq in 1..=3 {
            sink.call(event(seq)).await.unwrap();
        }
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted(), 1);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn pump_moves_bus_events_into_a_sink() {
        let bus = EventBus::default();
        let sink = MemorySink::new();
        let worker = tokio::spawn(pump(bus.subscribe(), sink.clone()));

        bus.publish(event(1));
        bus.publish(event(2));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(sink.len(), 2);

        worker.abort();
    }

    #[tokio::test]
    async fn null_and_log_sinks_accept_events() {
        NullSink.call(event(1)).await.unwrap();
        LogSink.call(event(2)).await.unwrap();
    }

    #[tokio::test]
    async fn emit_best_effort_swallows_sink_errors() {
        #[derive(Clone)]
        struct Failing;
        impl Service<SchedulerEvent> for Failing {
            type Response = ();
            type Error = std::io::Error;
            type Future = SinkFuture<Self::Error>;
            fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
                Poll::Ready(Ok(()))
            }
            fn call(&mut self, _event: SchedulerEvent) -> Self::Future {
                Box::pin(async { Err(std::io::Error::new(std::io::ErrorKind::Other, "sink down")) })
            }
        }
        impl EventSink for Failing {
            type SinkError = std::io::Error;
        }

        emit_best_effort(Failing, event(1)).await;
    }
}
