use super::events::DeliveryEvent;
use futures::FutureExt;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tower::util::BoxCloneService;
use tower::ServiceExt;
use tower_service::Service;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

type Ready = Pin<Box<dyn Future<Output = Result<(), Infallible>> + Send>>;

/// A telemetry sink: a `tower::Service` consuming [`DeliveryEvent`]s.
pub trait TelemetrySink:
    Service<DeliveryEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    type SinkError: std::error::Error + Send + Sync + 'static;
}

/// Waits for readiness, sends one event, and ignores any error.
pub(crate) async fn emit_best_effort<S>(sink: S, event: DeliveryEvent)
where
    S: Service<DeliveryEvent, Response = ()> + Send + 'static,
    S::Future: Send + 'static,
{
    if let Ok(mut ready) = sink.ready_oneshot().await {
        let _ = ready.call(event).await;
    }
}

/// Discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<DeliveryEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: DeliveryEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Logs every event through `tracing` at info level.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<DeliveryEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DeliveryEvent) -> Self::Future {
        tracing::info!(event = %event, "delivery_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps the most recent events in memory, evicting the oldest when full.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<DeliveryEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<DeliveryEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<DeliveryEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DeliveryEvent) -> Self::Future {
        let mut guard = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Type-erased sink shared by the dispatcher's components.
///
/// [`emit`](Self::emit) never waits: sinks that finish immediately are driven
/// inline, anything slower is moved onto the runtime.
#[derive(Clone)]
pub struct TelemetryHandle {
    sink: Arc<Mutex<BoxCloneService<DeliveryEvent, (), BoxError>>>,
}

impl fmt::Debug for TelemetryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryHandle").finish_non_exhaustive()
    }
}

impl Default for TelemetryHandle {
    fn default() -> Self {
        Self::new(NullSink)
    }
}

impl TelemetryHandle {
    pub fn new<S>(sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        let boxed = BoxCloneService::new(sink.map_err(|e| Box::new(e) as BoxError));
        Self { sink: Arc::new(Mutex::new(boxed)) }
    }

    pub fn emit(&self, event: DeliveryEvent) {
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let mut pending = Box::pin(emit_best_effort(sink, event));
        if pending.as_mut().now_or_never().is_some() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(pending);
            }
            Err(_) => tracing::debug!("telemetry sink not ready and no runtime; event discarded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::events::{BatchEvent, LifecycleEvent, RetryEvent};
    use std::time::Duration;

    fn attempt(n: u32) -> DeliveryEvent {
        DeliveryEvent::Retry(RetryEvent::Attempt { attempt: n, delay: Duration::from_millis(10) })
    }

    #[tokio::test]
    async fn memory_sink_evicts_oldest() {
        let mut sink = MemorySink::with_capacity(2);
        assert!(sink.is_empty());

        sink.call(attempt(0)).await.unwrap();
        sink.call(attempt(1)).await.unwrap();
        sink.call(attempt(2)).await.unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted(), 1);
        assert_eq!(sink.events(), vec![attempt(1), attempt(2)]);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn handle_delivers_synchronously_to_ready_sinks() {
        let memory = MemorySink::new();
        let handle = TelemetryHandle::new(memory.clone());
        handle.emit(DeliveryEvent::Batch(BatchEvent::Sent { events: 3, duration: Duration::from_millis(4) }));
        handle.emit(DeliveryEvent::Lifecycle(LifecycleEvent::Closed { lost: 0 }));
        assert_eq!(memory.len(), 2);
    }

    #[test]
    fn handle_works_without_runtime() {
        let memory = MemorySink::new();
        let handle = TelemetryHandle::new(memory.clone());
        handle.emit(attempt(0));
        assert_eq!(memory.events(), vec![attempt(0)]);
    }

    #[tokio::test]
    async fn failing_sink_is_ignored() {
        #[derive(Clone)]
        struct Fails;
        impl TelemetrySink for Fails {
            type SinkError = std::io::Error;
        }
        impl Service<DeliveryEvent> for Fails {
            type Response = ();
            type Error = std::io::Error;
            type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;
            fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
                Poll::Ready(Ok(()))
            }
            fn call(&mut self, _event: DeliveryEvent) -> Self::Future {
                Box::pin(async { Err(std::io::Error::other("sink down")) })
            }
        }

        emit_best_effort(Fails, attempt(0)).await;
        TelemetryHandle::new(Fails).emit(attempt(1));
    }

    #[tokio::test]
    async fn log_sink_accepts_events() {
        let mut sink = LogSink;
        sink.call(attempt(3)).await.unwrap();
    }
}
