//! The batch dispatcher.
//!
//! [`Dispatcher`] owns the pending queue and a pool of background senders.
//! Events are admitted through the [`BackpressureHandler`], grouped into
//! batches when the queue reaches `batch_size` or the flush interval
//! elapses, and handed to at most `max_background_senders` concurrent sender
//! tasks. Each sender drives one batch through the circuit breaker, the
//! retry strategy and the transport (see `worker`).
//!
//! Failures after an event was accepted are never returned to the caller;
//! they arrive on [`Dispatcher::errors`].

mod worker;

use crate::async_error::{AsyncError, AsyncErrorHandler, AsyncErrorStats, AsyncOperation};
use crate::backpressure::{BackpressureHandler, BackpressureStats, Decision};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState};
use crate::clock::{Clock, MonotonicClock};
use crate::config::{DispatcherConfig, DynamicConfig, Tunables};
use crate::error::{ConfigError, DeliveryError, Result, TransportError};
use crate::event::{Batch, Event, EventKind};
use crate::id::IdGenerator;
use crate::lifecycle::{LifecycleManager, LifecycleState};
use crate::queue_monitor::{BackpressureLevel, QueueState};
use crate::retry::{is_retryable_error, ExponentialBackoff, RetryStrategy};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{
    BackpressureEvent, CircuitEvent, DeliveryEvent, LifecycleEvent, TelemetryHandle, TelemetrySink,
};
use crate::transport::{HttpTransport, Transport};
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Grace period for cancelled senders to report what they abandoned.
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Point-in-time view of the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherStats {
    pub uptime: Duration,
    pub lifecycle: LifecycleState,
    pub queue_size: usize,
    pub queue: QueueState,
    pub backpressure: BackpressureStats,
    pub circuit: CircuitBreakerStats,
    pub enqueued: u64,
    pub sent: u64,
    pub failed: u64,
    pub dropped: u64,
    pub requeued: u64,
    pub batches_sent: u64,
    pub in_flight_senders: usize,
    pub errors: AsyncErrorStats,
}

impl DispatcherStats {
    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.state
    }
}

#[derive(Debug, Default)]
struct Pending {
    /// Fresh events, each tagged with its enqueue sequence number.
    events: VecDeque<(u64, Event)>,
    /// Batches put back after a circuit-open rejection. Sent before fresh events.
    requeued: VecDeque<Batch>,
    /// Sequence numbers of events a sender currently holds.
    in_flight: BTreeSet<u64>,
    next_seq: u64,
}

impl Pending {
    fn len(&self) -> usize {
        self.events.len() + self.requeued.iter().map(Batch::len).sum::<usize>()
    }

    fn push(&mut self, event: Event) -> usize {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.push_back((seq, event));
        self.events.len()
    }

    /// Events enqueued before `cutoff` that are neither delivered nor given up on.
    fn outstanding_before(&self, cutoff: u64) -> usize {
        let queued = self.events.iter().filter(|(seq, _)| *seq < cutoff).count();
        let requeued = self.requeued.iter().flat_map(|b| &b.sequence).filter(|seq| **seq < cutoff).count();
        queued + requeued + self.in_flight.range(..cutoff).count()
    }
}

/// Failures attributed to one running flush: only events enqueued before it
/// started (sequence below `cutoff`) count.
#[derive(Debug)]
struct FlushWatch {
    cutoff: u64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Undelivered {
    /// Given up on after a send failure or a permanent item rejection.
    Failed,
    /// Discarded without a final send: requeue limit, cancellation, shutdown.
    Dropped,
}

/// Unregisters a flush watch however the flush ends.
struct FlushGuard<'a> {
    shared: &'a Shared,
    watch: Arc<FlushWatch>,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.shared
            .flushes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|w| !Arc::ptr_eq(w, &self.watch));
    }
}

/// Closes the dispatcher if a `shutdown` future is dropped before it finishes.
struct ShutdownGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for ShutdownGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let shared = self.shared;
        shared.cancel.cancel();
        let lost = shared.discard_leftovers();
        // The error channel stays open so cancelled senders can still report.
        if shared.lifecycle.complete_shutdown().is_ok() {
            shared.telemetry.emit(DeliveryEvent::Lifecycle(LifecycleEvent::Closed { lost }));
        }
        tracing::warn!(lost, "shutdown interrupted; dispatcher closed without draining");
    }
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    requeued: AtomicU64,
    batches_sent: AtomicU64,
    /// Events abandoned by senders because of cancellation.
    abandoned: AtomicU64,
}

/// State shared between the handle, the scheduler and the senders.
struct Shared {
    config: DispatcherConfig,
    tunables: DynamicConfig<Tunables>,
    queue: Mutex<Pending>,
    space_freed: Notify,
    work_ready: Notify,
    /// Set by blocked producers: the next scheduler pass sends partial batches.
    force_pending: AtomicBool,
    senders: Arc<Semaphore>,
    active_senders: AtomicUsize,
    /// Events taken off the queue whose delivery has not finished.
    in_flight: AtomicUsize,
    drained: Notify,
    breaker: CircuitBreaker,
    backpressure: BackpressureHandler,
    lifecycle: Arc<LifecycleManager>,
    errors: AsyncErrorHandler,
    retry: Arc<dyn RetryStrategy>,
    transport: Arc<dyn Transport>,
    telemetry: TelemetryHandle,
    sleeper: Arc<dyn Sleeper>,
    ids: IdGenerator,
    cancel: CancellationToken,
    counters: Counters,
    batch_sequence: AtomicU64,
    flushes: Mutex<Vec<Arc<FlushWatch>>>,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("queue_size", &self.queue_len())
            .field("lifecycle", &self.lifecycle.state())
            .field("breaker", &self.breaker)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Dispatcher`]. Everything except the configuration is optional.
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    transport: Option<Arc<dyn Transport>>,
    retry: Option<Arc<dyn RetryStrategy>>,
    telemetry: TelemetryHandle,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    ids: IdGenerator,
}

impl DispatcherBuilder {
    pub fn transport<T: Transport + 'static>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Defaults to [`ExponentialBackoff`] with the configured `max_retries`.
    pub fn retry_strategy<R: RetryStrategy + 'static>(mut self, strategy: R) -> Self {
        self.retry = Some(Arc::new(strategy));
        self
    }

    pub fn telemetry<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        self.telemetry = TelemetryHandle::new(sink);
        self
    }

    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn id_generator(mut self, ids: IdGenerator) -> Self {
        self.ids = ids;
        self
    }

    /// Validates the configuration and starts the background scheduler.
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> std::result::Result<Dispatcher, ConfigError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
        let config = self.config;
        config.validate()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&config)?),
        };
        let retry = self.retry.unwrap_or_else(|| Arc::new(ExponentialBackoff::new(config.max_retries)));
        let breaker = CircuitBreaker::new("ingestion", config.circuit_breaker.clone())?
            .with_shared_clock(self.clock.clone())
            .with_failure_predicate(counts_against_endpoint);
        let backpressure = BackpressureHandler::new(config.backpressure())?;
        let lifecycle = Arc::new(LifecycleManager::new(self.clock.clone(), config.idle_warning_after));

        let shared = Arc::new(Shared {
            tunables: DynamicConfig::new(config.tunables()),
            queue: Mutex::new(Pending::default()),
            space_freed: Notify::new(),
            work_ready: Notify::new(),
            force_pending: AtomicBool::new(false),
            senders: Arc::new(Semaphore::new(config.max_background_senders)),
            active_senders: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            breaker,
            backpressure,
            lifecycle,
            errors: AsyncErrorHandler::new(config.error_buffer),
            retry,
            transport,
            telemetry: self.telemetry,
            sleeper: self.sleeper,
            ids: self.ids,
            cancel: CancellationToken::new(),
            counters: Counters::default(),
            batch_sequence: AtomicU64::new(0),
            flushes: Mutex::new(Vec::new()),
            config,
        });
        shared.wire_listeners();

        let scheduler = runtime.spawn(scheduler_loop(shared.clone()));
        let idle_watcher = shared.lifecycle.spawn_idle_watcher(shared.cancel.child_token());

        tracing::info!(
            endpoint = %shared.config.ingestion_url(),
            batch_size = shared.config.batch_size,
            senders = shared.config.max_background_senders,
            queue_capacity = shared.config.queue_capacity,
            "dispatcher started"
        );

        Ok(Dispatcher { shared, tasks: Mutex::new(Tasks { scheduler: Some(scheduler), idle_watcher }) })
    }
}

/// Failures that say something about the endpoint's health. Cancellations and
/// requests the endpoint rejected as malformed or unauthorized do not.
fn counts_against_endpoint(err: &(dyn StdError + 'static)) -> bool {
    match err.downcast_ref::<TransportError>() {
        Some(TransportError::Cancelled) => false,
        Some(TransportError::Auth { .. } | TransportError::Client { .. } | TransportError::Encode(_)) => false,
        Some(_) => true,
        None => is_retryable_error(err),
    }
}

struct Tasks {
    scheduler: Option<JoinHandle<()>>,
    idle_watcher: Option<JoinHandle<()>>,
}

/// Accepts events and delivers them in the background.
pub struct Dispatcher {
    shared: Arc<Shared>,
    tasks: Mutex<Tasks>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher").field("shared", &self.shared).finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn builder(config: DispatcherConfig) -> DispatcherBuilder {
        DispatcherBuilder {
            config,
            transport: None,
            retry: None,
            telemetry: TelemetryHandle::default(),
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            ids: IdGenerator::default(),
        }
    }

    /// Dispatcher with the HTTP transport and default collaborators.
    pub fn new(config: DispatcherConfig) -> std::result::Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    /// Builds an event with a freshly generated id.
    pub fn event(&self, kind: EventKind, body: Value) -> Result<Event> {
        let id = self.shared.ids.generate().map_err(|err| {
            self.shared.errors.handle(AsyncError::new(AsyncOperation::IdGeneration, err.clone()));
            err
        })?;
        Ok(Event::new(id.into_string(), kind, body))
    }

    /// Admits `event` to the queue.
    ///
    /// Returns [`DeliveryError::Closed`] once shutdown has begun,
    /// [`DeliveryError::BatchDropped`] under the drop policy when the queue is
    /// full, and [`DeliveryError::BlockTimeout`] when the block policy waited
    /// `block_timeout` without space becoming available.
    pub async fn enqueue(&self, event: Event) -> Result<()> {
        let shared = &self.shared;
        if !shared.lifecycle.is_active() {
            return Err(DeliveryError::Closed);
        }
        shared.lifecycle.record_activity();

        let started = Instant::now();
        let deadline = started + shared.config.block_timeout;
        let mut event = Some(event);
        loop {
            let space = shared.space_freed.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            let size = shared.queue_len();
            match shared.backpressure.decide(size) {
                Decision::Allow => {
                    let queued = {
                        let mut queue = shared.lock_queue();
                        match event.take() {
                            Some(event) => queue.push(event),
                            None => queue.events.len(),
                        }
                    };
                    shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                    if queued >= shared.tunables.get().batch_size {
                        shared.work_ready.notify_one();
                    }
                    return Ok(());
                }
                Decision::Drop => {
                    shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    return Err(DeliveryError::BatchDropped { size, capacity: shared.config.queue_capacity });
                }
                Decision::Block => {
                    // The queue may hold less than a batch; only a forced pass frees it.
                    shared.force_pending.store(true, Ordering::Release);
                    shared.work_ready.notify_one();
                    tokio::select! {
                        _ = &mut space => {}
                        _ = tokio::time::sleep_until(deadline) => {
                            return Err(DeliveryError::BlockTimeout { waited: started.elapsed() });
                        }
                        _ = shared.cancel.cancelled() => return Err(DeliveryError::Closed),
                    }
                    if !shared.lifecycle.is_active() {
                        return Err(DeliveryError::Closed);
                    }
                }
            }
        }
    }

    /// Sends everything queued at the time of the call and waits for every
    /// in-flight batch, bounded by `flush_timeout`.
    ///
    /// The returned [`DeliveryError::Flush`] only accounts for events enqueued
    /// before the call: `pending` are still queued or in flight, `failed` were
    /// given up on after a send failure, and `dropped` were discarded without
    /// a final send (requeue limit reached while the circuit stayed open).
    /// Events other producers enqueue while the flush runs never affect it.
    pub async fn flush(&self) -> Result<()> {
        let shared = &self.shared;
        let guard = shared.watch_flush();
        let completed = tokio::time::timeout(shared.config.flush_timeout, async {
            shared.dispatch(true).await;
            shared.wait_idle().await;
        })
        .await
        .is_ok();

        let pending = shared.lock_queue().outstanding_before(guard.watch.cutoff);
        let failed = guard.watch.failed.load(Ordering::Acquire);
        let dropped = guard.watch.dropped.load(Ordering::Acquire);
        drop(guard);
        if !completed {
            tracing::warn!(pending, timeout = ?shared.config.flush_timeout, "flush timed out");
        }
        if pending > 0 || failed > 0 || dropped > 0 {
            let err = DeliveryError::Flush { pending, failed, dropped };
            shared.errors.handle(
                AsyncError::new(AsyncOperation::Flush, DeliveryError::Flush { pending, failed, dropped })
                    .retryable(pending > 0),
            );
            return Err(err);
        }
        Ok(())
    }

    /// Stops admission, drains the queue within `shutdown_timeout`, then
    /// closes. Events that could not be delivered are reported in
    /// [`DeliveryError::Shutdown`] and through [`Dispatcher::errors`].
    ///
    /// Dropping the returned future closes the dispatcher at once: in-flight
    /// sends are cancelled and queued events are reported as lost.
    pub async fn shutdown(&self) -> Result<()> {
        let shared = &self.shared;
        shared.lifecycle.begin_shutdown()?;
        let mut guard = ShutdownGuard { shared, armed: true };
        let pending = shared.queue_len();
        tracing::info!(pending, timeout = ?shared.config.shutdown_timeout, "dispatcher shutting down");
        shared.telemetry.emit(DeliveryEvent::Lifecycle(LifecycleEvent::ShutdownStarted { pending }));
        // Blocked producers re-check the lifecycle and give up.
        shared.space_freed.notify_waiters();

        let abandoned_before = shared.counters.abandoned.load(Ordering::Relaxed);
        let drained = tokio::time::timeout(shared.config.shutdown_timeout, async {
            shared.dispatch(true).await;
            shared.wait_idle().await;
        })
        .await
        .is_ok();

        shared.cancel.cancel();
        if !drained {
            tracing::warn!("shutdown timed out; cancelling in-flight deliveries");
            let _ = tokio::time::timeout(CANCEL_GRACE, shared.wait_idle()).await;
        }

        let leftovers = shared.discard_leftovers();
        let abandoned = shared.counters.abandoned.load(Ordering::Relaxed) - abandoned_before;
        let lost = leftovers + usize::try_from(abandoned).unwrap_or(usize::MAX);

        self.join_tasks().await;
        guard.armed = false;
        shared.lifecycle.complete_shutdown()?;
        shared.errors.close();
        shared.telemetry.emit(DeliveryEvent::Lifecycle(LifecycleEvent::Closed { lost }));

        if lost > 0 {
            tracing::error!(lost, "dispatcher closed with undelivered events");
            return Err(DeliveryError::Shutdown { lost });
        }
        tracing::info!("dispatcher closed");
        Ok(())
    }

    pub fn stats(&self) -> DispatcherStats {
        let shared = &self.shared;
        let backpressure = shared.backpressure.stats();
        DispatcherStats {
            uptime: shared.lifecycle.uptime(),
            lifecycle: shared.lifecycle.state(),
            queue_size: shared.queue_len(),
            queue: backpressure.queue.clone(),
            backpressure,
            circuit: shared.breaker.stats(),
            enqueued: shared.counters.enqueued.load(Ordering::Relaxed),
            sent: shared.counters.sent.load(Ordering::Relaxed),
            failed: shared.counters.failed.load(Ordering::Relaxed),
            dropped: shared.counters.dropped.load(Ordering::Relaxed),
            requeued: shared.counters.requeued.load(Ordering::Relaxed),
            batches_sent: shared.counters.batches_sent.load(Ordering::Relaxed),
            in_flight_senders: shared.active_senders.load(Ordering::Relaxed),
            errors: shared.errors.stats(),
        }
    }

    /// Failures from background sends, to be drained by the caller.
    pub fn errors(&self) -> &AsyncErrorHandler {
        &self.shared.errors
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.shared.breaker
    }

    pub fn backpressure(&self) -> &BackpressureHandler {
        &self.shared.backpressure
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.shared.lifecycle
    }

    pub fn tunables(&self) -> Tunables {
        *self.shared.tunables.get()
    }

    /// Changes batch size and flush interval while running.
    pub fn update_tunables(&self, tunables: Tunables) -> std::result::Result<(), ConfigError> {
        tunables.validate()?;
        self.shared.tunables.set(tunables);
        tracing::info!(batch_size = tunables.batch_size, flush_interval = ?tunables.flush_interval, "tunables updated");
        self.shared.work_ready.notify_one();
        Ok(())
    }

    async fn join_tasks(&self) {
        let (scheduler, idle_watcher) = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            (tasks.scheduler.take(), tasks.idle_watcher.take())
        };
        for handle in [scheduler, idle_watcher].into_iter().flatten() {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "background task failed during shutdown");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        let pending = self.shared.queue_len();
        if pending > 0 {
            tracing::warn!(pending, "dispatcher dropped without shutdown; pending events are lost");
        }
        self.shared.cancel.cancel();
    }
}

impl Shared {
    fn lock_queue(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue_len(&self) -> usize {
        self.lock_queue().len()
    }

    /// Starts attributing failures to a flush that covers everything enqueued so far.
    fn watch_flush(&self) -> FlushGuard<'_> {
        let cutoff = self.lock_queue().next_seq;
        let watch = Arc::new(FlushWatch { cutoff, failed: AtomicU64::new(0), dropped: AtomicU64::new(0) });
        self.flushes.lock().unwrap_or_else(PoisonError::into_inner).push(watch.clone());
        FlushGuard { shared: self, watch }
    }

    /// Charges undelivered events to every running flush that covers them.
    fn record_undelivered(&self, outcome: Undelivered, sequence: &[u64]) {
        let flushes = self.flushes.lock().unwrap_or_else(PoisonError::into_inner);
        for watch in flushes.iter() {
            let covered = sequence.iter().filter(|seq| **seq < watch.cutoff).count() as u64;
            if covered == 0 {
                continue;
            }
            let counter = match outcome {
                Undelivered::Failed => &watch.failed,
                Undelivered::Dropped => &watch.dropped,
            };
            counter.fetch_add(covered, Ordering::AcqRel);
        }
    }

    /// Events in `sequence` are no longer held by a sender.
    fn release(&self, sequence: &[u64]) {
        let mut queue = self.lock_queue();
        for seq in sequence {
            queue.in_flight.remove(seq);
        }
    }

    fn wire_listeners(self: &Arc<Self>) {
        let telemetry = self.telemetry.clone();
        self.breaker.set_listener(move |name: &str, from: CircuitState, to: CircuitState| {
            tracing::debug!(breaker = name, from = from.as_str(), to = to.as_str(), "circuit transition");
            telemetry.emit(DeliveryEvent::Circuit(CircuitEvent::Transition { from, to }));
        });

        let telemetry = self.telemetry.clone();
        self.backpressure.set_level_listener(
            move |from: BackpressureLevel, to: BackpressureLevel, state: &QueueState| {
                telemetry.emit(DeliveryEvent::Backpressure(BackpressureEvent::LevelChanged {
                    from,
                    to,
                    size: state.size,
                }));
            },
        );

        let telemetry = self.telemetry.clone();
        self.backpressure.set_listener(move |decision: Decision, state: &QueueState| {
            telemetry.emit(DeliveryEvent::Backpressure(BackpressureEvent::Decided { decision, size: state.size }));
        });

        let telemetry = self.telemetry.clone();
        self.lifecycle.set_idle_listener(move |idle: Duration| {
            telemetry.emit(DeliveryEvent::Lifecycle(LifecycleEvent::Idle { idle }));
        });
    }

    fn next_batch_id(&self) -> String {
        match self.ids.generate() {
            Ok(id) => id.into_string(),
            Err(err) => {
                let sequence = self.batch_sequence.fetch_add(1, Ordering::Relaxed);
                self.errors.handle(AsyncError::new(AsyncOperation::IdGeneration, err).with_context("sequence", sequence));
                format!("batch-{sequence}")
            }
        }
    }

    /// Whether [`next_batch`](Self::next_batch) would produce a batch.
    fn batch_ready(&self, take_requeued: usize, max_events: usize, force: bool) -> bool {
        let batch_size = self.tunables.get().batch_size;
        let queue = self.lock_queue();
        if take_requeued > 0 && !queue.requeued.is_empty() {
            return true;
        }
        let available = queue.events.len().min(max_events);
        available > 0 && (force || available >= batch_size)
    }

    /// Pops the next batch. `take_requeued` limits how many requeued batches
    /// may still be taken in this pass; `max_events` bounds fresh events.
    fn next_batch(&self, take_requeued: &mut usize, max_events: &mut usize, force: bool) -> Option<Batch> {
        let batch_size = self.tunables.get().batch_size;
        let mut queue = self.lock_queue();
        if *take_requeued > 0 {
            if let Some(batch) = queue.requeued.pop_front() {
                *take_requeued -= 1;
                queue.in_flight.extend(batch.sequence.iter().copied());
                self.in_flight.fetch_add(batch.len(), Ordering::AcqRel);
                return Some(batch);
            }
            *take_requeued = 0;
        }

        let available = queue.events.len().min(*max_events);
        if available == 0 || (!force && available < batch_size) {
            return None;
        }
        let take = available.min(batch_size);
        let events: Vec<(u64, Event)> = queue.events.drain(..take).collect();
        queue.in_flight.extend(events.iter().map(|(seq, _)| *seq));
        self.in_flight.fetch_add(take, Ordering::AcqRel);
        drop(queue);
        *max_events -= take;
        Some(Batch::sequenced(self.next_batch_id(), events))
    }

    /// Dispatches full batches, or everything when `force` is set. Requeued
    /// batches are only retried on forced passes.
    ///
    /// A sender permit is held before a batch leaves the queue, so cancelling
    /// this future never strands popped events.
    async fn dispatch(self: &Arc<Self>, force: bool) {
        let (mut requeued, mut events) = {
            let queue = self.lock_queue();
            (if force { queue.requeued.len() } else { 0 }, if force { queue.events.len() } else { usize::MAX })
        };
        while self.batch_ready(requeued, events, force) {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                permit = self.senders.clone().acquire_owned() => permit,
            };
            let Ok(permit) = permit else { return };
            let Some(batch) = self.next_batch(&mut requeued, &mut events, force) else { return };
            self.space_freed.notify_waiters();
            self.active_senders.fetch_add(1, Ordering::AcqRel);
            let shared = self.clone();
            tokio::spawn(async move {
                let events = batch.len();
                worker::deliver(&shared, batch).await;
                shared.active_senders.fetch_sub(1, Ordering::AcqRel);
                drop(permit);
                shared.settle(events);
            });
        }
    }

    /// Marks `events` taken off the queue as finished, one way or another.
    fn settle(&self, events: usize) {
        if self.in_flight.fetch_sub(events, Ordering::AcqRel) == events {
            self.drained.notify_waiters();
        }
    }

    /// Resolves once nothing taken off the queue is still being delivered.
    async fn wait_idle(&self) {
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            drained.await;
        }
    }

    fn requeue(&self, batch: Batch) {
        let mut queue = self.lock_queue();
        for seq in &batch.sequence {
            queue.in_flight.remove(seq);
        }
        queue.requeued.push_back(batch);
    }

    fn take_all(&self) -> Vec<(u64, Event)> {
        let mut queue = self.lock_queue();
        let mut events: Vec<(u64, Event)> = queue.requeued.drain(..).flat_map(Batch::into_sequenced).collect();
        events.extend(queue.events.drain(..));
        events
    }

    /// Empties the queue, reporting every event in it as lost to shutdown.
    fn discard_leftovers(&self) -> usize {
        let leftovers = self.take_all();
        if leftovers.is_empty() {
            return 0;
        }
        let (sequence, events): (Vec<u64>, Vec<Event>) = leftovers.into_iter().unzip();
        self.counters.dropped.fetch_add(events.len() as u64, Ordering::Relaxed);
        self.record_undelivered(Undelivered::Dropped, &sequence);
        self.errors.handle(
            AsyncError::new(AsyncOperation::Shutdown, DeliveryError::Shutdown { lost: events.len() })
                .with_event_ids(events.iter().map(|e| e.id.clone())),
        );
        events.len()
    }
}

async fn scheduler_loop(shared: Arc<Shared>) {
    let mut next_tick = Instant::now() + shared.tunables.get().flush_interval;
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = shared.work_ready.notified() => {
                let interval = shared.tunables.get().flush_interval;
                next_tick = next_tick.min(Instant::now() + interval);
                shared.dispatch(shared.force_pending.swap(false, Ordering::AcqRel)).await;
            }
            _ = tokio::time::sleep_until(next_tick) => {
                shared.dispatch(true).await;
                next_tick = Instant::now() + shared.tunables.get().flush_interval;
            }
        }
    }
    tracing::debug!("scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::IngestionResponse;
    use async_trait::async_trait;
    use serde_json::json;

    #[derive(Debug, Default)]
    struct Recording {
        batches: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl Transport for Arc<Recording> {
        async fn send(&self, batch: &Batch) -> std::result::Result<IngestionResponse, TransportError> {
            self.batches.lock().unwrap().push(batch.event_ids());
            Ok(IngestionResponse::default())
        }
    }

    fn config() -> crate::config::DispatcherConfigBuilder {
        DispatcherConfig::builder()
            .public_key("pk-lf-test")
            .secret_key("sk-lf-test")
            .flush_interval(Duration::from_secs(3600))
    }

    fn event(id: &str) -> Event {
        Event::new(id, EventKind::EventCreate, json!({}))
    }

    #[test]
    fn build_requires_runtime() {
        let err = Dispatcher::new(config().build().unwrap()).unwrap_err();
        assert_eq!(err, ConfigError::NoRuntime);
    }

    #[test]
    fn endpoint_health_predicate() {
        assert!(counts_against_endpoint(&TransportError::Server { status: 500, body: String::new() }));
        assert!(counts_against_endpoint(&TransportError::Timeout(Duration::from_secs(1))));
        assert!(!counts_against_endpoint(&TransportError::Cancelled));
        assert!(!counts_against_endpoint(&TransportError::Auth { status: 401 }));
    }

    #[tokio::test]
    async fn flush_sends_partial_batch_in_order() {
        let recording = Arc::new(Recording::default());
        let dispatcher =
            Dispatcher::builder(config().batch_size(10).build().unwrap()).transport(recording.clone()).build().unwrap();

        for id in ["a", "b", "c"] {
            dispatcher.enqueue(event(id)).await.unwrap();
        }
        dispatcher.flush().await.unwrap();

        assert_eq!(*recording.batches.lock().unwrap(), vec![vec!["a", "b", "c"]]);
        let stats = dispatcher.stats();
        assert_eq!(stats.sent, 3);
        assert_eq!(stats.queue_size, 0);
        assert_eq!(stats.batches_sent, 1);
        dispatcher.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn full_batches_are_split_by_batch_size() {
        let recording = Arc::new(Recording::default());
        let dispatcher =
            Dispatcher::builder(config().batch_size(2).build().unwrap()).transport(recording.clone()).build().unwrap();

        for id in ["a", "b", "c", "d", "e"] {
            dispatcher.enqueue(event(id)).await.unwrap();
        }
        dispatcher.flush().await.unwrap();

        let mut batches = recording.batches.lock().unwrap().clone();
        batches.sort();
        assert_eq!(batches, vec![vec!["a", "b"], vec!["c", "d"], vec!["e"]]);
        dispatcher.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_rejected() {
        let dispatcher = Dispatcher::builder(config().build().unwrap())
            .transport(Arc::new(Recording::default()))
            .build()
            .unwrap();
        dispatcher.shutdown().await.unwrap();

        assert!(matches!(dispatcher.enqueue(event("late")).await, Err(DeliveryError::Closed)));
        assert!(matches!(
            dispatcher.shutdown().await,
            Err(DeliveryError::Lifecycle(crate::error::LifecycleError::AlreadyClosed))
        ));
        assert!(dispatcher.lifecycle().is_closed());
    }

    #[tokio::test]
    async fn flush_watch_only_counts_events_enqueued_before_it() {
        let dispatcher = Dispatcher::builder(config().build().unwrap())
            .transport(Arc::new(Recording::default()))
            .build()
            .unwrap();
        let shared = &dispatcher.shared;
        for id in ["a", "b"] {
            dispatcher.enqueue(event(id)).await.unwrap();
        }

        let guard = shared.watch_flush();
        assert_eq!(guard.watch.cutoff, 2);
        dispatcher.enqueue(event("c")).await.unwrap();

        shared.record_undelivered(Undelivered::Failed, &[1, 2]);
        shared.record_undelivered(Undelivered::Dropped, &[0]);
        assert_eq!(guard.watch.failed.load(Ordering::Acquire), 1);
        assert_eq!(guard.watch.dropped.load(Ordering::Acquire), 1);
        assert_eq!(shared.lock_queue().outstanding_before(guard.watch.cutoff), 2);

        drop(guard);
        assert!(shared.flushes.lock().unwrap().is_empty());
        dispatcher.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn generated_events_carry_uuid_ids() {
        let dispatcher = Dispatcher::builder(config().build().unwrap())
            .transport(Arc::new(Recording::default()))
            .build()
            .unwrap();
        let event = dispatcher.event(EventKind::TraceCreate, json!({"name": "checkout"})).unwrap();
        assert_eq!(event.id.len(), 36);
        assert_eq!(event.kind, EventKind::TraceCreate);
        dispatcher.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn tunables_are_validated() {
        let dispatcher = Dispatcher::builder(config().build().unwrap())
            .transport(Arc::new(Recording::default()))
            .build()
            .unwrap();
        let err = dispatcher
            .update_tunables(Tunables { batch_size: 0, flush_interval: Duration::from_secs(1) })
            .unwrap_err();
        assert_eq!(err, ConfigError::NonPositive { field: "batch_size" });

        let next = Tunables { batch_size: 7, flush_interval: Duration::from_millis(50) };
        dispatcher.update_tunables(next).unwrap();
        assert_eq!(dispatcher.tunables(), next);
        dispatcher.shutdown().await.unwrap();
    }
}
