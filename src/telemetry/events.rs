use crate::backpressure::Decision;
use crate::circuit_breaker::CircuitState;
use crate::queue_monitor::BackpressureLevel;
use std::fmt;
use std::time::Duration;

/// Structured events emitted while delivering batches.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryEvent {
    Circuit(CircuitEvent),
    Retry(RetryEvent),
    Backpressure(BackpressureEvent),
    Batch(BatchEvent),
    Lifecycle(LifecycleEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitEvent {
    Transition { from: CircuitState, to: CircuitState },
    /// A batch was refused because the circuit is open.
    Rejected { retry_in: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryEvent {
    /// About to sleep before retrying. `attempt` is the 0-based index of the
    /// attempt that just failed.
    Attempt { attempt: u32, delay: Duration },
    /// The strategy gave up.
    Exhausted { attempts: u32, elapsed: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureEvent {
    LevelChanged { from: BackpressureLevel, to: BackpressureLevel, size: usize },
    /// A non-allow admission decision.
    Decided { decision: Decision, size: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEvent {
    Sent { events: usize, duration: Duration },
    /// A 207 response: some events were accepted, some were not.
    Partial { accepted: usize, retryable: usize, rejected: usize },
    Failed { events: usize, retryable: bool },
    Requeued { events: usize, requeue_count: u32 },
    Dropped { events: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    ShutdownStarted { pending: usize },
    Closed { lost: usize },
    Idle { idle: Duration },
}

impl fmt::Display for DeliveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryEvent::Circuit(event) => write!(f, "Circuit::{event}"),
            DeliveryEvent::Retry(event) => write!(f, "Retry::{event}"),
            DeliveryEvent::Backpressure(event) => write!(f, "Backpressure::{event}"),
            DeliveryEvent::Batch(event) => write!(f, "Batch::{event}"),
            DeliveryEvent::Lifecycle(event) => write!(f, "Lifecycle::{event}"),
        }
    }
}

impl fmt::Display for CircuitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitEvent::Transition { from, to } => write!(f, "Transition({} -> {})", from.as_str(), to.as_str()),
            CircuitEvent::Rejected { retry_in } => write!(f, "Rejected(retry_in={retry_in:?})"),
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Attempt { attempt, delay } => write!(f, "Attempt(#{attempt}, delay={delay:?})"),
            RetryEvent::Exhausted { attempts, elapsed } => {
                write!(f, "Exhausted(attempts={attempts}, elapsed={elapsed:?})")
            }
        }
    }
}

impl fmt::Display for BackpressureEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackpressureEvent::LevelChanged { from, to, size } => {
                write!(f, "LevelChanged({} -> {}, size={size})", from.name(), to.name())
            }
            BackpressureEvent::Decided { decision, size } => write!(f, "Decided({decision}, size={size})"),
        }
    }
}

impl fmt::Display for BatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchEvent::Sent { events, duration } => write!(f, "Sent(events={events}, duration={duration:?})"),
            BatchEvent::Partial { accepted, retryable, rejected } => {
                write!(f, "Partial(accepted={accepted}, retryable={retryable}, rejected={rejected})")
            }
            BatchEvent::Failed { events, retryable } => write!(f, "Failed(events={events}, retryable={retryable})"),
            BatchEvent::Requeued { events, requeue_count } => {
                write!(f, "Requeued(events={events}, count={requeue_count})")
            }
            BatchEvent::Dropped { events } => write!(f, "Dropped(events={events})"),
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::ShutdownStarted { pending } => write!(f, "ShutdownStarted(pending={pending})"),
            LifecycleEvent::Closed { lost } => write!(f, "Closed(lost={lost})"),
            LifecycleEvent::Idle { idle } => write!(f, "Idle({idle:?})"),
        }
    }
}
