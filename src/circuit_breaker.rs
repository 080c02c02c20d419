//! Circuit breaker guarding the ingestion endpoint.
//!
//! State machine:
//! - **Closed**: requests flow; consecutive counted failures are tallied and the
//!   circuit opens once they reach `failure_threshold`. Any success resets the tally.
//! - **Open**: requests are rejected until `timeout` has elapsed since the
//!   failure that opened the circuit. The move to half-open is lazy: it is
//!   observed by [`CircuitBreaker::state`] and materialized by the next admission.
//! - **HalfOpen**: at most `half_open_max_requests` probes are admitted.
//!   `success_threshold` consecutive successes close the circuit; any counted
//!   failure reopens it.
//!
//! Admission comes in two shapes:
//! - [`CircuitBreaker::allow`] + [`CircuitBreaker::record`]: a half-open slot
//!   taken by `allow` stays consumed until the next transition.
//! - [`CircuitBreaker::execute`]: the slot is held by a scoped guard for the
//!   duration of the call and handed back when it completes (or panics, or is
//!   cancelled), so sequential probes can accumulate `success_threshold`.
//!
//! State-change listeners run asynchronously, never under the breaker lock.

use crate::clock::{Clock, MonotonicClock};
use crate::hooks::{spawn_detached, HookSlot};
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invalid breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CircuitBreakerError {
    #[error("failure_threshold must be > 0 (got {0})")]
    InvalidFailureThreshold(u32),
    #[error("success_threshold must be > 0 (got {0})")]
    InvalidSuccessThreshold(u32),
    #[error("timeout must be > 0 (got {0:?})")]
    InvalidTimeout(Duration),
    #[error("half_open_max_requests must be > 0 (got {0})")]
    InvalidHalfOpenLimit(u32),
}

/// Returned when the breaker refuses a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit breaker '{name}' is open; retry in {retry_in:?}")]
pub struct CircuitOpenError {
    pub name: String,
    pub retry_in: Duration,
}

/// Outcome of [`CircuitBreaker::execute`]: either the breaker refused, or the
/// guarded operation itself failed.
#[derive(Debug)]
pub enum CircuitError<E> {
    Open(CircuitOpenError),
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, CircuitError::Open(_))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            CircuitError::Open(_) => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for CircuitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitError::Open(open) => fmt::Display::fmt(open, f),
            CircuitError::Inner(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl<E: StdError + 'static> StdError for CircuitError<E> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            CircuitError::Open(open) => Some(open),
            CircuitError::Inner(e) => Some(e),
        }
    }
}

/// Breaker thresholds. Construct through [`CircuitBreakerConfig::new`] or
/// `Default` so invalid values are rejected up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: u32,
    success_threshold: u32,
    timeout: Duration,
    half_open_max_requests: u32,
    enabled: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
            enabled: true,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(
        failure_threshold: u32,
        success_threshold: u32,
        timeout: Duration,
    ) -> Result<Self, CircuitBreakerError> {
        let config = Self { failure_threshold, success_threshold, timeout, ..Self::default() };
        config.validate()?;
        Ok(config)
    }

    pub fn with_half_open_max_requests(mut self, limit: u32) -> Result<Self, CircuitBreakerError> {
        self.half_open_max_requests = limit;
        self.validate()?;
        Ok(self)
    }

    /// A breaker that admits everything and never opens.
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }

    pub fn validate(&self) -> Result<(), CircuitBreakerError> {
        if !self.enabled {
            return Ok(());
        }
        if self.failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold(self.failure_threshold));
        }
        if self.success_threshold == 0 {
            return Err(CircuitBreakerError::InvalidSuccessThreshold(self.success_threshold));
        }
        if self.timeout.is_zero() {
            return Err(CircuitBreakerError::InvalidTimeout(self.timeout));
        }
        if self.half_open_max_requests == 0 {
            return Err(CircuitBreakerError::InvalidHalfOpenLimit(self.half_open_max_requests));
        }
        Ok(())
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn success_threshold(&self) -> u32 {
        self.success_threshold
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn half_open_max_requests(&self) -> u32 {
        self.half_open_max_requests
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn timeout_millis(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Receives every state transition, asynchronously and outside the breaker lock.
pub trait StateListener: Send + Sync + 'static {
    fn on_state_change(&self, name: &str, from: CircuitState, to: CircuitState);
}

impl<F> StateListener for F
where
    F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
{
    fn on_state_change(&self, name: &str, from: CircuitState, to: CircuitState) {
        self(name, from, to)
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub half_open_in_flight: u32,
    /// Clock reading of the most recent counted failure.
    pub last_failure_millis: Option<u64>,
    pub rejected: u64,
    pub transitions: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    successes: u32,
    half_open_admitted: u32,
    opened_at: u64,
    last_failure_at: Option<u64>,
    // Bumped on every transition so a stale probe guard cannot release a slot
    // belonging to a later half-open window.
    generation: u64,
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    from: CircuitState,
    to: CircuitState,
    failures: u32,
}

enum Admission {
    Free,
    Probe { generation: u64 },
    Rejected { retry_in: Duration },
}

struct Core {
    state: RwLock<BreakerState>,
    rejected: AtomicU64,
    transitions: AtomicU64,
    listener: HookSlot<dyn StateListener>,
}

/// Decides whether an error counts against the breaker.
pub type FailurePredicate = Arc<dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync>;

/// Thread-safe circuit breaker. Clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    core: Arc<Core>,
    clock: Arc<dyn Clock>,
    is_failure: FailurePredicate,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .field("listener", &self.core.listener)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Result<Self, CircuitBreakerError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            core: Arc::new(Core {
                state: RwLock::new(BreakerState {
                    state: CircuitState::Closed,
                    failures: 0,
                    successes: 0,
                    half_open_admitted: 0,
                    opened_at: 0,
                    last_failure_at: None,
                    generation: 0,
                }),
                rejected: AtomicU64::new(0),
                transitions: AtomicU64::new(0),
                listener: HookSlot::empty(),
            }),
            clock: Arc::new(MonotonicClock::default()),
            is_failure: Arc::new(|_: &(dyn StdError + 'static)| true),
        })
    }

    /// Replace the clock (tests use [`crate::ManualClock`]).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Decide which errors count toward opening the circuit. Errors rejected
    /// by the predicate are treated like successes: the endpoint answered.
    pub fn with_failure_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    {
        self.is_failure = Arc::new(predicate);
        self
    }

    pub fn set_listener<L: StateListener>(&self, listener: L) {
        self.core.listener.set(Box::new(listener));
    }

    pub fn clear_listener(&self) {
        self.core.listener.clear();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. Reports `HalfOpen` once the open timeout has elapsed
    /// without mutating anything.
    pub fn state(&self) -> CircuitState {
        let now = self.clock.now_millis();
        self.observed(&self.read(), now)
    }

    /// Admission check for callers that report outcomes through [`record`](Self::record).
    pub fn allow(&self) -> bool {
        !matches!(self.admit(), Admission::Rejected { .. })
    }

    /// Reports the outcome of an admitted request. `None` is a success.
    pub fn record(&self, error: Option<&(dyn StdError + 'static)>) {
        if !self.config.enabled {
            return;
        }
        let counted = error.is_some_and(|e| (self.is_failure)(e));
        let now = self.clock.now_millis();

        let (lazy, outcome) = {
            let mut st = self.write();
            let lazy = self.materialize(&mut st, now);
            let outcome =
                if counted { self.on_failure(&mut st, now) } else { self.on_success(&mut st, now) };
            (lazy, outcome)
        };

        self.publish(lazy);
        self.publish(outcome);
    }

    pub fn record_success(&self) {
        self.record(None);
    }

    pub fn record_failure(&self, error: &(dyn StdError + 'static)) {
        self.record(Some(error));
    }

    /// Runs `operation` if admitted and records its outcome.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, CircuitError<E>>
    where
        E: StdError + 'static,
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        struct ProbeGuard<'a> {
            breaker: &'a CircuitBreaker,
            generation: Option<u64>,
        }

        impl Drop for ProbeGuard<'_> {
            fn drop(&mut self) {
                if let Some(generation) = self.generation {
                    self.breaker.release_probe(generation);
                }
            }
        }

        let generation = match self.admit() {
            Admission::Free => None,
            Admission::Probe { generation } => Some(generation),
            Admission::Rejected { retry_in } => {
                return Err(CircuitError::Open(CircuitOpenError {
                    name: self.name.to_string(),
                    retry_in,
                }));
            }
        };
        let guard = ProbeGuard { breaker: self, generation };

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) => self.record_failure(e),
        }
        drop(guard);

        result.map_err(CircuitError::Inner)
    }

    /// Forces the breaker back to `Closed` and clears all counters.
    pub fn reset(&self) {
        let now = self.clock.now_millis();
        let transition = {
            let mut st = self.write();
            st.failures = 0;
            st.last_failure_at = None;
            if st.state == CircuitState::Closed {
                None
            } else {
                Some(Self::transition(&mut st, CircuitState::Closed, now))
            }
        };
        self.publish(transition);
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let now = self.clock.now_millis();
        let st = self.read();
        CircuitBreakerStats {
            state: self.observed(&st, now),
            consecutive_failures: st.failures,
            consecutive_successes: st.successes,
            half_open_in_flight: st.half_open_admitted,
            last_failure_millis: st.last_failure_at,
            rejected: self.core.rejected.load(Ordering::Relaxed),
            transitions: self.core.transitions.load(Ordering::Relaxed),
        }
    }

    /// Time left before an open circuit starts admitting probes.
    pub fn retry_in(&self) -> Duration {
        let now = self.clock.now_millis();
        self.remaining_open(&self.read(), now)
    }

    fn admit(&self) -> Admission {
        if !self.config.enabled {
            return Admission::Free;
        }
        let now = self.clock.now_millis();

        {
            let st = self.read();
            match self.observed(&st, now) {
                CircuitState::Closed => return Admission::Free,
                CircuitState::Open => {
                    let retry_in = self.remaining_open(&st, now);
                    drop(st);
                    self.core.rejected.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(breaker = %self.name, ?retry_in, "circuit open; request rejected");
                    return Admission::Rejected { retry_in };
                }
                CircuitState::HalfOpen => {}
            }
        }

        let (lazy, admission) = {
            let mut st = self.write();
            let lazy = self.materialize(&mut st, now);
            let current = st.state;
            let admission = match current {
                CircuitState::Closed => Admission::Free,
                CircuitState::Open => Admission::Rejected { retry_in: self.remaining_open(&st, now) },
                CircuitState::HalfOpen if st.half_open_admitted < self.config.half_open_max_requests => {
                    st.half_open_admitted += 1;
                    Admission::Probe { generation: st.generation }
                }
                CircuitState::HalfOpen => Admission::Rejected { retry_in: Duration::ZERO },
            };
            (lazy, admission)
        };

        if matches!(admission, Admission::Rejected { .. }) {
            self.core.rejected.fetch_add(1, Ordering::Relaxed);
        }
        self.publish(lazy);
        admission
    }

    fn release_probe(&self, generation: u64) {
        let mut st = self.write();
        if st.generation == generation && st.state == CircuitState::HalfOpen && st.half_open_admitted > 0 {
            st.half_open_admitted -= 1;
        }
    }

    fn on_failure(&self, st: &mut BreakerState, now: u64) -> Option<Transition> {
        st.last_failure_at = Some(now);
        st.failures = st.failures.saturating_add(1);
        match st.state {
            CircuitState::Closed => {
                st.successes = 0;
                (st.failures >= self.config.failure_threshold)
                    .then(|| Self::transition(st, CircuitState::Open, now))
            }
            CircuitState::HalfOpen => Some(Self::transition(st, CircuitState::Open, now)),
            CircuitState::Open => None,
        }
    }

    fn on_success(&self, st: &mut BreakerState, now: u64) -> Option<Transition> {
        match st.state {
            CircuitState::Closed => {
                st.failures = 0;
                None
            }
            CircuitState::HalfOpen => {
                st.successes = st.successes.saturating_add(1);
                (st.successes >= self.config.success_threshold)
                    .then(|| Self::transition(st, CircuitState::Closed, now))
            }
            CircuitState::Open => None,
        }
    }

    fn transition(st: &mut BreakerState, to: CircuitState, now: u64) -> Transition {
        let from = st.state;
        let failures = st.failures;
        st.state = to;
        st.generation = st.generation.wrapping_add(1);
        st.half_open_admitted = 0;
        st.successes = 0;
        match to {
            CircuitState::Closed => st.failures = 0,
            CircuitState::Open => st.opened_at = now,
            CircuitState::HalfOpen => {}
        }
        Transition { from, to, failures }
    }

    fn materialize(&self, st: &mut BreakerState, now: u64) -> Option<Transition> {
        (st.state == CircuitState::Open && self.timeout_elapsed(st, now))
            .then(|| Self::transition(st, CircuitState::HalfOpen, now))
    }

    fn observed(&self, st: &BreakerState, now: u64) -> CircuitState {
        if st.state == CircuitState::Open && self.timeout_elapsed(st, now) {
            CircuitState::HalfOpen
        } else {
            st.state
        }
    }

    fn timeout_elapsed(&self, st: &BreakerState, now: u64) -> bool {
        now.saturating_sub(st.opened_at) >= self.config.timeout_millis()
    }

    fn remaining_open(&self, st: &BreakerState, now: u64) -> Duration {
        if st.state != CircuitState::Open {
            return Duration::ZERO;
        }
        let elapsed = now.saturating_sub(st.opened_at);
        Duration::from_millis(self.config.timeout_millis().saturating_sub(elapsed))
    }

    fn publish(&self, transition: Option<Transition>) {
        let Some(t) = transition else { return };
        self.core.transitions.fetch_add(1, Ordering::Relaxed);

        match (t.from, t.to) {
            (_, CircuitState::HalfOpen) => {
                tracing::info!(breaker = %self.name, "circuit breaker → half-open");
            }
            (CircuitState::HalfOpen, CircuitState::Open) => {
                tracing::warn!(breaker = %self.name, failures = t.failures, "circuit breaker probe failed → open");
            }
            (_, CircuitState::Open) => {
                tracing::error!(
                    breaker = %self.name,
                    failures = t.failures,
                    threshold = self.config.failure_threshold,
                    "circuit breaker → open"
                );
            }
            (_, CircuitState::Closed) => {
                tracing::info!(breaker = %self.name, "circuit breaker → closed");
            }
        }

        if let Some(listener) = self.core.listener.get() {
            let name = Arc::clone(&self.name);
            spawn_detached("circuit_state", move || listener.on_state_change(&name, t.from, t.to));
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BreakerState> {
        self.core.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BreakerState> {
        self.core.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[derive(Debug)]
    struct TestError(&'static str);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test error: {}", self.0)
        }
    }

    impl StdError for TestError {}

    fn breaker(failures: u32, successes: u32, timeout_ms: u64, clock: &ManualClock) -> CircuitBreaker {
        let config = CircuitBreakerConfig::new(failures, successes, Duration::from_millis(timeout_ms))
            .expect("valid config");
        CircuitBreaker::new("test", config).expect("valid breaker").with_clock(clock.clone())
    }

    fn fail(b: &CircuitBreaker) {
        b.record_failure(&TestError("fail"));
    }

    #[test]
    fn rejects_invalid_config() {
        assert_eq!(
            CircuitBreakerConfig::new(0, 1, Duration::from_secs(1)),
            Err(CircuitBreakerError::InvalidFailureThreshold(0))
        );
        assert_eq!(
            CircuitBreakerConfig::new(1, 0, Duration::from_secs(1)),
            Err(CircuitBreakerError::InvalidSuccessThreshold(0))
        );
        assert_eq!(
            CircuitBreakerConfig::new(1, 1, Duration::ZERO),
            Err(CircuitBreakerError::InvalidTimeout(Duration::ZERO))
        );
        assert_eq!(
            CircuitBreakerConfig::default().with_half_open_max_requests(0),
            Err(CircuitBreakerError::InvalidHalfOpenLimit(0))
        );
    }

    #[test]
    fn starts_closed_and_allows() {
        let b = breaker(3, 1, 1000, &ManualClock::new());
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.allow());
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let clock = ManualClock::new();
        let b = breaker(2, 1, 1000, &clock);

        fail(&b);
        assert_eq!(b.state(), CircuitState::Closed);
        fail(&b);
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.allow());
        assert_eq!(b.stats().rejected, 1);
        assert_eq!(b.retry_in(), Duration::from_millis(1000));
    }

    #[test]
    fn success_in_closed_resets_failure_count() {
        let b = breaker(2, 1, 1000, &ManualClock::new());
        fail(&b);
        b.record_success();
        fail(&b);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.stats().consecutive_failures, 1);
    }

    #[test]
    fn half_open_is_observed_lazily_without_mutation() {
        let clock = ManualClock::new();
        let b = breaker(1, 1, 100, &clock);
        fail(&b);
        assert_eq!(b.stats().transitions, 1);

        clock.advance(100);
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert_eq!(b.stats().transitions, 1, "observing must not transition");

        assert!(b.allow());
        assert_eq!(b.stats().transitions, 2);
    }

    #[test]
    fn half_open_admits_exactly_max_requests_via_allow() {
        let clock = ManualClock::new();
        let config = CircuitBreakerConfig::new(1, 2, Duration::from_millis(50))
            .and_then(|c| c.with_half_open_max_requests(2))
            .expect("valid config");
        let b = CircuitBreaker::new("probe", config).expect("valid").with_clock(clock.clone());

        fail(&b);
        clock.advance(50);
        assert!(b.allow());
        assert!(b.allow());
        assert!(!b.allow());
        // successes do not hand slots back
        b.record_success();
        assert!(!b.allow());
    }

    #[test]
    fn one_probe_slot_still_closes_after_enough_recorded_successes() {
        let clock = ManualClock::new();
        let b = breaker(1, 2, 10, &clock);
        fail(&b);
        clock.advance(10);

        assert!(b.allow());
        b.record(None);
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.record(None);
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.allow());
    }

    #[test]
    fn half_open_failure_reopens_and_restarts_timer() {
        let clock = ManualClock::new();
        let b = breaker(1, 1, 100, &clock);
        fail(&b);
        clock.advance(100);
        assert!(b.allow());

        clock.advance(30);
        fail(&b);
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.retry_in(), Duration::from_millis(100));
        clock.advance(99);
        assert!(!b.allow());
        clock.advance(1);
        assert!(b.allow());
    }

    #[test]
    fn uncounted_errors_behave_like_successes() {
        let b = breaker(1, 1, 1000, &ManualClock::new())
            .with_failure_predicate(|e| !e.to_string().contains("validation"));
        b.record_failure(&TestError("validation"));
        assert_eq!(b.state(), CircuitState::Closed);
        b.record_failure(&TestError("boom"));
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn reset_forces_closed() {
        let b = breaker(1, 1, 60_000, &ManualClock::new());
        fail(&b);
        assert_eq!(b.state(), CircuitState::Open);
        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.stats().consecutive_failures, 0);
        assert!(b.allow());
    }

    #[test]
    fn disabled_breaker_never_opens() {
        let b = CircuitBreaker::new("off", CircuitBreakerConfig::disabled()).expect("valid");
        for _ in 0..100 {
            fail(&b);
        }
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.allow());
    }

    #[tokio::test]
    async fn execute_short_circuits_when_open() {
        let clock = ManualClock::new();
        let b = breaker(1, 1, 1000, &clock);
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let first: Result<(), _> = b
            .execute(|| async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(TestError("down"))
            })
            .await;
        assert!(matches!(first, Err(CircuitError::Inner(_))));

        let c = calls.clone();
        let second = b
            .execute(|| async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(1)
            })
            .await;
        assert!(second.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn execute_hands_probe_slot_back_so_sequential_probes_close() {
        let clock = ManualClock::new();
        let b = breaker(1, 2, 10, &clock);
        fail(&b);
        clock.advance(10);

        let first = b.execute(|| async { Ok::<_, TestError>(()) }).await;
        assert!(first.is_ok());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        let second = b.execute(|| async { Ok::<_, TestError>(()) }).await;
        assert!(second.is_ok());
        assert_eq!(b.state(), CircuitState::Closed);
    }

    fn should_panic_now() -> bool {
        true
    }

    #[tokio::test]
    async fn probe_slot_released_when_operation_panics() {
        let clock = ManualClock::new();
        let b = breaker(1, 2, 10, &clock);
        fail(&b);
        clock.advance(10);

        let b2 = b.clone();
        let handle = tokio::spawn(async move {
            let _ = b2
                .execute(|| async {
                    if should_panic_now() {
                        panic!("boom");
                    }
                    Ok::<(), TestError>(())
                })
                .await;
        });
        assert!(handle.await.is_err());

        assert_eq!(b.stats().half_open_in_flight, 0);
        assert!(b.allow());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_allow_in_half_open_admits_exactly_the_limit() {
        let clock = ManualClock::new();
        let config = CircuitBreakerConfig::new(1, 5, Duration::from_millis(10))
            .and_then(|c| c.with_half_open_max_requests(3))
            .expect("valid config");
        let b = CircuitBreaker::new("stress", config).expect("valid").with_clock(clock.clone());
        fail(&b);
        clock.advance(10);

        let barrier = Arc::new(tokio::sync::Barrier::new(32));
        let tasks = (0..32).map(|_| {
            let b = b.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                b.allow()
            })
        });
        let admitted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();

        assert_eq!(admitted, 3);
        assert_eq!(b.stats().rejected, 29);
    }

    #[test]
    fn listener_sees_every_transition_in_order() {
        let clock = ManualClock::new();
        let b = breaker(1, 1, 10, &clock);
        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        b.set_listener(move |name: &str, from: CircuitState, to: CircuitState| {
            let _ = tx.lock().unwrap().send((name.to_string(), from, to));
        });

        fail(&b);
        let first = rx.recv_timeout(Duration::from_secs(5)).expect("open notification");
        clock.advance(10);
        assert!(b.allow());
        let second = rx.recv_timeout(Duration::from_secs(5)).expect("half-open notification");
        b.record_success();
        let third = rx.recv_timeout(Duration::from_secs(5)).expect("closed notification");

        assert_eq!(first, ("test".to_string(), CircuitState::Closed, CircuitState::Open));
        assert_eq!(second.1, CircuitState::Open);
        assert_eq!(second.2, CircuitState::HalfOpen);
        assert_eq!(third.2, CircuitState::Closed);
    }

    #[test]
    fn panicking_listener_does_not_disturb_the_breaker() {
        let b = breaker(1, 1, 1000, &ManualClock::new());
        b.set_listener(|_: &str, _: CircuitState, _: CircuitState| panic!("listener bug"));
        fail(&b);
        assert_eq!(b.state(), CircuitState::Open);
        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
    }
}
