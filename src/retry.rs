//! Retry strategies for batch delivery.
//!
//! Semantics:
//! - `attempt` is the zero-based index of the attempt that just failed, so the
//!   first retry decision is made with `attempt == 0`.
//! - A strategy retries while `attempt < max_retries` and the error is
//!   retryable: either it exposes the [`Retryable`] capability and says so, or
//!   the network classifier recognizes it as a transient failure.
//! - [`RetryStrategy::retry_delay_with_error`] honors a server-supplied
//!   retry-after hint, capped at the strategy's maximum delay.
//! - All delay arithmetic saturates at [`MAX_BACKOFF`] instead of overflowing.
//!
//! ```rust
//! use std::time::Duration;
//! use tracepost::{ExponentialBackoff, RetryStrategy, TransportError};
//!
//! let strategy = ExponentialBackoff::new(3)
//!     .with_initial_delay(Duration::from_millis(100))
//!     .with_jitter(false);
//! let err = TransportError::Server { status: 503, body: String::new() };
//! assert!(strategy.should_retry(0, &err));
//! assert_eq!(strategy.retry_delay(2), Duration::from_millis(400));
//! assert!(!strategy.should_retry(3, &err));
//! ```

mod network;

pub use network::{classify_network_error, is_retryable_network_error, NetworkErrorKind};

use crate::error::{DeliveryError, TransportError};
use crate::jitter::Jitter;
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Capability an error can expose to steer retry decisions.
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    /// Server-provided hint for how long to wait before the next attempt.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Finds the first error in `err`'s source chain that exposes [`Retryable`].
pub fn find_retryable<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a dyn Retryable> {
    let mut current: Option<&'a (dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(t) = e.downcast_ref::<TransportError>() {
            return Some(t);
        }
        if let Some(d) = e.downcast_ref::<DeliveryError>() {
            return Some(d);
        }
        current = e.source();
    }
    None
}

/// True when `err` says it is retryable or is a transient network failure.
pub fn is_retryable_error(err: &(dyn StdError + 'static)) -> bool {
    find_retryable(err).is_some_and(|r| r.is_retryable()) || is_retryable_network_error(err)
}

/// Server retry-after hint carried anywhere in `err`'s source chain.
pub fn retry_after_hint(err: &(dyn StdError + 'static)) -> Option<Duration> {
    find_retryable(err).and_then(|r| r.retry_after())
}

/// Decides whether and when a failed delivery attempt is repeated.
pub trait RetryStrategy: Send + Sync + fmt::Debug {
    fn should_retry(&self, attempt: u32, err: &(dyn StdError + 'static)) -> bool;

    fn retry_delay(&self, attempt: u32) -> Duration;

    /// Upper bound applied to server-supplied retry-after hints.
    fn max_delay(&self) -> Duration {
        MAX_BACKOFF
    }

    /// Delay before the next attempt, preferring the error's retry-after hint.
    fn retry_delay_with_error(&self, attempt: u32, err: &(dyn StdError + 'static)) -> Duration {
        match retry_after_hint(err) {
            Some(hint) => hint.min(self.max_delay()),
            None => self.retry_delay(attempt),
        }
    }
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    fn should_retry(&self, _attempt: u32, _err: &(dyn StdError + 'static)) -> bool {
        false
    }

    fn retry_delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }

    fn max_delay(&self) -> Duration {
        Duration::ZERO
    }

    fn retry_delay_with_error(&self, _attempt: u32, _err: &(dyn StdError + 'static)) -> Duration {
        Duration::ZERO
    }
}

/// Exponential backoff: `initial * multiplier^attempt`, capped at `max_delay`,
/// then optionally multiplied by a jitter factor in `[0.5, 1.5)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    max_retries: u32,
    jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_retries: 3,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries, ..Self::default() }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay.min(MAX_BACKOFF);
        self
    }

    /// Growth factor per attempt; values below 1.0 (or NaN) are clamped to 1.0.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier >= 1.0 { multiplier } else { 1.0 };
        self
    }

    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn should_retry(&self, attempt: u32, err: &(dyn StdError + 'static)) -> bool {
        attempt < self.max_retries && is_retryable_error(err)
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter {
            Jitter::Proportional.apply(base)
        } else {
            base
        }
    }

    fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

/// Linear backoff: `initial + attempt * increment`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearBackoff {
    initial_delay: Duration,
    increment: Duration,
    max_delay: Duration,
    max_retries: u32,
}

impl LinearBackoff {
    pub fn new(max_retries: u32, initial_delay: Duration, increment: Duration) -> Self {
        Self { initial_delay, increment, max_delay: Duration::from_secs(30), max_retries }
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay.min(MAX_BACKOFF);
        self
    }
}

impl RetryStrategy for LinearBackoff {
    fn should_retry(&self, attempt: u32, err: &(dyn StdError + 'static)) -> bool {
        attempt < self.max_retries && is_retryable_error(err)
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        self.increment
            .checked_mul(attempt)
            .and_then(|step| self.initial_delay.checked_add(step))
            .unwrap_or(MAX_BACKOFF)
            .min(self.max_delay)
    }

    fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

/// Constant delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    delay: Duration,
    max_retries: u32,
}

impl FixedDelay {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { delay: delay.min(MAX_BACKOFF), max_retries }
    }
}

impl RetryStrategy for FixedDelay {
    fn should_retry(&self, attempt: u32, err: &(dyn StdError + 'static)) -> bool {
        attempt < self.max_retries && is_retryable_error(err)
    }

    fn retry_delay(&self, _attempt: u32) -> Duration {
        self.delay
    }

    fn max_delay(&self) -> Duration {
        self.delay
    }
}
