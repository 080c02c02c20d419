//! Error taxonomy for event delivery.
//!
//! Synchronous operations (`enqueue`, `flush`, `shutdown`, configuration)
//! return [`DeliveryError`]. Failures that happen on background senders are
//! reported through [`crate::AsyncErrorHandler`] instead, carrying the same
//! error types as their cause.

use crate::circuit_breaker::{CircuitBreakerError, CircuitOpenError};
use crate::retry::{NetworkErrorKind, Retryable};
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results produced by the dispatcher.
pub type Result<T, E = DeliveryError> = std::result::Result<T, E>;

/// Errors surfaced synchronously to callers of the dispatcher.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("dispatcher is closed; event rejected")]
    Closed,

    #[error("queue full ({size}/{capacity}); event dropped")]
    BatchDropped { size: usize, capacity: usize },

    #[error("queue stayed full for {waited:?}; enqueue abandoned")]
    BlockTimeout { waited: Duration },

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Counts cover only events queued before the flush began.
    #[error("flush incomplete: {pending} event(s) still pending, {failed} failed, {dropped} dropped")]
    Flush { pending: usize, failed: u64, dropped: u64 },

    #[error("shutdown incomplete: {lost} event(s) lost")]
    Shutdown { lost: usize },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Id(#[from] IdError),
}

impl DeliveryError {
    /// True for the drop sentinel returned by `enqueue` under the drop policy.
    pub fn is_dropped(&self) -> bool {
        matches!(self, DeliveryError::BatchDropped { .. })
    }

    /// Events the caller should consider lost because of this error.
    pub fn lost_events(&self) -> usize {
        match self {
            DeliveryError::Shutdown { lost } => *lost,
            DeliveryError::BatchDropped { .. } => 1,
            _ => 0,
        }
    }
}

impl Retryable for DeliveryError {
    fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Transport(err) => err.is_retryable(),
            DeliveryError::CircuitOpen(_) | DeliveryError::BlockTimeout { .. } => true,
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            DeliveryError::Transport(err) => err.retry_after(),
            DeliveryError::CircuitOpen(err) => Some(err.retry_in),
            _ => None,
        }
    }
}

/// Invalid or incomplete configuration. Always reported at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing credentials: provide a public/secret key pair or a bearer token")]
    MissingCredentials,

    #[error("invalid credentials: {0}")]
    InvalidCredentials(&'static str),

    #[error("block_on_full and drop_on_full are mutually exclusive")]
    ConflictingOverflowPolicy,

    #[error("{field} must be greater than zero")]
    NonPositive { field: &'static str },

    #[error("invalid base url '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("invalid value '{value}' for {key}")]
    InvalidEnv { key: &'static str, value: String },

    #[error(transparent)]
    CircuitBreaker(#[from] CircuitBreakerError),

    #[error("failed to build http client: {0}")]
    HttpClient(String),

    #[error("no tokio runtime available to run background senders")]
    NoRuntime,
}

/// Failure of a single ingestion request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request cancelled")]
    Cancelled,

    #[error("network error ({kind}): {message}")]
    Network { kind: NetworkErrorKind, message: String },

    #[error("authentication rejected (HTTP {status})")]
    Auth { status: u16 },

    #[error("rate limited (HTTP 429)")]
    RateLimited { retry_after: Option<Duration> },

    #[error("server error (HTTP {status})")]
    Server { status: u16, body: String },

    #[error("request rejected (HTTP {status})")]
    Client { status: u16, body: String },

    #[error("{retryable} of {total} event(s) rejected with a retryable status")]
    PartialFailure { retryable: usize, total: usize, retry_after: Option<Duration> },

    #[error("malformed ingestion response: {0}")]
    Decode(String),

    #[error("failed to encode batch: {0}")]
    Encode(String),
}

impl TransportError {
    /// Maps an HTTP status (outside the success range) to an error.
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            401 | 403 => TransportError::Auth { status },
            429 => TransportError::RateLimited { retry_after },
            500..=599 => TransportError::Server { status, body },
            _ => TransportError::Client { status, body },
        }
    }

    /// Network-level classification, when the failure happened below HTTP.
    pub fn network_kind(&self) -> Option<NetworkErrorKind> {
        match self {
            TransportError::Timeout(_) => Some(NetworkErrorKind::Timeout),
            TransportError::Cancelled => Some(NetworkErrorKind::Cancelled),
            TransportError::Network { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// HTTP status, when the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Auth { status }
            | TransportError::Server { status, .. }
            | TransportError::Client { status, .. } => Some(*status),
            TransportError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}

impl Retryable for TransportError {
    fn is_retryable(&self) -> bool {
        match self {
            TransportError::RateLimited { .. }
            | TransportError::Server { .. }
            | TransportError::PartialFailure { .. } => true,
            TransportError::Client { status, .. } => *status == 408,
            other => other.network_kind().is_some_and(NetworkErrorKind::is_retryable),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::RateLimited { retry_after } | TransportError::PartialFailure { retry_after, .. } => {
                *retry_after
            }
            _ => None,
        }
    }
}

/// Lifecycle transition refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("already shutting down or closed")]
    AlreadyClosed,
}

/// Identifier generation failed even in fallback mode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("system clock is before the unix epoch; cannot build a fallback id")]
    ClockBeforeEpoch,
}
