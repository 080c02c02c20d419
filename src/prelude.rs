//! Convenient re-exports for common tracepost types.
pub use crate::{
    async_error::{AsyncError, AsyncErrorHandler, AsyncOperation, ErrorCallback},
    backpressure::{BackpressureHandler, Decision},
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState},
    config::{mask_secret, Credentials, DispatcherConfig, Tunables},
    dispatcher::{Dispatcher, DispatcherStats},
    error::{ConfigError, DeliveryError, TransportError},
    event::{Event, EventKind},
    id::{EventId, IdGenerator},
    queue_monitor::BackpressureLevel,
    retry::{ExponentialBackoff, FixedDelay, LinearBackoff, NoRetry, RetryStrategy, Retryable, MAX_BACKOFF},
    telemetry::{DeliveryEvent, LogSink, MemorySink, TelemetrySink},
    transport::Transport,
};
