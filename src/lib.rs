#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # tracepost
//!
//! Client-side delivery engine for trace, span, generation and score events.
//! Application code hands events to a [`Dispatcher`]; the dispatcher batches
//! them and ships them to an ingestion endpoint in the background without
//! blocking the caller.
//!
//! ## Features
//!
//! - **Circuit breaker** with lazy half-open recovery
//! - **Retry strategies** (exponential, linear, fixed, none) with network error classification
//! - **Backpressure**: queue fill monitoring with block, drop, or oversubscribe policies
//! - **Lifecycle management** with bounded, lossless-where-possible shutdown
//! - **Async error channel** for failures that happen after `enqueue` returned
//! - **Collision-resistant IDs** with a degraded fallback mode
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tracepost::{Dispatcher, DispatcherConfig, EventKind};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DispatcherConfig::builder()
//!         .public_key("pk-lf-1234")
//!         .secret_key("sk-lf-5678")
//!         .batch_size(50)
//!         .build()?;
//!     let dispatcher = Dispatcher::new(config)?;
//!
//!     let event = dispatcher.event(EventKind::TraceCreate, json!({ "name": "checkout" }))?;
//!     dispatcher.enqueue(event).await?;
//!
//!     dispatcher.shutdown().await?;
//!     for failure in dispatcher.errors().drain() {
//!         eprintln!("{}: {}", failure.operation, failure.error);
//!     }
//!     Ok(())
//! }
//! ```

pub mod async_error;
pub mod backpressure;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
mod hooks;
pub mod id;
pub mod jitter;
pub mod lifecycle;
pub mod prelude;
pub mod queue_monitor;
pub mod retry;
pub mod sleeper;
pub mod telemetry;
pub mod transport;

// Re-exports
pub use async_error::{AsyncError, AsyncErrorHandler, AsyncOperation};
pub use backpressure::{BackpressureConfig, BackpressureHandler, Decision, OverflowPolicy};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitOpenError, CircuitState};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{mask_secret, Credentials, DispatcherConfig, DynamicConfig, Tunables};
pub use dispatcher::{Dispatcher, DispatcherBuilder, DispatcherStats};
pub use error::{ConfigError, DeliveryError, IdError, LifecycleError, Result, TransportError};
pub use event::{Batch, Event, EventKind};
pub use id::{is_fallback_id, EventId, IdGenerator};
pub use jitter::Jitter;
pub use lifecycle::{LifecycleManager, LifecycleState};
pub use queue_monitor::{BackpressureLevel, QueueMonitor, QueueThresholds};
pub use retry::{ExponentialBackoff, FixedDelay, LinearBackoff, NoRetry, RetryStrategy, Retryable};
pub use sleeper::{Sleeper, TokioSleeper, TrackingSleeper};
pub use transport::{HttpTransport, Transport};
