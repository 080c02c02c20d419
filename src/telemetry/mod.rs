//! Structured delivery telemetry.
//!
//! Components report what they do as [`DeliveryEvent`]s. Events flow into a
//! [`TelemetrySink`], which is a `tower::Service<DeliveryEvent>`, so sinks
//! compose with ordinary tower combinators.
//!
//! ```rust
//! use tracepost::telemetry::{BatchEvent, DeliveryEvent, MemorySink, TelemetryHandle};
//! use std::time::Duration;
//!
//! let memory = MemorySink::new();
//! let telemetry = TelemetryHandle::new(memory.clone());
//! telemetry.emit(DeliveryEvent::Batch(BatchEvent::Sent { events: 10, duration: Duration::from_millis(35) }));
//! assert_eq!(memory.len(), 1);
//! ```
//!
//! Sinks are driven through [`TelemetryHandle`] only; the helper that polls a
//! sink is internal.
//!
//! ```compile_fail
//! use tracepost::telemetry::sinks::emit_best_effort;
//! ```

pub mod events;
pub mod sinks;

pub use events::{BackpressureEvent, BatchEvent, CircuitEvent, DeliveryEvent, LifecycleEvent, RetryEvent};
pub use sinks::{LogSink, MemorySink, NullSink, TelemetryHandle, TelemetrySink};
