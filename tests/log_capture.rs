//! Structured log output: secrets stay masked and state changes are visible.
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracepost::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use tracepost::id::{IdGenerator, RandomSource, RandomnessError};
use tracepost::DispatcherConfig;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone)]
struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture<F: FnOnce()>(f: F) -> String {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::fmt()
        .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
        .with_max_level(tracing::Level::DEBUG)
        .with_target(true)
        .without_time()
        .with_ansi(false)
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    let bytes = buffer.lock().unwrap().clone();
    String::from_utf8(bytes).unwrap()
}

#[test]
fn config_logs_never_contain_the_secret_key() {
    let logs = capture(|| {
        DispatcherConfig::builder()
            .public_key("pk-lf-visible-public")
            .secret_key("sk-lf-very-secret-value")
            .build()
            .unwrap();
    });

    assert!(logs.contains("dispatcher configuration validated"));
    assert!(!logs.contains("sk-lf-very-secret-value"));
    assert!(logs.contains("sk-l****alue"));
}

#[test]
fn breaker_transitions_are_logged() {
    let logs = capture(|| {
        let config = CircuitBreakerConfig::new(2, 1, Duration::from_secs(30)).unwrap();
        let breaker = CircuitBreaker::new("ingestion", config).unwrap();
        breaker.record_failure(&io::Error::other("reset"));
        breaker.record_failure(&io::Error::other("reset"));
    });

    assert!(logs.contains("circuit breaker → open"));
    assert!(logs.contains("threshold=2"));
    assert!(logs.contains("tracepost::circuit_breaker"));
}

#[derive(Debug)]
struct Exhausted;

impl RandomSource for Exhausted {
    fn fill(&self, _dest: &mut [u8]) -> Result<(), RandomnessError> {
        Err(RandomnessError("entropy pool unavailable".into()))
    }
}

#[test]
fn degraded_ids_warn_once_per_call() {
    let ids = IdGenerator::new(Arc::new(Exhausted), Default::default());
    let logs = capture(|| {
        let id = ids.must_generate();
        assert!(id.is_fallback());
    });

    assert_eq!(logs.matches("randomness unavailable; using fallback id").count(), 1);
    assert!(logs.contains("entropy pool unavailable"));
    assert_eq!(ids.failure_counter().get(), 1);
}
