//! Waits between delivery attempts.
//!
//! The retry loop in the dispatcher worker never calls the timer directly; it
//! asks a [`Sleeper`] for the backoff or `Retry-After` delay. Tests swap in a
//! [`TrackingSleeper`] to check which delays a retry sequence asked for.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Waits for a retry delay before the next delivery attempt.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Default sleeper, backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Records each retry delay and resolves at once.
///
/// Clones share the record, so a test keeps one handle and gives the other to
/// [`DispatcherBuilder::sleeper`](crate::DispatcherBuilder::sleeper).
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retry delays requested so far, oldest first.
    pub fn calls(&self) -> Vec<Duration> {
        self.delays.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.delays.lock().unwrap_or_else(PoisonError::into_inner).push(duration);
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_share_recorded_delays() {
        let sleeper = TrackingSleeper::new();
        let handle = sleeper.clone();

        sleeper.sleep(Duration::from_millis(100)).await;
        sleeper.sleep(Duration::from_secs(3)).await;

        assert_eq!(handle.calls(), vec![Duration::from_millis(100), Duration::from_secs(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_sleeper_waits_on_the_runtime_clock() {
        let start = tokio::time::Instant::now();
        TokioSleeper.sleep(Duration::from_millis(50)).await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
