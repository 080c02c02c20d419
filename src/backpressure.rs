//! Admission control for the event queue.
//!
//! [`BackpressureHandler`] wraps a [`QueueMonitor`] and answers one question
//! per enqueue: may this event go in? Below the overflow level the answer is
//! always [`Decision::Allow`]. At overflow the configured [`OverflowPolicy`]
//! decides between blocking the producer, dropping the event, or letting the
//! queue grow past capacity.

use crate::error::ConfigError;
use crate::hooks::{guarded, HookSlot};
use crate::queue_monitor::{BackpressureLevel, LevelListener, QueueMonitorStats, QueueState, QueueThresholds};

pub use crate::queue_monitor::QueueMonitor;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Admission outcome for a single enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Block,
    Drop,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Decision::Allow => "allow",
            Decision::Block => "block",
            Decision::Drop => "drop",
        })
    }
}

/// What to do once the queue reaches the overflow level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    Block,
    Drop,
    /// Keep admitting; the queue grows past its nominal capacity.
    #[default]
    Oversubscribe,
}

impl OverflowPolicy {
    /// Maps the two configuration flags onto a policy. Setting both is an error.
    pub fn from_flags(block_on_full: bool, drop_on_full: bool) -> Result<Self, ConfigError> {
        match (block_on_full, drop_on_full) {
            (true, true) => Err(ConfigError::ConflictingOverflowPolicy),
            (true, false) => Ok(OverflowPolicy::Block),
            (false, true) => Ok(OverflowPolicy::Drop),
            (false, false) => Ok(OverflowPolicy::Oversubscribe),
        }
    }
}

/// Backpressure handler configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackpressureConfig {
    pub capacity: usize,
    pub thresholds: QueueThresholds,
    pub block_on_full: bool,
    pub drop_on_full: bool,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            thresholds: QueueThresholds::default(),
            block_on_full: false,
            drop_on_full: false,
        }
    }
}

/// Counters and the latest queue snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackpressureStats {
    pub total_decisions: u64,
    pub allowed_count: u64,
    pub blocked_count: u64,
    pub dropped_count: u64,
    pub level: BackpressureLevel,
    pub policy: OverflowPolicy,
    pub queue: QueueState,
    pub monitor: QueueMonitorStats,
}

/// Notified of every Block or Drop decision. Runs synchronously on the
/// enqueueing task with no lock held; it must not block.
pub trait BackpressureListener: Send + Sync + 'static {
    fn on_decision(&self, decision: Decision, state: &QueueState);
}

impl<F> BackpressureListener for F
where
    F: Fn(Decision, &QueueState) + Send + Sync + 'static,
{
    fn on_decision(&self, decision: Decision, state: &QueueState) {
        self(decision, state)
    }
}

#[derive(Debug, Default)]
struct DecisionCounters {
    allowed: AtomicU64,
    blocked: AtomicU64,
    dropped: AtomicU64,
}

/// Queue admission policy layered over a [`QueueMonitor`].
#[derive(Debug)]
pub struct BackpressureHandler {
    monitor: QueueMonitor,
    policy: OverflowPolicy,
    counters: DecisionCounters,
    listener: HookSlot<dyn BackpressureListener>,
}

impl BackpressureHandler {
    /// Fails if both `block_on_full` and `drop_on_full` are set.
    pub fn new(config: BackpressureConfig) -> Result<Self, ConfigError> {
        let policy = OverflowPolicy::from_flags(config.block_on_full, config.drop_on_full)?;
        let monitor = QueueMonitor::new(config.capacity, config.thresholds)?;
        Ok(Self { monitor, policy, counters: DecisionCounters::default(), listener: HookSlot::empty() })
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn monitor(&self) -> &QueueMonitor {
        &self.monitor
    }

    pub fn set_listener<L: BackpressureListener>(&self, listener: L) {
        self.listener.set(Box::new(listener));
    }

    /// Forwards level changes of the underlying monitor.
    pub fn set_level_listener<L: LevelListener>(&self, listener: L) {
        self.monitor.set_listener(listener);
    }

    /// Decide whether an event may be admitted given the current queue size.
    pub fn decide(&self, current_size: usize) -> Decision {
        let level = self.monitor.update(current_size);
        let decision = match (level, self.policy) {
            (BackpressureLevel::Overflow, OverflowPolicy::Block) => Decision::Block,
            (BackpressureLevel::Overflow, OverflowPolicy::Drop) => Decision::Drop,
            _ => Decision::Allow,
        };

        match decision {
            Decision::Allow => {
                self.counters.allowed.fetch_add(1, Ordering::Relaxed);
                return decision;
            }
            Decision::Block => {
                self.counters.blocked.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(size = current_size, capacity = self.monitor.capacity(), "queue full; blocking producer");
            }
            Decision::Drop => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(size = current_size, capacity = self.monitor.capacity(), "queue full; dropping event");
            }
        }

        if let Some(listener) = self.listener.get() {
            let state = self.monitor.state();
            guarded("backpressure", || listener.on_decision(decision, &state));
        }
        decision
    }

    pub fn dropped_count(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn blocked_count(&self) -> u64 {
        self.counters.blocked.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> BackpressureStats {
        let queue = self.monitor.state();
        let allowed_count = self.counters.allowed.load(Ordering::Relaxed);
        let blocked_count = self.blocked_count();
        let dropped_count = self.dropped_count();
        BackpressureStats {
            total_decisions: allowed_count + blocked_count + dropped_count,
            allowed_count,
            blocked_count,
            dropped_count,
            level: queue.level,
            policy: self.policy,
            queue,
            monitor: self.monitor.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn handler(block: bool, drop: bool) -> Result<BackpressureHandler, ConfigError> {
        BackpressureHandler::new(BackpressureConfig {
            capacity: 100,
            block_on_full: block,
            drop_on_full: drop,
            ..BackpressureConfig::default()
        })
    }

    #[test]
    fn block_and_drop_together_is_a_config_error() {
        assert_eq!(handler(true, true).unwrap_err(), ConfigError::ConflictingOverflowPolicy);
    }

    #[test]
    fn drop_on_full_drops_at_overflow() {
        let h = handler(false, true).unwrap();
        assert_eq!(h.decide(98), Decision::Drop);
        assert_eq!(h.stats().dropped_count, 1);
        assert_eq!(h.stats().level, BackpressureLevel::Overflow);
    }

    #[test]
    fn block_on_full_blocks_at_overflow_only() {
        let h = handler(true, false).unwrap();
        assert_eq!(h.decide(94), Decision::Allow);
        assert_eq!(h.decide(95), Decision::Block);
        assert_eq!(h.blocked_count(), 1);
        assert_eq!(h.dropped_count(), 0);
    }

    #[test]
    fn default_policy_oversubscribes() {
        let h = handler(false, false).unwrap();
        assert_eq!(h.policy(), OverflowPolicy::Oversubscribe);
        assert_eq!(h.decide(500), Decision::Allow);
        let stats = h.stats();
        assert_eq!(stats.allowed_count, 1);
        assert_eq!(stats.total_decisions, 1);
        assert_eq!(stats.queue.size, 500);
    }

    #[test]
    fn listener_sees_non_allow_decisions() {
        let h = handler(false, true).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        h.set_listener(move |decision: Decision, state: &QueueState| {
            sink.lock().unwrap().push((decision, state.size));
        });

        h.decide(10);
        h.decide(99);
        assert_eq!(*seen.lock().unwrap(), vec![(Decision::Drop, 99)]);
    }

    #[test]
    fn panicking_listener_is_contained() {
        let h = handler(true, false).unwrap();
        h.set_listener(|_: Decision, _: &QueueState| panic!("listener bug"));
        assert_eq!(h.decide(100), Decision::Block);
        assert_eq!(h.decide(100), Decision::Block);
        assert_eq!(h.blocked_count(), 2);
    }
}
