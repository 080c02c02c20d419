//! Queue utilization monitoring.
//!
//! [`QueueMonitor`] turns a raw queue size into a [`BackpressureLevel`] using
//! percentage thresholds (inclusive lower bounds), records per-level
//! occurrence counts, and notifies a listener whenever the level changes.

use crate::error::ConfigError;
use crate::hooks::{guarded, HookSlot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Queue pressure, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureLevel {
    None,
    Warning,
    Critical,
    Overflow,
}

impl BackpressureLevel {
    pub const ALL: [BackpressureLevel; 4] = [
        BackpressureLevel::None,
        BackpressureLevel::Warning,
        BackpressureLevel::Critical,
        BackpressureLevel::Overflow,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BackpressureLevel::None => "none",
            BackpressureLevel::Warning => "warning",
            BackpressureLevel::Critical => "critical",
            BackpressureLevel::Overflow => "overflow",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for BackpressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Utilization percentages at which each level begins.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueThresholds {
    pub warning_percent: f64,
    pub critical_percent: f64,
    pub overflow_percent: f64,
}

impl Default for QueueThresholds {
    fn default() -> Self {
        Self { warning_percent: 50.0, critical_percent: 80.0, overflow_percent: 95.0 }
    }
}

impl QueueThresholds {
    /// Builds thresholds, reverting non-positive (or non-finite) values to
    /// their defaults. If the result is not strictly increasing the defaults
    /// are used wholesale. Values above 100 are clamped to 100.
    pub fn new(warning: f64, critical: f64, overflow: f64) -> Self {
        let defaults = Self::default();
        let pick = |value: f64, fallback: f64| {
            if value.is_finite() && value > 0.0 {
                value.min(100.0)
            } else {
                fallback
            }
        };
        let thresholds = Self {
            warning_percent: pick(warning, defaults.warning_percent),
            critical_percent: pick(critical, defaults.critical_percent),
            overflow_percent: pick(overflow, defaults.overflow_percent),
        };
        if thresholds.is_ordered() {
            thresholds
        } else {
            tracing::warn!(warning, critical, overflow, "backpressure thresholds out of order; using defaults");
            defaults
        }
    }

    pub fn is_ordered(&self) -> bool {
        self.warning_percent < self.critical_percent && self.critical_percent < self.overflow_percent
    }

    /// Level for a utilization percentage. Thresholds are inclusive lower bounds.
    pub fn level_for(&self, percent_full: f64) -> BackpressureLevel {
        if percent_full >= self.overflow_percent {
            BackpressureLevel::Overflow
        } else if percent_full >= self.critical_percent {
            BackpressureLevel::Critical
        } else if percent_full >= self.warning_percent {
            BackpressureLevel::Warning
        } else {
            BackpressureLevel::None
        }
    }
}

/// Snapshot of the queue at the time of the last update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueState {
    pub size: usize,
    pub capacity: usize,
    pub level: BackpressureLevel,
    pub percent_full: f64,
    pub timestamp: DateTime<Utc>,
}

/// Occurrence counts gathered by a [`QueueMonitor`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueMonitorStats {
    pub updates: u64,
    pub state_changes: u64,
    pub none: u64,
    pub warning: u64,
    pub critical: u64,
    pub overflow: u64,
}

impl QueueMonitorStats {
    pub fn occurrences(&self, level: BackpressureLevel) -> u64 {
        match level {
            BackpressureLevel::None => self.none,
            BackpressureLevel::Warning => self.warning,
            BackpressureLevel::Critical => self.critical,
            BackpressureLevel::Overflow => self.overflow,
        }
    }
}

/// Notified on every level change. Runs synchronously on the updating thread,
/// after the monitor's lock is released; it must not block.
pub trait LevelListener: Send + Sync + 'static {
    fn on_level_change(&self, from: BackpressureLevel, to: BackpressureLevel, state: &QueueState);
}

impl<F> LevelListener for F
where
    F: Fn(BackpressureLevel, BackpressureLevel, &QueueState) + Send + Sync + 'static,
{
    fn on_level_change(&self, from: BackpressureLevel, to: BackpressureLevel, state: &QueueState) {
        self(from, to, state)
    }
}

/// Per-level occurrence and state-change counters.
///
/// Owned by whoever creates it; hand the same `Arc` to several monitors to
/// aggregate, or keep a handle to reset it between tests.
#[derive(Debug, Default)]
pub struct LevelCounters {
    updates: AtomicU64,
    state_changes: AtomicU64,
    per_level: [AtomicU64; 4],
}

impl LevelCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> QueueMonitorStats {
        let per = |level: BackpressureLevel| self.per_level[level.index()].load(Ordering::Relaxed);
        QueueMonitorStats {
            updates: self.updates.load(Ordering::Relaxed),
            state_changes: self.state_changes.load(Ordering::Relaxed),
            none: per(BackpressureLevel::None),
            warning: per(BackpressureLevel::Warning),
            critical: per(BackpressureLevel::Critical),
            overflow: per(BackpressureLevel::Overflow),
        }
    }

    pub fn reset(&self) {
        self.updates.store(0, Ordering::Relaxed);
        self.state_changes.store(0, Ordering::Relaxed);
        for counter in &self.per_level {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn record(&self, level: BackpressureLevel, changed: bool) {
        self.updates.fetch_add(1, Ordering::Relaxed);
        self.per_level[level.index()].fetch_add(1, Ordering::Relaxed);
        if changed {
            self.state_changes.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Tracks queue utilization against fixed thresholds.
#[derive(Debug)]
pub struct QueueMonitor {
    capacity: usize,
    thresholds: QueueThresholds,
    state: Mutex<QueueState>,
    counters: Arc<LevelCounters>,
    listener: HookSlot<dyn LevelListener>,
}

impl QueueMonitor {
    pub fn new(capacity: usize, thresholds: QueueThresholds) -> Result<Self, ConfigError> {
        Self::with_counters(capacity, thresholds, Arc::new(LevelCounters::new()))
    }

    pub fn with_counters(
        capacity: usize,
        thresholds: QueueThresholds,
        counters: Arc<LevelCounters>,
    ) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::NonPositive { field: "queue_capacity" });
        }
        let thresholds = if thresholds.is_ordered() { thresholds } else { QueueThresholds::default() };
        Ok(Self {
            capacity,
            thresholds,
            state: Mutex::new(QueueState {
                size: 0,
                capacity,
                level: BackpressureLevel::None,
                percent_full: 0.0,
                timestamp: Utc::now(),
            }),
            counters,
            listener: HookSlot::empty(),
        })
    }

    pub fn set_listener<L: LevelListener>(&self, listener: L) {
        self.listener.set(Box::new(listener));
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn thresholds(&self) -> &QueueThresholds {
        &self.thresholds
    }

    /// Records the current queue size and returns the resulting level.
    pub fn update(&self, size: usize) -> BackpressureLevel {
        let percent_full = size as f64 * 100.0 / self.capacity as f64;
        let level = self.thresholds.level_for(percent_full);

        let (previous, snapshot) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = state.level;
            *state = QueueState {
                size,
                capacity: self.capacity,
                level,
                percent_full,
                timestamp: Utc::now(),
            };
            (previous, state.clone())
        };

        let changed = previous != level;
        self.counters.record(level, changed);

        if changed {
            log_level_change(previous, level, &snapshot);
            if let Some(listener) = self.listener.get() {
                guarded("queue_level", || listener.on_level_change(previous, level, &snapshot));
            }
        }

        level
    }

    pub fn state(&self) -> QueueState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn level(&self) -> BackpressureLevel {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).level
    }

    /// True while the queue is below the warning threshold.
    pub fn is_healthy(&self) -> bool {
        self.level() == BackpressureLevel::None
    }

    pub fn is_critical(&self) -> bool {
        self.level() >= BackpressureLevel::Critical
    }

    /// Only an overflowing queue should hold producers back.
    pub fn should_block(&self) -> bool {
        self.level() == BackpressureLevel::Overflow
    }

    pub fn counters(&self) -> &Arc<LevelCounters> {
        &self.counters
    }

    pub fn stats(&self) -> QueueMonitorStats {
        self.counters.snapshot()
    }

    /// Zeroes the counters; the current level is kept.
    pub fn reset_stats(&self) {
        self.counters.reset();
    }
}

fn log_level_change(from: BackpressureLevel, to: BackpressureLevel, state: &QueueState) {
    let percent = format!("{:.1}", state.percent_full);
    match to {
        BackpressureLevel::None => {
            tracing::info!(%from, size = state.size, capacity = state.capacity, "queue pressure cleared");
        }
        BackpressureLevel::Warning => {
            tracing::warn!(%from, size = state.size, capacity = state.capacity, %percent, "queue pressure: warning");
        }
        BackpressureLevel::Critical => {
            tracing::warn!(%from, size = state.size, capacity = state.capacity, %percent, "queue pressure: critical");
        }
        BackpressureLevel::Overflow => {
            tracing::error!(%from, size = state.size, capacity = state.capacity, %percent, "queue pressure: overflow");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> QueueMonitor {
        QueueMonitor::new(100, QueueThresholds::default()).expect("valid monitor")
    }

    #[test]
    fn thresholds_are_inclusive_lower_bounds() {
        let m = monitor();
        assert_eq!(m.update(49), BackpressureLevel::None);
        assert_eq!(m.update(50), BackpressureLevel::Warning);
        assert_eq!(m.update(79), BackpressureLevel::Warning);
        assert_eq!(m.update(80), BackpressureLevel::Critical);
        assert_eq!(m.update(95), BackpressureLevel::Overflow);
        assert_eq!(m.update(150), BackpressureLevel::Overflow);
    }

    #[test]
    fn counts_occurrences_and_state_changes() {
        let m = monitor();
        m.update(10);
        m.update(20);
        m.update(55);
        m.update(60);
        m.update(5);

        let stats = m.stats();
        assert_eq!(stats.updates, 5);
        assert_eq!(stats.none, 3);
        assert_eq!(stats.warning, 2);
        assert_eq!(stats.state_changes, 2);

        m.reset_stats();
        assert_eq!(m.stats(), QueueMonitorStats::default());
        assert_eq!(m.level(), BackpressureLevel::None);
    }

    #[test]
    fn listener_fires_once_per_change() {
        let m = monitor();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        m.set_listener(move |from: BackpressureLevel, to: BackpressureLevel, state: &QueueState| {
            sink.lock().unwrap().push((from, to, state.size));
        });

        m.update(55);
        m.update(56);
        m.update(85);
        m.update(10);

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (BackpressureLevel::None, BackpressureLevel::Warning, 55),
                (BackpressureLevel::Warning, BackpressureLevel::Critical, 85),
                (BackpressureLevel::Critical, BackpressureLevel::None, 10),
            ]
        );
    }

    #[test]
    fn listener_can_read_monitor_without_deadlock() {
        let m = Arc::new(monitor());
        let inner = Arc::downgrade(&m);
        let observed = Arc::new(Mutex::new(None));
        let out = observed.clone();
        m.set_listener(move |_: BackpressureLevel, _: BackpressureLevel, _: &QueueState| {
            if let Some(m) = inner.upgrade() {
                *out.lock().unwrap() = Some(m.state().size);
            }
        });
        m.update(90);
        assert_eq!(*observed.lock().unwrap(), Some(90));
    }

    #[test]
    fn invalid_thresholds_revert_to_defaults() {
        let defaults = QueueThresholds::default();
        assert_eq!(QueueThresholds::new(-1.0, 0.0, f64::NAN), defaults);
        assert_eq!(QueueThresholds::new(60.0, -5.0, 90.0).critical_percent, 80.0);
        assert_eq!(QueueThresholds::new(90.0, 50.0, 95.0), defaults);
        assert_eq!(QueueThresholds::new(40.0, 70.0, 250.0).overflow_percent, 100.0);
        assert!(QueueMonitor::new(0, QueueThresholds::default()).is_err());
    }

    #[test]
    fn warning_level_is_neither_healthy_nor_critical() {
        let m = monitor();
        assert!(m.is_healthy());
        assert_eq!(m.update(55), BackpressureLevel::Warning);
        assert!(!m.is_healthy());
        assert!(!m.is_critical());
        assert!(!m.should_block());
        m.update(96);
        assert!(m.is_critical());
        assert!(m.should_block());
    }

    #[test]
    fn injected_counters_are_shared_and_resettable() {
        let counters = Arc::new(LevelCounters::new());
        let a = QueueMonitor::with_counters(10, QueueThresholds::default(), counters.clone()).unwrap();
        let b = QueueMonitor::with_counters(10, QueueThresholds::default(), counters.clone()).unwrap();
        a.update(9);
        b.update(1);
        assert_eq!(counters.snapshot().updates, 2);
        assert_eq!(counters.snapshot().critical, 1);
        counters.reset();
        assert_eq!(a.stats().updates, 0);
    }

    #[test]
    fn state_reports_percent_full() {
        let m = monitor();
        m.update(25);
        let state = m.state();
        assert_eq!(state.size, 25);
        assert_eq!(state.capacity, 100);
        assert!((state.percent_full - 25.0).abs() < f64::EPSILON);
    }
}
