//! Forward-only lifecycle: `Active → ShuttingDown → Closed`.
//!
//! The manager also tracks the last time anything happened (enqueue or send
//! attempt) and can warn once per idle period when nothing has.

use crate::clock::{Clock, MonotonicClock};
use crate::error::LifecycleError;
use crate::hooks::{guarded, HookSlot};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Smallest interval the idle watcher polls at.
const MIN_IDLE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LifecycleState {
    Active = 0,
    ShuttingDown = 1,
    Closed = 2,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LifecycleState::Active,
            1 => LifecycleState::ShuttingDown,
            _ => LifecycleState::Closed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Active => "active",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::Closed => "closed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notified when no activity has been recorded for a full idle period.
pub trait IdleListener: Send + Sync + 'static {
    fn on_idle(&self, idle_for: Duration);
}

impl<F> IdleListener for F
where
    F: Fn(Duration) + Send + Sync + 'static,
{
    fn on_idle(&self, idle_for: Duration) {
        self(idle_for)
    }
}

/// Immutable snapshot of the lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleStats {
    pub state: LifecycleState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub uptime: Duration,
    pub idle: Duration,
}

pub struct LifecycleManager {
    state: AtomicU8,
    state_tx: watch::Sender<LifecycleState>,
    created_at: DateTime<Utc>,
    clock: Arc<dyn Clock>,
    started_millis: u64,
    last_activity_millis: AtomicU64,
    idle_warning_after: Option<Duration>,
    idle_warned: AtomicBool,
    idle_listener: HookSlot<dyn IdleListener>,
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("state", &self.state())
            .field("created_at", &self.created_at)
            .field("idle_warning_after", &self.idle_warning_after)
            .finish()
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new(Arc::new(MonotonicClock::default()), None)
    }
}

impl LifecycleManager {
    pub fn new(clock: Arc<dyn Clock>, idle_warning_after: Option<Duration>) -> Self {
        let now = clock.now_millis();
        let (state_tx, _) = watch::channel(LifecycleState::Active);
        Self {
            state: AtomicU8::new(LifecycleState::Active as u8),
            state_tx,
            created_at: Utc::now(),
            clock,
            started_millis: now,
            last_activity_millis: AtomicU64::new(now),
            idle_warning_after: idle_warning_after.filter(|d| !d.is_zero()),
            idle_warned: AtomicBool::new(false),
            idle_listener: HookSlot::empty(),
        }
    }

    pub fn set_idle_listener<L: IdleListener>(&self, listener: L) {
        self.idle_listener.set(Box::new(listener));
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == LifecycleState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state() == LifecycleState::Closed
    }

    /// Receiver that observes every state change.
    pub fn shutdown_signal(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    /// `Active → ShuttingDown`. A second call fails with [`LifecycleError::AlreadyClosed`].
    pub fn begin_shutdown(&self) -> Result<(), LifecycleError> {
        self.state
            .compare_exchange(
                LifecycleState::Active as u8,
                LifecycleState::ShuttingDown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| LifecycleError::AlreadyClosed)?;
        self.state_tx.send_replace(LifecycleState::ShuttingDown);
        tracing::info!("lifecycle → shutting down");
        Ok(())
    }

    /// `→ Closed`. Also accepted straight from `Active`; only a second close fails.
    pub fn complete_shutdown(&self) -> Result<(), LifecycleError> {
        let previous = self.state.swap(LifecycleState::Closed as u8, Ordering::AcqRel);
        if LifecycleState::from_u8(previous) == LifecycleState::Closed {
            return Err(LifecycleError::AlreadyClosed);
        }
        self.state_tx.send_replace(LifecycleState::Closed);
        tracing::info!(uptime = ?self.uptime(), "lifecycle → closed");
        Ok(())
    }

    pub fn record_activity(&self) {
        self.last_activity_millis.store(self.clock.now_millis(), Ordering::Release);
        self.idle_warned.store(false, Ordering::Release);
    }

    pub fn idle_duration(&self) -> Duration {
        let last = self.last_activity_millis.load(Ordering::Acquire);
        Duration::from_millis(self.clock.now_millis().saturating_sub(last))
    }

    pub fn uptime(&self) -> Duration {
        Duration::from_millis(self.clock.now_millis().saturating_sub(self.started_millis))
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let offset = self.last_activity_millis.load(Ordering::Acquire).saturating_sub(self.started_millis);
        i64::try_from(offset)
            .ok()
            .and_then(chrono::TimeDelta::try_milliseconds)
            .and_then(|offset| self.created_at.checked_add_signed(offset))
            .unwrap_or(self.created_at)
    }

    pub fn stats(&self) -> LifecycleStats {
        LifecycleStats {
            state: self.state(),
            created_at: self.created_at,
            last_activity: self.last_activity(),
            uptime: self.uptime(),
            idle: self.idle_duration(),
        }
    }

    /// Fires the idle warning if the idle period has been reached and it has
    /// not already fired for this period. Returns whether it fired.
    pub fn check_idle(&self) -> bool {
        let Some(threshold) = self.idle_warning_after else { return false };
        if !self.is_active() {
            return false;
        }
        let idle = self.idle_duration();
        if idle < threshold || self.idle_warned.swap(true, Ordering::AcqRel) {
            return false;
        }

        tracing::warn!(idle = ?idle, threshold = ?threshold, "no delivery activity recorded");
        if let Some(listener) = self.idle_listener.get() {
            guarded("idle", || listener.on_idle(idle));
        }
        true
    }

    /// Spawns a task that calls [`check_idle`](Self::check_idle) until the
    /// lifecycle leaves `Active` or `cancel` fires. `None` when idle warnings
    /// are disabled.
    pub fn spawn_idle_watcher(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let threshold = self.idle_warning_after?;
        let poll = (threshold / 4).max(MIN_IDLE_POLL);
        let manager = Arc::clone(self);
        let mut state_rx = self.shutdown_signal();

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = state_rx.changed() => {
                        if changed.is_err() || *state_rx.borrow() != LifecycleState::Active {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(poll) => {
                        manager.check_idle();
                    }
                }
            }
        }))
    }
}
