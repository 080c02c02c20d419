//! Plumbing shared by every user-supplied callback.
//!
//! Listeners are always invoked with no internal lock held, and a panicking
//! listener is caught and logged so it can never corrupt component state.

use arc_swap::ArcSwapOption;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Hot-swappable slot holding at most one listener.
pub(crate) struct HookSlot<L: ?Sized> {
    slot: ArcSwapOption<Box<L>>,
}

impl<L: ?Sized> HookSlot<L> {
    pub(crate) fn empty() -> Self {
        Self { slot: ArcSwapOption::empty() }
    }

    pub(crate) fn set(&self, listener: Box<L>) {
        self.slot.store(Some(Arc::new(listener)));
    }

    pub(crate) fn clear(&self) {
        self.slot.store(None);
    }

    pub(crate) fn get(&self) -> Option<Arc<Box<L>>> {
        self.slot.load_full()
    }

    pub(crate) fn is_set(&self) -> bool {
        self.slot.load().is_some()
    }
}

impl<L: ?Sized> std::fmt::Debug for HookSlot<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.is_set() { "<listener>" } else { "<none>" })
    }
}

/// Runs `f`, swallowing (and logging) any panic it raises.
pub(crate) fn guarded<F: FnOnce()>(hook: &'static str, f: F) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        tracing::error!(hook, panic = %panic_message(payload.as_ref()), "listener panicked; ignored");
    }
}

/// Runs `f` off the caller's thread: on the current tokio runtime when there
/// is one, otherwise on a short-lived OS thread.
pub(crate) fn spawn_detached<F>(hook: &'static str, f: F)
where
    F: FnOnce() + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { guarded(hook, f) });
        }
        Err(_) => {
            let spawned = std::thread::Builder::new()
                .name(format!("tracepost-{hook}"))
                .spawn(move || guarded(hook, f));
            if let Err(err) = spawned {
                tracing::warn!(hook, error = %err, "could not spawn listener thread; notification dropped");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic>".to_string()
    }
}
