//! Collection point for failures that happen on background senders.
//!
//! Once `enqueue` has acknowledged an event, anything that later goes wrong
//! with it is reported here and never thrown back into caller code. The
//! buffer is bounded: [`AsyncErrorHandler::handle`] never blocks, and when the
//! buffer is full the newest error is dropped and counted.

use crate::hooks::{guarded, HookSlot};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// Default number of buffered errors.
pub const DEFAULT_ERROR_BUFFER: usize = 100;

/// Background operation during which an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AsyncOperation {
    BatchSend,
    Flush,
    Shutdown,
    Enqueue,
    IdGeneration,
}

impl AsyncOperation {
    pub const ALL: [AsyncOperation; 5] = [
        AsyncOperation::BatchSend,
        AsyncOperation::Flush,
        AsyncOperation::Shutdown,
        AsyncOperation::Enqueue,
        AsyncOperation::IdGeneration,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AsyncOperation::BatchSend => "batch_send",
            AsyncOperation::Flush => "flush",
            AsyncOperation::Shutdown => "shutdown",
            AsyncOperation::Enqueue => "enqueue",
            AsyncOperation::IdGeneration => "id_generation",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for AsyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error raised off the caller's path. Immutable once built.
#[derive(Debug, Clone)]
pub struct AsyncError {
    pub operation: AsyncOperation,
    pub error: Arc<dyn StdError + Send + Sync>,
    pub time: DateTime<Utc>,
    pub retryable: bool,
    pub event_ids: Vec<String>,
    pub context: BTreeMap<String, String>,
}

impl AsyncError {
    pub fn new<E>(operation: AsyncOperation, error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            operation,
            error: Arc::new(error),
            time: Utc::now(),
            retryable: false,
            event_ids: Vec::new(),
            context: BTreeMap::new(),
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_event_ids(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.event_ids.extend(ids);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }
}

impl fmt::Display for AsyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed", self.operation)?;
        if !self.event_ids.is_empty() {
            write!(f, " ({} event(s))", self.event_ids.len())?;
        }
        write!(f, ": {}", self.error)
    }
}

impl StdError for AsyncError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.error.as_ref())
    }
}

/// Invoked synchronously for every handled error, including ones that are
/// then dropped because the buffer is full. Must not block.
pub trait ErrorCallback: Send + Sync + 'static {
    fn on_error(&self, error: &AsyncError);
}

impl<F> ErrorCallback for F
where
    F: Fn(&AsyncError) + Send + Sync + 'static,
{
    fn on_error(&self, error: &AsyncError) {
        self(error)
    }
}

/// Invoked with the running drop count whenever an error is dropped.
pub trait OverflowCallback: Send + Sync + 'static {
    fn on_overflow(&self, dropped_total: u64);
}

impl<F> OverflowCallback for F
where
    F: Fn(u64) + Send + Sync + 'static,
{
    fn on_overflow(&self, dropped_total: u64) {
        self(dropped_total)
    }
}

/// Snapshot of handler counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncErrorStats {
    pub total_errors: u64,
    pub dropped_count: u64,
    pub ignored_after_close: u64,
    pub pending: usize,
    pub capacity: usize,
    pub closed: bool,
    pub by_operation: BTreeMap<AsyncOperation, u64>,
}

/// Bounded, non-blocking sink for [`AsyncError`]s.
pub struct AsyncErrorHandler {
    tx: mpsc::Sender<AsyncError>,
    rx: Mutex<mpsc::Receiver<AsyncError>>,
    capacity: usize,
    pending: AtomicUsize,
    total: AtomicU64,
    dropped: AtomicU64,
    ignored: AtomicU64,
    by_operation: [AtomicU64; 5],
    closed: AtomicBool,
    callback: HookSlot<dyn ErrorCallback>,
    overflow: HookSlot<dyn OverflowCallback>,
}

impl fmt::Debug for AsyncErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncErrorHandler")
            .field("capacity", &self.capacity)
            .field("pending", &self.pending())
            .field("total", &self.total_errors())
            .field("dropped", &self.dropped_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Default for AsyncErrorHandler {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_BUFFER)
    }
}

impl AsyncErrorHandler {
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            capacity,
            pending: AtomicUsize::new(0),
            total: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            by_operation: Default::default(),
            closed: AtomicBool::new(false),
            callback: HookSlot::empty(),
            overflow: HookSlot::empty(),
        }
    }

    pub fn set_callback<C: ErrorCallback>(&self, callback: C) {
        self.callback.set(Box::new(callback));
    }

    pub fn set_overflow_callback<C: OverflowCallback>(&self, callback: C) {
        self.overflow.set(Box::new(callback));
    }

    /// Records `error`. Never blocks; `None` is a no-op, and errors handed
    /// in after [`close`](Self::close) are counted as ignored and discarded.
    pub fn handle(&self, error: impl Into<Option<AsyncError>>) {
        let Some(error) = error.into() else { return };

        if self.is_closed() {
            self.ignored.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(operation = %error.operation, "async error after close; ignored");
            return;
        }

        self.total.fetch_add(1, Ordering::Relaxed);
        self.by_operation[error.operation.index()].fetch_add(1, Ordering::Relaxed);

        if let Some(callback) = self.callback.get() {
            guarded("async_error", || callback.on_error(&error));
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        match self.tx.try_send(error) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(error)) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(operation = %error.operation, dropped, "async error buffer full; error dropped");
                if let Some(overflow) = self.overflow.get() {
                    guarded("async_error_overflow", || overflow.on_overflow(dropped));
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                self.ignored.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Removes and returns every buffered error, oldest first.
    pub fn drain(&self) -> Vec<AsyncError> {
        let mut rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        let mut drained = Vec::new();
        while let Ok(error) = rx.try_recv() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            drained.push(error);
        }
        drained
    }

    /// Stops accepting errors. Already-buffered errors can still be drained.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.rx.lock().unwrap_or_else(PoisonError::into_inner).close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn total_errors(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn errors_by_operation(&self, operation: AsyncOperation) -> u64 {
        self.by_operation[operation.index()].load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> AsyncErrorStats {
        AsyncErrorStats {
            total_errors: self.total_errors(),
            dropped_count: self.dropped_count(),
            ignored_after_close: self.ignored.load(Ordering::Relaxed),
            pending: self.pending(),
            capacity: self.capacity,
            closed: self.is_closed(),
            by_operation: AsyncOperation::ALL
                .iter()
                .map(|op| (*op, self.errors_by_operation(*op)))
                .filter(|(_, count)| *count > 0)
                .collect(),
        }
    }
}
