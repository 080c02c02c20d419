//! Delivery of a single batch.
//!
//! A sender owns its batch until it is accepted, requeued, or given up on.
//! Every attempt goes through the circuit breaker; failures are retried in
//! place according to the retry strategy; a 207 response narrows the batch to
//! the events worth retrying.

use super::{Shared, Undelivered};
use crate::async_error::{AsyncError, AsyncOperation};
use crate::circuit_breaker::{CircuitError, CircuitOpenError};
use crate::error::TransportError;
use crate::event::{Batch, IngestionResponse};
use crate::retry::Retryable;
use crate::telemetry::{BatchEvent, CircuitEvent, DeliveryEvent, RetryEvent};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::Instant;

enum Attempt {
    Delivered,
    Retry(TransportError),
    Requeue(CircuitOpenError),
}

pub(super) async fn deliver(shared: &Arc<Shared>, mut batch: Batch) {
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        if shared.cancel.is_cancelled() {
            abandon(shared, batch);
            return;
        }
        shared.lifecycle.record_activity();

        let err = match send_once(shared, &mut batch, started).await {
            Attempt::Delivered => return,
            Attempt::Requeue(open) => {
                requeue_or_drop(shared, batch, open);
                return;
            }
            Attempt::Retry(err) => err,
        };

        if matches!(err, TransportError::Cancelled) {
            abandon(shared, batch);
            return;
        }

        if !shared.retry.should_retry(attempt, &err) {
            give_up(shared, batch, err, attempt + 1, started);
            return;
        }

        let delay = shared.retry.retry_delay_with_error(attempt, &err);
        tracing::debug!(batch_id = %batch.id, attempt, ?delay, error = %err, "retrying batch");
        shared.telemetry.emit(DeliveryEvent::Retry(RetryEvent::Attempt { attempt, delay }));
        tokio::select! {
            _ = shared.sleeper.sleep(delay) => {}
            _ = shared.cancel.cancelled() => {
                abandon(shared, batch);
                return;
            }
        }
        attempt += 1;
    }
}

async fn send_once(shared: &Arc<Shared>, batch: &mut Batch, started: Instant) -> Attempt {
    let timeout = shared.config.request_timeout;
    let transport = shared.transport.clone();
    let cancel = shared.cancel.clone();
    let request = &*batch;

    let outcome = shared
        .breaker
        .execute(|| async move {
            tokio::select! {
                sent = tokio::time::timeout(timeout, transport.send(request)) => {
                    sent.unwrap_or(Err(TransportError::Timeout(timeout)))
                }
                _ = cancel.cancelled() => Err(TransportError::Cancelled),
            }
        })
        .await;

    match outcome {
        Ok(response) => accept(shared, batch, response, started),
        Err(CircuitError::Open(open)) => Attempt::Requeue(open),
        Err(CircuitError::Inner(err)) => Attempt::Retry(err),
    }
}

/// Applies an ingestion response. Permanently rejected events are reported;
/// events rejected with a retryable status stay in the batch.
fn accept(shared: &Shared, batch: &mut Batch, response: IngestionResponse, started: Instant) -> Attempt {
    if !response.is_partial() {
        shared.counters.sent.fetch_add(batch.len() as u64, Ordering::Relaxed);
        shared.counters.batches_sent.fetch_add(1, Ordering::Relaxed);
        shared.telemetry.emit(DeliveryEvent::Batch(BatchEvent::Sent { events: batch.len(), duration: started.elapsed() }));
        tracing::debug!(batch_id = %batch.id, events = batch.len(), "batch delivered");
        shared.release(&batch.sequence);
        return Attempt::Delivered;
    }

    let total = batch.len();
    let (retryable, permanent) = response.partition_errors();

    if !permanent.is_empty() {
        shared.counters.failed.fetch_add(permanent.len() as u64, Ordering::Relaxed);
        for failure in &permanent {
            let message = failure.message.clone().unwrap_or_else(|| format!("rejected with status {}", failure.status));
            let err = TransportError::Client { status: failure.status, body: message };
            shared.errors.handle(
                AsyncError::new(AsyncOperation::BatchSend, err)
                    .with_event_ids([failure.id.clone()])
                    .with_context("batch_id", &batch.id),
            );
        }
    }

    let retry_ids: HashSet<&str> = retryable.iter().map(|f| f.id.as_str()).collect();
    let retry_count = batch.events.iter().filter(|e| retry_ids.contains(e.id.as_str())).count();
    let rejected_ids: HashSet<&str> = permanent.iter().map(|f| f.id.as_str()).collect();
    let settled = batch.split_off_ids(&retry_ids);
    let rejected: Vec<u64> =
        settled.iter().filter(|(_, id)| rejected_ids.contains(id.as_str())).map(|(seq, _)| *seq).collect();
    let settled: Vec<u64> = settled.into_iter().map(|(seq, _)| seq).collect();
    shared.record_undelivered(Undelivered::Failed, &rejected);
    shared.release(&settled);
    let accepted = total.saturating_sub(permanent.len() + retry_count);
    shared.counters.sent.fetch_add(accepted as u64, Ordering::Relaxed);
    shared.telemetry.emit(DeliveryEvent::Batch(BatchEvent::Partial {
        accepted,
        retryable: retry_count,
        rejected: permanent.len(),
    }));
    tracing::warn!(
        batch_id = %batch.id,
        accepted,
        retryable = retry_count,
        rejected = permanent.len(),
        "partial ingestion failure"
    );

    if retry_count == 0 {
        shared.counters.batches_sent.fetch_add(1, Ordering::Relaxed);
        return Attempt::Delivered;
    }
    Attempt::Retry(TransportError::PartialFailure {
        retryable: retry_count,
        total,
        retry_after: response.retry_after,
    })
}

fn requeue_or_drop(shared: &Shared, mut batch: Batch, open: CircuitOpenError) {
    shared.telemetry.emit(DeliveryEvent::Circuit(CircuitEvent::Rejected { retry_in: open.retry_in }));
    let events = batch.len();

    if batch.requeue_count < shared.config.max_requeues {
        batch.requeue_count += 1;
        let requeue_count = batch.requeue_count;
        tracing::info!(batch_id = %batch.id, events, requeue_count, retry_in = ?open.retry_in, "circuit open; batch requeued");
        shared.errors.handle(
            AsyncError::new(AsyncOperation::BatchSend, open)
                .retryable(true)
                .with_event_ids(batch.event_ids())
                .with_context("batch_id", &batch.id)
                .with_context("requeue_count", requeue_count),
        );
        shared.counters.requeued.fetch_add(events as u64, Ordering::Relaxed);
        shared.telemetry.emit(DeliveryEvent::Batch(BatchEvent::Requeued { events, requeue_count }));
        shared.requeue(batch);
        return;
    }

    tracing::error!(batch_id = %batch.id, events, "circuit open and requeue limit reached; batch dropped");
    shared.errors.handle(
        AsyncError::new(AsyncOperation::BatchSend, open)
            .retryable(false)
            .with_event_ids(batch.event_ids())
            .with_context("batch_id", &batch.id)
            .with_context("requeue_count", batch.requeue_count),
    );
    shared.counters.dropped.fetch_add(events as u64, Ordering::Relaxed);
    shared.record_undelivered(Undelivered::Dropped, &batch.sequence);
    shared.release(&batch.sequence);
    shared.telemetry.emit(DeliveryEvent::Batch(BatchEvent::Dropped { events }));
}

fn give_up(shared: &Shared, batch: Batch, err: TransportError, attempts: u32, started: Instant) {
    let events = batch.len();
    let retryable = err.is_retryable();
    tracing::error!(batch_id = %batch.id, events, attempts, error = %err, "batch delivery failed");
    shared.counters.failed.fetch_add(events as u64, Ordering::Relaxed);
    shared.record_undelivered(Undelivered::Failed, &batch.sequence);
    shared.release(&batch.sequence);
    shared.telemetry.emit(DeliveryEvent::Retry(RetryEvent::Exhausted { attempts, elapsed: started.elapsed() }));
    shared.telemetry.emit(DeliveryEvent::Batch(BatchEvent::Failed { events, retryable }));
    shared.errors.handle(
        AsyncError::new(AsyncOperation::BatchSend, err)
            .retryable(retryable)
            .with_event_ids(batch.event_ids())
            .with_context("batch_id", &batch.id)
            .with_context("attempts", attempts),
    );
}

fn abandon(shared: &Shared, batch: Batch) {
    let events = batch.len();
    tracing::warn!(batch_id = %batch.id, events, "delivery cancelled");
    shared.counters.abandoned.fetch_add(events as u64, Ordering::Relaxed);
    shared.record_undelivered(Undelivered::Dropped, &batch.sequence);
    shared.release(&batch.sequence);
    shared.errors.handle(
        AsyncError::new(AsyncOperation::Shutdown, TransportError::Cancelled)
            .with_event_ids(batch.event_ids())
            .with_context("batch_id", &batch.id),
    );
}
