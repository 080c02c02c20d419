//! Event model and the ingestion wire format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

/// Ingestion event types understood by the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    TraceCreate,
    SpanCreate,
    SpanUpdate,
    GenerationCreate,
    GenerationUpdate,
    EventCreate,
    ScoreCreate,
    SdkLog,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::TraceCreate => "trace-create",
            EventKind::SpanCreate => "span-create",
            EventKind::SpanUpdate => "span-update",
            EventKind::GenerationCreate => "generation-create",
            EventKind::GenerationUpdate => "generation-update",
            EventKind::EventCreate => "event-create",
            EventKind::ScoreCreate => "score-create",
            EventKind::SdkLog => "sdk-log",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One already-built telemetry event. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub body: Value,
}

impl Event {
    pub fn new(id: impl Into<String>, kind: EventKind, body: Value) -> Self {
        Self { id: id.into(), timestamp: Utc::now(), kind, body }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Events sent together in one ingestion request.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub id: String,
    pub events: Vec<Event>,
    /// Times this batch was put back on the queue after a circuit-open rejection.
    pub requeue_count: u32,
    /// Queue sequence number of each event, parallel to `events`. Empty for
    /// batches built outside the dispatcher.
    pub(crate) sequence: Vec<u64>,
}

impl Batch {
    pub fn new(id: impl Into<String>, events: Vec<Event>) -> Self {
        Self { id: id.into(), events, requeue_count: 0, sequence: Vec::new() }
    }

    pub(crate) fn sequenced(id: String, queued: impl IntoIterator<Item = (u64, Event)>) -> Self {
        let (sequence, events) = queued.into_iter().unzip();
        Self { id, events, requeue_count: 0, sequence }
    }

    /// Events paired with their queue sequence, for putting them back on the queue.
    pub(crate) fn into_sequenced(self) -> Vec<(u64, Event)> {
        let sequence = if self.sequence.len() == self.events.len() { self.sequence } else { vec![0; self.events.len()] };
        sequence.into_iter().zip(self.events).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn event_ids(&self) -> Vec<String> {
        self.events.iter().map(|e| e.id.clone()).collect()
    }

    /// Keeps only the events whose id is in `ids`, preserving order.
    pub fn retain_ids(&mut self, ids: &HashSet<&str>) {
        self.split_off_ids(ids);
    }

    /// Like [`retain_ids`](Self::retain_ids), returning the sequence number
    /// and id of every removed event.
    pub(crate) fn split_off_ids(&mut self, ids: &HashSet<&str>) -> Vec<(u64, String)> {
        if self.sequence.len() != self.events.len() {
            self.sequence = Vec::new();
            let removed =
                self.events.iter().filter(|e| !ids.contains(e.id.as_str())).map(|e| (0, e.id.clone())).collect();
            self.events.retain(|e| ids.contains(e.id.as_str()));
            return removed;
        }

        let mut removed = Vec::new();
        let (sequence, events): (Vec<u64>, Vec<Event>) = std::mem::take(&mut self.sequence)
            .into_iter()
            .zip(std::mem::take(&mut self.events))
            .filter(|(seq, event)| {
                let keep = ids.contains(event.id.as_str());
                if !keep {
                    removed.push((*seq, event.id.clone()));
                }
                keep
            })
            .unzip();
        self.sequence = sequence;
        self.events = events;
        removed
    }
}

/// SDK metadata sent alongside every batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub batch_size: usize,
    pub sdk_name: String,
    pub sdk_version: String,
    pub sdk_integration: String,
}

/// Request body of `POST /api/public/ingestion`.
#[derive(Debug, Serialize)]
pub struct IngestionRequest<'a> {
    pub batch: &'a [Event],
    pub metadata: BatchMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionSuccess {
    pub id: String,
    pub status: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionFailure {
    pub id: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl IngestionFailure {
    /// 429 and 5xx item failures may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        self.status == 429 || (500..=599).contains(&self.status)
    }
}

/// Response body for 200, 201 and 207.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionResponse {
    #[serde(default)]
    pub successes: Vec<IngestionSuccess>,
    #[serde(default)]
    pub errors: Vec<IngestionFailure>,
    /// `Retry-After` sent with a 207, applied when the retryable items are resent.
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

impl IngestionResponse {
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Splits item failures into (retryable, permanent).
    pub fn partition_errors(&self) -> (Vec<&IngestionFailure>, Vec<&IngestionFailure>) {
        self.errors.iter().partition(|e| e.is_retryable())
    }
}
