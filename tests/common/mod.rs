#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracepost::config::DispatcherConfigBuilder;
use tracepost::event::{IngestionFailure, IngestionResponse};
use tracepost::{Batch, DispatcherConfig, Event, EventKind, Transport, TransportError};

/// What the scripted transport answers for one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Accept,
    Fail(TransportError),
    /// 207: the listed `(event id, status)` pairs are rejected.
    Partial(Vec<(&'static str, u16)>),
    /// 207 with a `Retry-After` hint.
    PartialRetryAfter(Vec<(&'static str, u16)>, Duration),
    /// Accepts after the given delay.
    Slow(Duration),
    /// Never answers.
    Hang,
}

/// Transport that answers from a script and records every batch it saw.
/// Once the script runs out every request is accepted.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<VecDeque<Reply>>>,
    seen: Arc<Mutex<Vec<Vec<String>>>>,
}

impl ScriptedTransport {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self { script: Arc::new(Mutex::new(replies.into_iter().collect())), ..Self::default() }
    }

    pub fn accepting() -> Self {
        Self::default()
    }

    pub fn push(&self, reply: Reply) {
        self.script.lock().unwrap().push_back(reply);
    }

    /// Event ids of every request, in the order requests were made.
    pub fn requests(&self) -> Vec<Vec<String>> {
        self.seen.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn events_seen(&self) -> usize {
        self.seen.lock().unwrap().iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, batch: &Batch) -> Result<IngestionResponse, TransportError> {
        self.seen.lock().unwrap().push(batch.event_ids());
        let reply = self.script.lock().unwrap().pop_front().unwrap_or(Reply::Accept);
        match reply {
            Reply::Accept => Ok(IngestionResponse::default()),
            Reply::Fail(err) => Err(err),
            Reply::Partial(rejected) => Ok(multi_status(rejected, None)),
            Reply::PartialRetryAfter(rejected, hint) => Ok(multi_status(rejected, Some(hint))),
            Reply::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(IngestionResponse::default())
            }
            Reply::Hang => futures::future::pending().await,
        }
    }
}

fn multi_status(rejected: Vec<(&'static str, u16)>, retry_after: Option<Duration>) -> IngestionResponse {
    IngestionResponse {
        successes: Vec::new(),
        errors: rejected
            .into_iter()
            .map(|(id, status)| IngestionFailure {
                id: id.to_string(),
                status,
                message: Some(format!("item {id} failed")),
                error: None,
            })
            .collect(),
        retry_after,
    }
}

/// Config with test credentials and a flush interval long enough that only
/// explicit flushes and full batches trigger sends.
pub fn config() -> DispatcherConfigBuilder {
    DispatcherConfig::builder()
        .public_key("pk-lf-integration")
        .secret_key("sk-lf-integration-secret")
        .flush_interval(Duration::from_secs(3600))
}

pub fn event(id: &str) -> Event {
    Event::new(id, EventKind::SpanCreate, json!({ "name": id }))
}

pub fn server_error() -> TransportError {
    TransportError::Server { status: 503, body: "unavailable".into() }
}
