//! Sending batches to the ingestion endpoint.
//!
//! [`Transport`] is the seam between the dispatcher and the network. The
//! production implementation, [`HttpTransport`], posts the batch envelope with
//! `reqwest` and maps the response onto [`IngestionResponse`] or a
//! [`TransportError`]. Tests substitute their own implementation.

use crate::config::DispatcherConfig;
use crate::error::{ConfigError, TransportError};
use crate::event::{Batch, BatchMetadata, IngestionRequest, IngestionResponse};
use crate::retry::{classify_network_error, NetworkErrorKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use std::fmt;
use std::time::Duration;

const MAX_ERROR_BODY: usize = 1024;

/// Delivers one batch and reports the endpoint's per-event verdicts.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn send(&self, batch: &Batch) -> Result<IngestionResponse, TransportError>;
}

/// `reqwest`-backed transport for `POST <base_url>/api/public/ingestion`.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    authorization: HeaderValue,
    timeout: Duration,
    sdk_name: String,
    sdk_version: String,
    sdk_integration: String,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport").field("url", &self.url).field("timeout", &self.timeout).finish_non_exhaustive()
    }
}

impl HttpTransport {
    pub fn new(config: &DispatcherConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(format!("{}/{}", config.sdk_name, config.sdk_version))
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Self::with_client(client, config)
    }

    /// Uses a caller-supplied client, for shared connection pools.
    pub fn with_client(client: reqwest::Client, config: &DispatcherConfig) -> Result<Self, ConfigError> {
        let mut authorization = HeaderValue::from_str(&config.credentials.authorization())
            .map_err(|_| ConfigError::InvalidCredentials("credentials contain characters not allowed in a header"))?;
        authorization.set_sensitive(true);

        Ok(Self {
            client,
            url: config.ingestion_url(),
            authorization,
            timeout: config.request_timeout,
            sdk_name: config.sdk_name.clone(),
            sdk_version: config.sdk_version.clone(),
            sdk_integration: config.sdk_integration.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn map_send_error(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            return TransportError::Timeout(self.timeout);
        }
        let kind = classify_network_error(&err).unwrap_or(if err.is_connect() {
            NetworkErrorKind::ConnectionRefused
        } else {
            NetworkErrorKind::Other
        });
        TransportError::Network { kind, message: err.to_string() }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, batch: &Batch) -> Result<IngestionResponse, TransportError> {
        let body = IngestionRequest {
            batch: &batch.events,
            metadata: BatchMetadata {
                batch_size: batch.len(),
                sdk_name: self.sdk_name.clone(),
                sdk_version: self.sdk_version.clone(),
                sdk_integration: self.sdk_integration.clone(),
            },
        };
        let payload = serde_json::to_vec(&body).map_err(|e| TransportError::Encode(e.to_string()))?;

        tracing::debug!(batch_id = %batch.id, events = batch.len(), bytes = payload.len(), "sending batch");

        let response = self
            .client
            .post(&self.url)
            .header(AUTHORIZATION, self.authorization.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status().as_u16();
        let retry_after = retry_after(response.headers(), Utc::now());
        let bytes = response.bytes().await.map_err(|e| self.map_send_error(e))?;

        match status {
            200..=299 => {
                let mut parsed: IngestionResponse = if bytes.iter().all(u8::is_ascii_whitespace) {
                    IngestionResponse::default()
                } else {
                    serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()))?
                };
                parsed.retry_after = retry_after;
                tracing::debug!(
                    batch_id = %batch.id,
                    status,
                    successes = parsed.successes.len(),
                    errors = parsed.errors.len(),
                    "ingestion response"
                );
                Ok(parsed)
            }
            _ => {
                let err = TransportError::from_status(status, truncate_body(&bytes), retry_after);
                tracing::warn!(batch_id = %batch.id, status, error = %err, "ingestion request failed");
                Err(err)
            }
        }
    }
}

/// Parses a `Retry-After` header given as delta-seconds or an HTTP date.
/// Dates in the past yield a zero delay.
pub fn retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    Some(at.signed_duration_since(now).to_std().unwrap_or(Duration::ZERO))
}

fn truncate_body(bytes: &[u8]) -> String {
    if bytes.len() <= MAX_ERROR_BODY {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    format!("{}... (truncated)", String::from_utf8_lossy(&bytes[..MAX_ERROR_BODY]))
}
