//! Dispatcher configuration.
//!
//! [`DispatcherConfig`] is validated once, at construction, through
//! [`DispatcherConfigBuilder::build`] or [`DispatcherConfig::from_env`].
//! The two knobs that may change while the dispatcher runs, batch size and
//! flush interval, are read through a [`DynamicConfig`] handle.

use crate::backpressure::{BackpressureConfig, OverflowPolicy};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::queue_monitor::QueueThresholds;
use arc_swap::ArcSwap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://cloud.langfuse.com";
pub const ENV_PREFIX: &str = "TRACEPOST_";

/// Masks a secret for logging: a short prefix, `****`, then the last four
/// characters. Secrets of eight characters or fewer are masked entirely.
///
/// ```
/// use tracepost::mask_secret;
/// assert_eq!(mask_secret("sk-lf-1234567890abcd"), "sk-l****abcd");
/// assert_eq!(mask_secret("short"), "****");
/// ```
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let prefix: String = chars[..4].iter().collect();
    let suffix: String = chars[chars.len() - 4..].iter().collect();
    format!("{prefix}****{suffix}")
}

/// Credentials for the ingestion endpoint. `Debug` never prints secrets.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { public_key: String, secret_key: String },
    Bearer(String),
}

impl Credentials {
    pub fn basic(public_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Credentials::Basic { public_key: public_key.into(), secret_key: secret_key.into() }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Credentials::Bearer(token.into())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Credentials::Basic { public_key, secret_key } => {
                if public_key.trim().is_empty() {
                    return Err(ConfigError::InvalidCredentials("public key is empty"));
                }
                if secret_key.trim().is_empty() {
                    return Err(ConfigError::InvalidCredentials("secret key is empty"));
                }
                Ok(())
            }
            Credentials::Bearer(token) if token.trim().is_empty() => {
                Err(ConfigError::InvalidCredentials("bearer token is empty"))
            }
            Credentials::Bearer(_) => Ok(()),
        }
    }

    /// Value for the `Authorization` header.
    pub fn authorization(&self) -> String {
        match self {
            Credentials::Basic { public_key, secret_key } => {
                format!("Basic {}", STANDARD.encode(format!("{public_key}:{secret_key}")))
            }
            Credentials::Bearer(token) => format!("Bearer {token}"),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Basic { public_key, secret_key } => f
                .debug_struct("Basic")
                .field("public_key", &mask_secret(public_key))
                .field("secret_key", &mask_secret(secret_key))
                .finish(),
            Credentials::Bearer(token) => f.debug_tuple("Bearer").field(&mask_secret(token)).finish(),
        }
    }
}

/// Shared, live-updatable value. Reads are lock-free snapshots.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Applies `f` atomically with respect to concurrent updates.
    pub fn update<F>(&self, f: F)
    where
        F: Fn(&T) -> T,
    {
        self.inner.rcu(|current| Arc::new(f(current)));
    }
}

/// Settings that may change while the dispatcher is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunables {
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Tunables {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::NonPositive { field: "batch_size" });
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::NonPositive { field: "flush_interval" });
        }
        Ok(())
    }
}

/// Complete dispatcher configuration. Build it with [`DispatcherConfig::builder`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub credentials: Credentials,
    pub base_url: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_retries: u32,
    pub request_timeout: Duration,
    pub queue_capacity: usize,
    pub max_background_senders: usize,
    pub shutdown_timeout: Duration,
    pub flush_timeout: Duration,
    /// How often a batch rejected by an open circuit is put back on the queue.
    pub max_requeues: u32,
    pub error_buffer: usize,
    pub idle_warning_after: Option<Duration>,
    /// Upper bound on how long `enqueue` waits under `block_on_full`.
    pub block_timeout: Duration,
    pub thresholds: QueueThresholds,
    pub block_on_full: bool,
    pub drop_on_full: bool,
    pub circuit_breaker: CircuitBreakerConfig,
    pub sdk_name: String,
    pub sdk_version: String,
    pub sdk_integration: String,
}

impl DispatcherConfig {
    pub fn builder() -> DispatcherConfigBuilder {
        DispatcherConfigBuilder::default()
    }

    /// Reads `TRACEPOST_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty());
        let mut builder = Self::builder();

        if let Some(token) = var("BEARER_TOKEN") {
            builder = builder.credentials(Credentials::Bearer(token));
        } else {
            match (var("PUBLIC_KEY"), var("SECRET_KEY")) {
                (Some(public_key), Some(secret_key)) => {
                    builder = builder.credentials(Credentials::Basic { public_key, secret_key });
                }
                (None, None) => {}
                (Some(_), None) => return Err(ConfigError::InvalidCredentials("secret key is missing")),
                (None, Some(_)) => return Err(ConfigError::InvalidCredentials("public key is missing")),
            }
        }

        if let Some(url) = var("BASE_URL") {
            builder = builder.base_url(url);
        }
        if let Some(n) = parse_env(&var, "BATCH_SIZE", "TRACEPOST_BATCH_SIZE")? {
            builder = builder.batch_size(n);
        }
        if let Some(ms) = parse_env(&var, "FLUSH_INTERVAL_MS", "TRACEPOST_FLUSH_INTERVAL_MS")? {
            builder = builder.flush_interval(Duration::from_millis(ms));
        }
        if let Some(n) = parse_env(&var, "MAX_RETRIES", "TRACEPOST_MAX_RETRIES")? {
            builder = builder.max_retries(n);
        }
        if let Some(ms) = parse_env(&var, "TIMEOUT_MS", "TRACEPOST_TIMEOUT_MS")? {
            builder = builder.request_timeout(Duration::from_millis(ms));
        }
        if let Some(n) = parse_env(&var, "MAX_BACKGROUND_SENDERS", "TRACEPOST_MAX_BACKGROUND_SENDERS")? {
            builder = builder.max_background_senders(n);
        }
        builder.build()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.credentials.validate()?;
        validate_base_url(&self.base_url)?;
        self.tunables().validate()?;
        OverflowPolicy::from_flags(self.block_on_full, self.drop_on_full)?;
        self.circuit_breaker.validate()?;

        let positive = [
            ("queue_capacity", self.queue_capacity > 0),
            ("max_background_senders", self.max_background_senders > 0),
            ("error_buffer", self.error_buffer > 0),
            ("request_timeout", !self.request_timeout.is_zero()),
            ("shutdown_timeout", !self.shutdown_timeout.is_zero()),
            ("flush_timeout", !self.flush_timeout.is_zero()),
        ];
        match positive.into_iter().find(|(_, ok)| !ok) {
            Some((field, _)) => Err(ConfigError::NonPositive { field }),
            None => Ok(()),
        }
    }

    pub fn tunables(&self) -> Tunables {
        Tunables { batch_size: self.batch_size, flush_interval: self.flush_interval }
    }

    pub fn backpressure(&self) -> BackpressureConfig {
        BackpressureConfig {
            capacity: self.queue_capacity,
            thresholds: self.thresholds,
            block_on_full: self.block_on_full,
            drop_on_full: self.drop_on_full,
        }
    }

    pub fn ingestion_url(&self) -> String {
        format!("{}/api/public/ingestion", self.base_url.trim_end_matches('/'))
    }
}

fn parse_env<T, F>(var: &F, name: &str, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value: raw }),
    }
}

fn validate_base_url(url: &str) -> Result<(), ConfigError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| ConfigError::InvalidBaseUrl { url: url.to_string(), reason: e.to_string() })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::InvalidBaseUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

/// Builder for [`DispatcherConfig`]. Every field except the credentials has a default.
#[derive(Debug, Clone)]
pub struct DispatcherConfigBuilder {
    credentials: Option<Credentials>,
    public_key: Option<String>,
    secret_key: Option<String>,
    config: Defaults,
}

#[derive(Debug, Clone)]
struct Defaults {
    base_url: String,
    batch_size: usize,
    flush_interval: Duration,
    max_retries: u32,
    request_timeout: Duration,
    queue_capacity: usize,
    max_background_senders: usize,
    shutdown_timeout: Duration,
    flush_timeout: Duration,
    max_requeues: u32,
    error_buffer: usize,
    idle_warning_after: Option<Duration>,
    block_timeout: Duration,
    thresholds: QueueThresholds,
    block_on_full: bool,
    drop_on_full: bool,
    circuit_breaker: CircuitBreakerConfig,
    sdk_name: String,
    sdk_version: String,
    sdk_integration: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            max_retries: 3,
            request_timeout: Duration::from_secs(10),
            queue_capacity: 10_000,
            max_background_senders: 10,
            shutdown_timeout: Duration::from_secs(30),
            flush_timeout: Duration::from_secs(30),
            max_requeues: 3,
            error_buffer: crate::async_error::DEFAULT_ERROR_BUFFER,
            idle_warning_after: None,
            block_timeout: Duration::from_secs(5),
            thresholds: QueueThresholds::default(),
            block_on_full: false,
            drop_on_full: false,
            circuit_breaker: CircuitBreakerConfig::default(),
            sdk_name: env!("CARGO_PKG_NAME").to_string(),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
            sdk_integration: "default".to_string(),
        }
    }
}

impl Default for DispatcherConfigBuilder {
    fn default() -> Self {
        Self { credentials: None, public_key: None, secret_key: None, config: Defaults::default() }
    }
}

macro_rules! setters {
    ($($(#[$meta:meta])* $name:ident: $ty:ty),* $(,)?) => {
        $(
            $(#[$meta])*
            pub fn $name(mut self, value: $ty) -> Self {
                self.config.$name = value;
                self
            }
        )*
    };
}

impl DispatcherConfigBuilder {
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn public_key(mut self, key: impl Into<String>) -> Self {
        self.public_key = Some(key.into());
        self
    }

    pub fn secret_key(mut self, key: impl Into<String>) -> Self {
        self.secret_key = Some(key.into());
        self
    }

    pub fn bearer_token(self, token: impl Into<String>) -> Self {
        self.credentials(Credentials::Bearer(token.into()))
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    pub fn idle_warning_after(mut self, after: Duration) -> Self {
        self.config.idle_warning_after = Some(after);
        self
    }

    pub fn sdk(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.config.sdk_name = name.into();
        self.config.sdk_version = version.into();
        self
    }

    setters! {
        batch_size: usize,
        flush_interval: Duration,
        max_retries: u32,
        request_timeout: Duration,
        queue_capacity: usize,
        max_background_senders: usize,
        shutdown_timeout: Duration,
        flush_timeout: Duration,
        max_requeues: u32,
        error_buffer: usize,
        block_timeout: Duration,
        thresholds: QueueThresholds,
        /// Block producers while the queue is at the overflow level.
        block_on_full: bool,
        /// Reject events while the queue is at the overflow level.
        drop_on_full: bool,
        circuit_breaker: CircuitBreakerConfig,
    }

    pub fn build(self) -> Result<DispatcherConfig, ConfigError> {
        let credentials = match (self.credentials, self.public_key, self.secret_key) {
            (Some(credentials), _, _) => credentials,
            (None, Some(public_key), Some(secret_key)) => Credentials::Basic { public_key, secret_key },
            (None, None, None) => return Err(ConfigError::MissingCredentials),
            (None, Some(_), None) => return Err(ConfigError::InvalidCredentials("secret key is missing")),
            (None, None, Some(_)) => return Err(ConfigError::InvalidCredentials("public key is missing")),
        };

        let d = self.config;
        let config = DispatcherConfig {
            credentials,
            base_url: d.base_url,
            batch_size: d.batch_size,
            flush_interval: d.flush_interval,
            max_retries: d.max_retries,
            request_timeout: d.request_timeout,
            queue_capacity: d.queue_capacity,
            max_background_senders: d.max_background_senders,
            shutdown_timeout: d.shutdown_timeout,
            flush_timeout: d.flush_timeout,
            max_requeues: d.max_requeues,
            error_buffer: d.error_buffer,
            idle_warning_after: d.idle_warning_after,
            block_timeout: d.block_timeout,
            thresholds: d.thresholds,
            block_on_full: d.block_on_full,
            drop_on_full: d.drop_on_full,
            circuit_breaker: d.circuit_breaker,
            sdk_name: d.sdk_name,
            sdk_version: d.sdk_version,
            sdk_integration: d.sdk_integration,
        };
        config.validate()?;
        tracing::debug!(
            credentials = ?config.credentials,
            base_url = %config.base_url,
            batch_size = config.batch_size,
            senders = config.max_background_senders,
            "dispatcher configuration validated"
        );
        Ok(config)
    }
}
