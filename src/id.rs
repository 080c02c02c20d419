//! Event and batch identifiers.
//!
//! Identifiers are UUID-v4 strings built from operating-system randomness.
//! When the OS source keeps failing, [`IdGenerator`] degrades to fallback
//! identifiers of the form `fb-<unix-nanos>-<sequence>-<random>`, which stay
//! unique within the process thanks to a process-wide sequence number.
//! Degradation is counted in an injected [`CryptoFailureCounter`].

use crate::error::IdError;
use rand::rngs::{OsRng, SmallRng};
use rand::{Rng, SeedableRng, TryRngCore};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Prefix carried by every fallback identifier.
pub const FALLBACK_PREFIX: &str = "fb-";

const PRIMARY_ATTEMPTS: usize = 3;

static FALLBACK_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// OS randomness was unavailable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("randomness source failed: {0}")]
pub struct RandomnessError(pub String);

/// Source of cryptographic randomness.
pub trait RandomSource: Send + Sync + fmt::Debug {
    fn fill(&self, dest: &mut [u8]) -> Result<(), RandomnessError>;
}

/// Operating-system randomness.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill(&self, dest: &mut [u8]) -> Result<(), RandomnessError> {
        OsRng.try_fill_bytes(dest).map_err(|e| RandomnessError(e.to_string()))
    }
}

/// Counts how often primary generation failed and the fallback was used.
#[derive(Debug, Default)]
pub struct CryptoFailureCounter {
    failures: AtomicU64,
}

impl CryptoFailureCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    fn increment(&self) -> u64 {
        self.failures.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// A generated identifier, tagged with how it was produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventId {
    Primary(Uuid),
    Fallback(String),
}

impl EventId {
    pub fn is_fallback(&self) -> bool {
        matches!(self, EventId::Fallback(_))
    }

    pub fn into_string(self) -> String {
        match self {
            EventId::Primary(uuid) => uuid.hyphenated().to_string(),
            EventId::Fallback(id) => id,
        }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventId::Primary(uuid) => write!(f, "{}", uuid.hyphenated()),
            EventId::Fallback(id) => f.write_str(id),
        }
    }
}

impl From<EventId> for String {
    fn from(id: EventId) -> Self {
        id.into_string()
    }
}

/// True for identifiers produced in fallback mode. Only meaningful for
/// identifiers that have already been turned into strings.
pub fn is_fallback_id(id: &str) -> bool {
    id.starts_with(FALLBACK_PREFIX)
}

/// Generates event and batch identifiers.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    source: Arc<dyn RandomSource>,
    failures: Arc<CryptoFailureCounter>,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(Arc::new(OsRandom), Arc::new(CryptoFailureCounter::new()))
    }
}

impl IdGenerator {
    pub fn new(source: Arc<dyn RandomSource>, failures: Arc<CryptoFailureCounter>) -> Self {
        Self { source, failures }
    }

    pub fn failure_counter(&self) -> &Arc<CryptoFailureCounter> {
        &self.failures
    }

    /// Generates an identifier, degrading to fallback mode when the
    /// randomness source fails repeatedly.
    pub fn generate(&self) -> Result<EventId, IdError> {
        let mut last_error = None;
        for _ in 0..PRIMARY_ATTEMPTS {
            let mut bytes = [0u8; 16];
            match self.source.fill(&mut bytes) {
                Ok(()) => return Ok(EventId::Primary(uuid::Builder::from_random_bytes(bytes).into_uuid())),
                Err(err) => last_error = Some(err),
            }
        }

        let failures = self.failures.increment();
        tracing::warn!(
            failures,
            error = %last_error.map(|e| e.to_string()).unwrap_or_default(),
            "randomness unavailable; using fallback id"
        );
        fallback_id().map(EventId::Fallback)
    }

    /// Like [`generate`](Self::generate) but never fails in fallback mode.
    ///
    /// # Panics
    ///
    /// Only if both the randomness source and the system clock are unusable.
    pub fn must_generate(&self) -> EventId {
        match self.generate() {
            Ok(id) => id,
            Err(err) => panic!("identifier generation failed in both primary and fallback mode: {err}"),
        }
    }
}

fn fallback_id() -> Result<String, IdError> {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map_err(|_| IdError::ClockBeforeEpoch)?.as_nanos();
    let sequence = FALLBACK_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    // Best effort only; the sequence number is what guarantees uniqueness.
    let seed = (nanos as u64) ^ sequence.rotate_left(32) ^ u64::from(std::process::id());
    let noise: u32 = SmallRng::seed_from_u64(seed).random();
    Ok(format!("{FALLBACK_PREFIX}{nanos}-{sequence}-{noise:08x}"))
}
