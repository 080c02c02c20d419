//! Jitter strategies applied to retry delays.
//!
//! - `None`: deterministic delays for tests or tightly controlled workflows.
//! - `Proportional`: multiply by a factor drawn from `[0.5, 1.5)`; this is what
//!   [`crate::ExponentialBackoff`] uses when jitter is enabled.
//! - `Full`: uniform in `[0, delay]`.
//! - `Equal`: uniform in `[delay/2, delay]`.
//!
//! Uses `rand`'s thread-local RNG by default; inject a seeded RNG through
//! [`Jitter::apply_with_rng`] for reproducible tests.

use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Jitter {
    #[default]
    None,
    Proportional,
    Full,
    Equal,
}

impl Jitter {
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rng())
    }

    /// Apply jitter with a caller-supplied RNG.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Proportional => {
                let factor: f64 = rng.random_range(0.5..1.5);
                Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay)
            }
            Jitter::Full => {
                let millis = as_millis_saturated(delay);
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
            Jitter::Equal => {
                let millis = as_millis_saturated(delay);
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(millis / 2..=millis))
            }
        }
    }
}

fn as_millis_saturated(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}
