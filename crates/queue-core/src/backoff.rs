//! Backoff with jitter for marker-range collisions and claim-allocation retries.
//!
//! `delay = (attempt / max_attempts) * base_interval * jitter_factor`, with
//! `jitter_factor` drawn uniformly from `[1, 1 + jitter]`.

use std::time::Duration;

use rand::Rng;

use crate::error::BrokerError;

/// Parameters for the backoff schedule. Constructed once from configuration
/// and reused across retry loops.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub max_attempts: u32,
    pub base_interval: Duration,
    pub jitter: f64,
}

impl BackoffConfig {
    /// Validate the invariants (`max_attempts > 0`, `base_interval > 0`,
    /// `jitter >= 0`). A caller that constructs an invalid config has a bug,
    /// not a bad request — callers should validate configuration once at
    /// startup and propagate the invariant error there.
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.max_attempts == 0 {
            return Err(BrokerError::invariant("max_attempts must be greater than zero"));
        }
        if self.base_interval.is_zero() {
            return Err(BrokerError::invariant("base_interval must be greater than zero"));
        }
        if self.jitter < 0.0 {
            return Err(BrokerError::invariant("jitter must be non-negative"));
        }
        Ok(())
    }
}

/// Compute the delay for a given retry attempt (0-indexed).
///
/// `rng` supplies the uniform jitter draw; production callers pass
/// `rand::thread_rng()`, tests pass a seeded RNG for determinism.
pub fn calculate_backoff(
    attempt: u32,
    config: &BackoffConfig,
    rng: &mut impl Rng,
) -> Result<Duration, BrokerError> {
    config.validate()?;

    if attempt >= config.max_attempts {
        return Err(BrokerError::invariant(format!(
            "attempt {attempt} must be less than max_attempts {}",
            config.max_attempts
        )));
    }

    let jitter_factor = if config.jitter == 0.0 {
        1.0
    } else {
        rng.gen_range(1.0..=(1.0 + config.jitter))
    };

    let fraction = f64::from(attempt) / f64::from(config.max_attempts);
    let delay_secs = fraction * config.base_interval.as_secs_f64() * jitter_factor;

    Ok(Duration::from_secs_f64(delay_secs.max(0.0)))
}
