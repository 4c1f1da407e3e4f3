//! Backoff engine: exponential growth, a hard cap, optional jitter.
//!
//! `base(attempt) = min(initial_delay * factor^attempt, max_delay)`; with
//! jitter the result is drawn uniformly from `base ± 30%` and clamped to
//! `[0, max_delay]`. Jitter decorrelates concurrent retriers hitting the same
//! remote resource.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Fraction of the base delay used as the jitter amplitude.
pub const JITTER_RATIO: f64 = 0.3;

/// Backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry (attempt 0).
    pub initial_delay: Duration,
    /// Growth factor per attempt (>= 1.0).
    pub factor: f64,
    /// Upper bound for any computed delay.
    pub max_delay: Duration,
    /// Spread delays by ±30%.
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_000),
            factor: 2.0,
            max_delay: Duration::from_millis(30_000),
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Exponential backoff without jitter.
    pub fn exponential(initial_delay: Duration, factor: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            factor,
            max_delay,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Check the invariants the delay computation relies on.
    pub fn validate(&self) -> Result<(), String> {
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(format!("backoff factor must be >= 1.0, got {}", self.factor));
        }
        if self.initial_delay > self.max_delay {
            return Err(format!(
                "initial delay {:?} exceeds max delay {:?}",
                self.initial_delay, self.max_delay
            ));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);

        // powi overflows to +inf for large attempts; min() brings it back to the cap.
        let ms = (initial_ms * self.factor.powi(exponent)).min(max_ms);
        duration_from_ms(ms)
    }

    /// Delay before retry number `attempt` (0-based), jittered when enabled.
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }

        let base_ms = base.as_nanos() as f64 / 1_000_000.0;
        let max_ms = self.max_delay.as_millis() as f64;
        let amount = base_ms * JITTER_RATIO;
        let offset = if amount > 0.0 {
            rng.gen_range(-amount..=amount)
        } else {
            0.0
        };

        duration_from_ms((base_ms + offset).clamp(0.0, max_ms))
    }
}

fn duration_from_ms(ms: f64) -> Duration {
    if ms.is_finite() && ms > 0.0 {
        Duration::from_nanos((ms * 1_000_000.0).round() as u64)
    } else {
        Duration::ZERO
    }
}
