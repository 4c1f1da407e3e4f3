//! Resilient executor: the single place retry decisions are made.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::backoff::BackoffConfig;
use super::circuit_breaker::CircuitBreakerRegistry;
use super::error::{RemoteError, ResilienceError};
use super::rate_limit::RateLimitGovernor;
use super::sleeper::Sleeper;

/// Retry policy for one logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first call.
    pub max_retries: u32,
    pub backoff: BackoffConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffConfig::default(),
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, backoff: BackoffConfig) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

/// Wraps remote calls with breaker checks, quota waits and backoff.
#[derive(Debug)]
pub struct ResilientExecutor {
    breakers: Arc<CircuitBreakerRegistry>,
    governor: Arc<RateLimitGovernor>,
    sleeper: Arc<dyn Sleeper>,
    rng: Mutex<StdRng>,
}

impl ResilientExecutor {
    pub fn new(
        breakers: Arc<CircuitBreakerRegistry>,
        governor: Arc<RateLimitGovernor>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            breakers,
            governor,
            sleeper,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Seed the jitter source (deterministic delays in tests and benches).
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn governor(&self) -> &Arc<RateLimitGovernor> {
        &self.governor
    }

    fn backoff_delay(&self, backoff: &BackoffConfig, attempt: u32) -> Duration {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        backoff.delay(attempt, &mut *rng)
    }

    /// Run `operation` until it succeeds, fails non-retryably, or the
    /// attempt budget is spent.
    ///
    /// The breaker for `circuit_key` admits the operation once, is consulted
    /// again before each retry, and is updated once with the final outcome.
    /// A rejected attempt returns [`ResilienceError::CircuitOpen`] without
    /// calling `operation`. Giving up on quota hands the admission back.
    pub async fn execute_with_backoff<T, F, Fut>(
        &self,
        cfg: &RetryConfig,
        circuit_key: Option<&str>,
        mut operation: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let max_attempts = cfg.attempts();
        let mut attempt: u32 = 0;

        loop {
            if let Some(key) = circuit_key {
                let admitted = if attempt == 0 {
                    self.breakers.allow(key)
                } else {
                    self.breakers.admits_retry(key)
                };
                if !admitted {
                    debug!(circuit_key = %key, attempt, "circuit open, failing fast");
                    return Err(ResilienceError::CircuitOpen {
                        key: key.to_string(),
                    });
                }
            }

            let quota_wait = self.governor.wait_before_next_call();
            if !quota_wait.is_zero() {
                if self.governor.exceeds_max_wait(quota_wait) {
                    self.release(circuit_key);
                    return Err(ResilienceError::QuotaExhausted { wait: quota_wait });
                }
                debug!(wait_ms = quota_wait.as_millis() as u64, "quota exhausted, waiting for reset");
                self.sleeper.sleep(quota_wait).await;
            }

            let err = match operation().await {
                Ok(value) => {
                    if let Some(key) = circuit_key {
                        self.breakers.record_success(key);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let attempts = attempt + 1;
            if !err.is_retryable() {
                self.record_failure(circuit_key);
                warn!(
                    circuit_key = circuit_key.unwrap_or("-"),
                    attempt = attempts,
                    error = %err,
                    "non-retryable remote error"
                );
                return Err(ResilienceError::NonRetryable {
                    attempts,
                    source: err,
                });
            }

            if attempts >= max_attempts {
                self.record_failure(circuit_key);
                warn!(
                    circuit_key = circuit_key.unwrap_or("-"),
                    attempts,
                    error = %err,
                    "retries exhausted"
                );
                return Err(ResilienceError::Exhausted {
                    attempts,
                    source: err,
                });
            }

            let backoff = self.backoff_delay(&cfg.backoff, attempt);
            let wait = match &err {
                RemoteError::RateLimited { retry_after, .. } => {
                    self.governor.rate_limited_wait(backoff, *retry_after)
                }
                _ => backoff,
            };
            if self.governor.exceeds_max_wait(wait) {
                warn!(
                    circuit_key = circuit_key.unwrap_or("-"),
                    wait_ms = wait.as_millis() as u64,
                    "rate limit reset beyond the allowed wait"
                );
                self.release(circuit_key);
                return Err(ResilienceError::QuotaExhausted { wait });
            }

            warn!(
                circuit_key = circuit_key.unwrap_or("-"),
                attempt = attempts,
                max_attempts,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "remote call failed, retrying"
            );
            self.sleeper.sleep(wait).await;
            attempt += 1;
        }
    }

    fn record_failure(&self, circuit_key: Option<&str>) {
        if let Some(key) = circuit_key {
            self.breakers.record_failure(key);
        }
    }

    fn release(&self, circuit_key: Option<&str>) {
        if let Some(key) = circuit_key {
            self.breakers.release(key);
        }
    }
}
