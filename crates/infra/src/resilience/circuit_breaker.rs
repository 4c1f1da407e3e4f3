//! Keyed circuit breakers.
//!
//! # States
//! - Closed: calls pass through; consecutive failures are counted
//! - Open: calls fail fast until `reset_timeout` has elapsed since the last failure
//! - Half-Open: up to `half_open_requests` trial calls are admitted
//!
//! One logical operation takes at most one trial admission: retries inside
//! it go through [`CircuitBreakerRegistry::admits_retry`], which consumes
//! nothing. An admission the caller ends up not using is handed back with
//! [`CircuitBreakerRegistry::release`].
//!
//! # State Transitions
//! ```text
//! Closed    → Open:      consecutive_failures reaches failure_threshold
//! Open      → Half-Open: first allow() once now >= last_failure_at + reset_timeout
//! Half-Open → Closed:    half_open_requests consecutive successes
//! Half-Open → Open:      any failure (timer restarts)
//! Half-Open → Half-Open: admissions used up and no outcome for reset_timeout
//!                        (stalled trials are dropped and a new round starts)
//! ```
//!
//! Keys are usually `resource:operation`; every job touching the same resource
//! shares one breaker. State is created lazily on the first failure and is never
//! deleted, only reset. The registry performs no I/O; snapshots are persisted
//! by the caller through a [`super::BreakerStateStore`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use hybridcap_core::Clock;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CLOSED" => Some(CircuitState::Closed),
            "OPEN" => Some(CircuitState::Open),
            "HALF_OPEN" => Some(CircuitState::HalfOpen),
            _ => None,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker thresholds, shared by every key in a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,
    /// Time an open breaker waits after its last failure before a trial.
    pub reset_timeout: Duration,
    /// Trial admissions while half-open, and successes needed to close.
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_requests: 3,
        }
    }
}

/// Persisted state of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub key: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub half_open_trial_count: u32,
    pub half_open_successes: u32,
    /// When the current half-open round began.
    #[serde(default)]
    pub half_open_since: Option<DateTime<Utc>>,
}

impl CircuitBreakerState {
    pub fn closed(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            half_open_trial_count: 0,
            half_open_successes: 0,
            half_open_since: None,
        }
    }

    fn reset_timeout_elapsed(&self, now: DateTime<Utc>, reset_timeout: Duration) -> bool {
        elapsed_since(self.last_failure_at, now, reset_timeout)
    }

    fn open(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.last_failure_at = Some(now);
        self.half_open_trial_count = 0;
        self.half_open_successes = 0;
        self.half_open_since = None;
    }

    fn begin_half_open(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::HalfOpen;
        self.half_open_trial_count = 1;
        self.half_open_successes = 0;
        self.half_open_since = Some(now);
    }
}

fn elapsed_since(at: Option<DateTime<Utc>>, now: DateTime<Utc>, timeout: Duration) -> bool {
    match at {
        Some(at) => {
            let timeout =
                chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::weeks(52));
            now >= at + timeout
        }
        None => true,
    }
}

/// Registry of breakers keyed by remote resource identity.
///
/// Injected into the executor rather than held globally, so tests can run
/// independent registries side by side.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    states: Mutex<HashMap<String, CircuitBreakerState>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn states(&self) -> MutexGuard<'_, HashMap<String, CircuitBreakerState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a call guarded by `key` may proceed.
    ///
    /// An open breaker whose reset timeout has elapsed moves to half-open here
    /// and admits this call as its first trial.
    pub fn allow(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut states = self.states();
        let Some(entry) = states.get_mut(key) else {
            return true;
        };

        match entry.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if entry.reset_timeout_elapsed(now, self.config.reset_timeout) {
                    entry.begin_half_open(now);
                    info!(circuit_key = %key, "circuit half-open, admitting trial call");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if entry.half_open_trial_count < self.config.half_open_requests {
                    entry.half_open_trial_count += 1;
                    true
                } else if elapsed_since(entry.half_open_since, now, self.config.reset_timeout) {
                    warn!(
                        circuit_key = %key,
                        trials = entry.half_open_trial_count,
                        successes = entry.half_open_successes,
                        "half-open trials stalled, starting a new round"
                    );
                    entry.begin_half_open(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Whether a retry of an already admitted operation may proceed.
    ///
    /// Consumes no half-open admission; only an open breaker rejects.
    pub fn admits_retry(&self, key: &str) -> bool {
        self.states()
            .get(key)
            .is_none_or(|entry| entry.state != CircuitState::Open)
    }

    /// Hand back a half-open admission whose operation ended without an
    /// outcome (for example it gave up waiting for quota).
    pub fn release(&self, key: &str) {
        if let Some(entry) = self.states().get_mut(key) {
            if entry.state == CircuitState::HalfOpen
                && entry.half_open_trial_count > entry.half_open_successes
            {
                entry.half_open_trial_count -= 1;
            }
        }
    }

    pub fn record_success(&self, key: &str) {
        let mut states = self.states();
        let Some(entry) = states.get_mut(key) else {
            return;
        };

        match entry.state {
            CircuitState::Closed => entry.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                entry.half_open_successes += 1;
                if entry.half_open_successes >= self.config.half_open_requests {
                    *entry = CircuitBreakerState {
                        last_failure_at: entry.last_failure_at,
                        ..CircuitBreakerState::closed(key)
                    };
                    info!(circuit_key = %key, "circuit closed after successful trials");
                }
            }
            // A call admitted before the breaker opened; it does not close it.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, key: &str) {
        let now = self.clock.now();
        let mut states = self.states();
        let entry = states
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreakerState::closed(key));

        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        match entry.state {
            CircuitState::Closed => {
                entry.last_failure_at = Some(now);
                if entry.consecutive_failures >= self.config.failure_threshold {
                    entry.open(now);
                    warn!(
                        circuit_key = %key,
                        consecutive_failures = entry.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                entry.open(now);
                warn!(circuit_key = %key, "trial call failed, circuit reopened");
            }
            CircuitState::Open => entry.last_failure_at = Some(now),
        }
    }

    /// Current state for `key` (a fresh closed state if the key never failed).
    pub fn get_state(&self, key: &str) -> CircuitBreakerState {
        self.states()
            .get(key)
            .cloned()
            .unwrap_or_else(|| CircuitBreakerState::closed(key))
    }

    /// Return `key` to closed with zeroed counters.
    pub fn reset(&self, key: &str) {
        if let Some(entry) = self.states().get_mut(key) {
            *entry = CircuitBreakerState::closed(key);
            info!(circuit_key = %key, "circuit reset");
        }
    }

    pub fn reset_all(&self) {
        for (key, entry) in self.states().iter_mut() {
            *entry = CircuitBreakerState::closed(key.clone());
        }
        info!("all circuits reset");
    }

    /// Every known breaker, sorted by key.
    pub fn snapshot(&self) -> Vec<CircuitBreakerState> {
        let mut all: Vec<_> = self.states().values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Load previously persisted states (replaces entries with the same key).
    pub fn restore(&self, states: impl IntoIterator<Item = CircuitBreakerState>) {
        let mut current = self.states();
        for state in states {
            current.insert(state.key.clone(), state);
        }
    }
}
