//! Remote failure classification and final resilience outcomes.

use std::time::Duration;

use thiserror::Error;

/// A single failed remote call, as classified at the API boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Transport failure: connect error, timeout, reset.
    #[error("network error: {0}")]
    Network(String),
    /// HTTP 5xx.
    #[error("server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },
    /// HTTP 429, or a 403 that carries an exhausted quota.
    #[error("rate limited (HTTP {status})")]
    RateLimited {
        status: u16,
        retry_after: Option<Duration>,
    },
    /// HTTP 404/410: the resource no longer exists upstream.
    #[error("resource gone (HTTP {status}): {message}")]
    Gone { status: u16, message: String },
    /// Any other HTTP 4xx.
    #[error("client error (HTTP {status}): {message}")]
    Client { status: u16, message: String },
    /// The response could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => RemoteError::RateLimited {
                status,
                retry_after: None,
            },
            404 | 410 => RemoteError::Gone { status, message },
            500..=599 => RemoteError::Server { status, message },
            _ => RemoteError::Client { status, message },
        }
    }

    /// Retryable set: network failures, 5xx, rate limiting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::Network(_) | RemoteError::Server { .. } | RemoteError::RateLimited { .. }
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, RemoteError::RateLimited { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Server { status, .. }
            | RemoteError::RateLimited { status, .. }
            | RemoteError::Gone { status, .. }
            | RemoteError::Client { status, .. } => Some(*status),
            RemoteError::Network(_) | RemoteError::Decode(_) => None,
        }
    }
}

/// Final outcome of a logical operation run through the executor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResilienceError {
    /// The breaker for `key` rejected the call; nothing was sent upstream.
    #[error("circuit open for {key}")]
    CircuitOpen { key: String },
    /// A non-retryable failure ended the operation.
    #[error("{source} (non-retryable, after {attempts} attempt(s))")]
    NonRetryable { attempts: u32, source: RemoteError },
    /// Every permitted attempt failed with a retryable error.
    #[error("{source} (retries exhausted after {attempts} attempt(s))")]
    Exhausted { attempts: u32, source: RemoteError },
    /// The quota reset is further away than the executor is allowed to sleep.
    #[error("rate limit quota exhausted; reset in {}s exceeds the allowed wait", wait.as_secs())]
    QuotaExhausted { wait: Duration },
}

impl ResilienceError {
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            ResilienceError::NonRetryable { source, .. }
            | ResilienceError::Exhausted { source, .. } => Some(source),
            ResilienceError::CircuitOpen { .. } | ResilienceError::QuotaExhausted { .. } => None,
        }
    }

    /// Number of remote calls actually made.
    pub fn attempts(&self) -> u32 {
        match self {
            ResilienceError::NonRetryable { attempts, .. }
            | ResilienceError::Exhausted { attempts, .. } => *attempts,
            ResilienceError::CircuitOpen { .. } | ResilienceError::QuotaExhausted { .. } => 0,
        }
    }

    /// The upstream resource no longer exists; retrying can never succeed.
    pub fn is_resource_gone(&self) -> bool {
        matches!(
            self,
            ResilienceError::NonRetryable {
                source: RemoteError::Gone { .. },
                ..
            }
        )
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }
}
