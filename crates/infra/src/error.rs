//! Infrastructure error types shared by the stores, router and substrates.

use thiserror::Error;

use hybridcap_core::DomainError;

use crate::resilience::ResilienceError;

/// Persistence error (jobs, breakers, backfills, items).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    /// The row is not in the state the write expected (stale cursor, job
    /// already claimed, ...).
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Error surfaced by the router and the substrates.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    /// Invalid request or illegal transition; never retried.
    #[error(transparent)]
    Caller(#[from] DomainError),
    /// Final outcome of a remote operation after the resilience layer gave up.
    #[error(transparent)]
    Remote(#[from] ResilienceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The chosen substrate refused the hand-off.
    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

impl CaptureError {
    pub fn is_caller_error(&self) -> bool {
        matches!(self, CaptureError::Caller(_))
    }
}
