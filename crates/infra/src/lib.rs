//! Infrastructure layer for the hybrid capture orchestrator.
//!
//! - `resilience`: backoff, circuit breaking, rate-limit governance and the
//!   retry wrapper every remote call goes through
//! - `remote`: the paginated remote API boundary and its HTTP adapter
//! - `sink`: idempotent persistence of captured items
//! - `jobs`: job model, store, router and the two execution substrates
//! - `backfill`: the resumable, chunked backfill state machine
//! - `orchestrator`: wiring of all of the above for a process

pub mod backfill;
pub mod config;
pub mod error;
pub mod jobs;
pub mod orchestrator;
pub mod postgres;
pub mod remote;
pub mod resilience;
pub mod sink;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{ConfigError, OrchestratorConfig};
pub use error::{CaptureError, StoreError};
pub use orchestrator::Orchestrator;

#[cfg(test)]
mod integration_tests;
