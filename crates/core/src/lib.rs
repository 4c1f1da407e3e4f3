//! `hybridcap-core`: shared primitives for the capture orchestrator.
//!
//! This crate contains **pure** building blocks (no I/O): identifiers, the
//! caller-facing error model, and the injectable clock used by every
//! time-dependent state machine.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, ResourceId};
