//! Resilience layer wrapping every remote call.
//!
//! ## Components
//!
//! - `BackoffConfig`: pure exponential delay computation with optional jitter
//! - `CircuitBreakerRegistry`: keyed CLOSED/OPEN/HALF_OPEN state machines
//! - `RateLimitGovernor`: last observed quota and the wait it implies
//! - `ResilientExecutor`: the single place retry decisions are made
//!
//! Callers above the executor (router, substrates, backfill machine) only
//! ever see a final success or a final [`ResilienceError`].

pub mod backoff;
pub mod circuit_breaker;
pub mod error;
pub mod executor;
pub mod rate_limit;
pub mod sleeper;
pub mod store;

pub use backoff::{BackoffConfig, JITTER_RATIO};
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerState, CircuitState,
};
pub use error::{RemoteError, ResilienceError};
pub use executor::{ResilientExecutor, RetryConfig};
pub use rate_limit::{RateLimitGovernor, RateLimitInfo};
pub use sleeper::{RecordingSleeper, Sleeper, TokioSleeper};
pub use store::{BreakerStateStore, InMemoryBreakerStateStore, PostgresBreakerStateStore};
