//! Orchestrator configuration loaded from environment variables.

use std::time::Duration;

use thiserror::Error;

use crate::backfill::BackfillConfig;
use crate::jobs::{BatchConfig, ImmediateConfig, RoutingPolicy, WindowConfig};
use crate::remote::HttpRemoteConfig;
use crate::resilience::rate_limit::DEFAULT_MAX_RESET_WAIT;
use crate::resilience::{BackoffConfig, CircuitBreakerConfig, RetryConfig};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {name}: {message}")]
    Invalid { name: &'static str, message: String },
}

impl ConfigError {
    fn invalid(name: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            name,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub retry: RetryConfig,
    pub breaker: CircuitBreakerConfig,
    /// Longest rate-limit reset the executor sleeps through.
    pub max_rate_limit_wait: Duration,
    pub routing: RoutingPolicy,
    pub backfill: BackfillConfig,
    pub batch: BatchConfig,
    pub immediate: ImmediateConfig,
    pub window: WindowConfig,
    pub remote: HttpRemoteConfig,
    /// Postgres; in-memory stores when unset.
    pub database_url: Option<String>,
    pub listen_addr: String,
    /// Internal batch tick cadence; ticks are external only when unset.
    pub tick_interval: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            max_rate_limit_wait: DEFAULT_MAX_RESET_WAIT,
            routing: RoutingPolicy::default(),
            backfill: BackfillConfig::default(),
            batch: BatchConfig::default(),
            immediate: ImmediateConfig::default(),
            window: WindowConfig::default(),
            remote: HttpRemoteConfig::default(),
            database_url: None,
            listen_addr: "0.0.0.0:8080".to_string(),
            tick_interval: None,
        }
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(name, format!("'{raw}': {e}"))),
        None => Ok(default),
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl OrchestratorConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key/value source; missing keys keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let lookup = &lookup;

        let backoff = BackoffConfig {
            initial_delay: Duration::from_millis(parse(
                lookup,
                "CAPTURE_INITIAL_DELAY_MS",
                d.retry.backoff.initial_delay.as_millis() as u64,
            )?),
            factor: parse(lookup, "CAPTURE_BACKOFF_FACTOR", d.retry.backoff.factor)?,
            max_delay: Duration::from_millis(parse(
                lookup,
                "CAPTURE_MAX_DELAY_MS",
                d.retry.backoff.max_delay.as_millis() as u64,
            )?),
            jitter: parse(lookup, "CAPTURE_BACKOFF_JITTER", d.retry.backoff.jitter)?,
        };

        let config = Self {
            retry: RetryConfig::new(
                parse(lookup, "CAPTURE_MAX_RETRIES", d.retry.max_retries)?,
                backoff,
            ),
            breaker: CircuitBreakerConfig {
                failure_threshold: parse(
                    lookup,
                    "CAPTURE_BREAKER_FAILURE_THRESHOLD",
                    d.breaker.failure_threshold,
                )?,
                reset_timeout: Duration::from_millis(parse(
                    lookup,
                    "CAPTURE_BREAKER_RESET_TIMEOUT_MS",
                    d.breaker.reset_timeout.as_millis() as u64,
                )?),
                half_open_requests: parse(
                    lookup,
                    "CAPTURE_BREAKER_HALF_OPEN_REQUESTS",
                    d.breaker.half_open_requests,
                )?,
            },
            max_rate_limit_wait: Duration::from_secs(parse(
                lookup,
                "CAPTURE_MAX_RATE_LIMIT_WAIT_SECS",
                d.max_rate_limit_wait.as_secs(),
            )?),
            routing: RoutingPolicy {
                size_threshold: parse(lookup, "CAPTURE_SIZE_THRESHOLD", d.routing.size_threshold)?,
                recency_threshold_days: parse(
                    lookup,
                    "CAPTURE_RECENCY_THRESHOLD_DAYS",
                    d.routing.recency_threshold_days,
                )?,
                items_per_day_estimate: parse(
                    lookup,
                    "CAPTURE_ITEMS_PER_DAY_ESTIMATE",
                    d.routing.items_per_day_estimate,
                )?,
                backfill_threshold: parse(
                    lookup,
                    "CAPTURE_BACKFILL_THRESHOLD",
                    d.routing.backfill_threshold,
                )?,
            },
            backfill: BackfillConfig {
                chunk_size: parse(lookup, "CAPTURE_BACKFILL_CHUNK_SIZE", d.backfill.chunk_size)?,
                error_threshold: parse(
                    lookup,
                    "CAPTURE_BACKFILL_ERROR_THRESHOLD",
                    d.backfill.error_threshold,
                )?,
            },
            batch: BatchConfig {
                max_jobs_per_tick: parse(
                    lookup,
                    "CAPTURE_BATCH_MAX_JOBS_PER_TICK",
                    d.batch.max_jobs_per_tick,
                )?,
                max_backfills_per_tick: parse(
                    lookup,
                    "CAPTURE_BATCH_MAX_BACKFILLS_PER_TICK",
                    d.batch.max_backfills_per_tick,
                )?,
            },
            immediate: ImmediateConfig {
                max_concurrent: parse(
                    lookup,
                    "CAPTURE_IMMEDIATE_MAX_CONCURRENT",
                    d.immediate.max_concurrent,
                )?,
                mode: d.immediate.mode,
            },
            window: WindowConfig {
                page_size: parse(lookup, "CAPTURE_PAGE_SIZE", d.window.page_size)?,
                max_pages: parse(lookup, "CAPTURE_MAX_PAGES", d.window.max_pages)?,
            },
            remote: HttpRemoteConfig {
                base_url: non_empty(lookup, "REMOTE_API_URL").unwrap_or(d.remote.base_url),
                token: non_empty(lookup, "REMOTE_API_TOKEN"),
                collection: non_empty(lookup, "REMOTE_COLLECTION").unwrap_or(d.remote.collection),
                timeout: Duration::from_secs(parse(
                    lookup,
                    "REMOTE_TIMEOUT_SECS",
                    d.remote.timeout.as_secs(),
                )?),
                user_agent: d.remote.user_agent,
            },
            database_url: non_empty(lookup, "DATABASE_URL"),
            listen_addr: non_empty(lookup, "CAPTURE_LISTEN_ADDR").unwrap_or(d.listen_addr),
            tick_interval: non_empty(lookup, "CAPTURE_TICK_INTERVAL_SECS")
                .map(|raw| {
                    raw.parse::<u64>().map(Duration::from_secs).map_err(|e| {
                        ConfigError::invalid("CAPTURE_TICK_INTERVAL_SECS", format!("'{raw}': {e}"))
                    })
                })
                .transpose()?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry
            .backoff
            .validate()
            .map_err(|e| ConfigError::invalid("backoff", e))?;
        if self.retry.max_retries == 0 {
            return Err(ConfigError::invalid("CAPTURE_MAX_RETRIES", "must be at least 1"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "CAPTURE_BREAKER_FAILURE_THRESHOLD",
                "must be at least 1",
            ));
        }
        if self.breaker.half_open_requests == 0 {
            return Err(ConfigError::invalid(
                "CAPTURE_BREAKER_HALF_OPEN_REQUESTS",
                "must be at least 1",
            ));
        }
        if !(1..=100).contains(&self.backfill.chunk_size) {
            return Err(ConfigError::invalid(
                "CAPTURE_BACKFILL_CHUNK_SIZE",
                format!("must be within 1..=100, got {}", self.backfill.chunk_size),
            ));
        }
        if self.backfill.error_threshold == 0 {
            return Err(ConfigError::invalid(
                "CAPTURE_BACKFILL_ERROR_THRESHOLD",
                "must be at least 1",
            ));
        }
        if self.immediate.max_concurrent == 0 {
            return Err(ConfigError::invalid(
                "CAPTURE_IMMEDIATE_MAX_CONCURRENT",
                "must be at least 1",
            ));
        }
        if !(1..=100).contains(&self.window.page_size) || self.window.max_pages == 0 {
            return Err(ConfigError::invalid(
                "CAPTURE_PAGE_SIZE",
                "page size must be within 1..=100 and max pages at least 1",
            ));
        }
        if self.tick_interval.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::invalid("CAPTURE_TICK_INTERVAL_SECS", "must be positive"));
        }
        Ok(())
    }
}
