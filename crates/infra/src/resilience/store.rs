//! Persistence of circuit breaker state across restarts.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use super::circuit_breaker::{CircuitBreakerState, CircuitState};
use crate::error::StoreError;
use crate::postgres::{from_i32, map_sqlx_error, to_i32};

/// Breaker state persistence. Rows are keyed by breaker key and upserted.
#[async_trait]
pub trait BreakerStateStore: Send + Sync + std::fmt::Debug {
    async fn save_all(&self, states: &[CircuitBreakerState]) -> Result<(), StoreError>;

    async fn load_all(&self) -> Result<Vec<CircuitBreakerState>, StoreError>;
}

/// In-memory breaker store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryBreakerStateStore {
    states: RwLock<BTreeMap<String, CircuitBreakerState>>,
}

impl InMemoryBreakerStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl BreakerStateStore for InMemoryBreakerStateStore {
    async fn save_all(&self, states: &[CircuitBreakerState]) -> Result<(), StoreError> {
        let mut stored = self
            .states
            .write()
            .map_err(|_| StoreError::Storage("breaker store lock poisoned".into()))?;
        for state in states {
            stored.insert(state.key.clone(), state.clone());
        }
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<CircuitBreakerState>, StoreError> {
        let stored = self
            .states
            .read()
            .map_err(|_| StoreError::Storage("breaker store lock poisoned".into()))?;
        Ok(stored.values().cloned().collect())
    }
}

/// Postgres-backed breaker store (`circuit_breaker_states`).
#[derive(Debug, Clone)]
pub struct PostgresBreakerStateStore {
    pool: Arc<PgPool>,
}

impl PostgresBreakerStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl BreakerStateStore for PostgresBreakerStateStore {
    async fn save_all(&self, states: &[CircuitBreakerState]) -> Result<(), StoreError> {
        for state in states {
            sqlx::query(
                r#"
                INSERT INTO circuit_breaker_states (
                    key,
                    state,
                    consecutive_failures,
                    last_failure_at,
                    half_open_trial_count,
                    half_open_successes,
                    half_open_since,
                    updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
                ON CONFLICT (key)
                DO UPDATE SET
                    state = EXCLUDED.state,
                    consecutive_failures = EXCLUDED.consecutive_failures,
                    last_failure_at = EXCLUDED.last_failure_at,
                    half_open_trial_count = EXCLUDED.half_open_trial_count,
                    half_open_successes = EXCLUDED.half_open_successes,
                    half_open_since = EXCLUDED.half_open_since,
                    updated_at = NOW()
                "#,
            )
            .bind(&state.key)
            .bind(state.state.as_str())
            .bind(to_i32(state.consecutive_failures))
            .bind(state.last_failure_at)
            .bind(to_i32(state.half_open_trial_count))
            .bind(to_i32(state.half_open_successes))
            .bind(state.half_open_since)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("save_breaker_state", e))?;
        }
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<CircuitBreakerState>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                key,
                state,
                consecutive_failures,
                last_failure_at,
                half_open_trial_count,
                half_open_successes,
                half_open_since
            FROM circuit_breaker_states
            ORDER BY key ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_breaker_states", e))?;

        let mut states = Vec::with_capacity(rows.len());
        for row in rows {
            let raw_state: String = row
                .try_get("state")
                .map_err(|e| map_sqlx_error("load_breaker_states", e))?;
            let state = CircuitState::parse(&raw_state).ok_or_else(|| {
                StoreError::Storage(format!("unknown circuit state '{raw_state}'"))
            })?;
            let last_failure_at: Option<DateTime<Utc>> = row
                .try_get("last_failure_at")
                .map_err(|e| map_sqlx_error("load_breaker_states", e))?;
            let half_open_since: Option<DateTime<Utc>> = row
                .try_get("half_open_since")
                .map_err(|e| map_sqlx_error("load_breaker_states", e))?;

            states.push(CircuitBreakerState {
                key: row
                    .try_get("key")
                    .map_err(|e| map_sqlx_error("load_breaker_states", e))?,
                state,
                consecutive_failures: from_i32(
                    row.try_get("consecutive_failures")
                        .map_err(|e| map_sqlx_error("load_breaker_states", e))?,
                ),
                last_failure_at,
                half_open_trial_count: from_i32(
                    row.try_get("half_open_trial_count")
                        .map_err(|e| map_sqlx_error("load_breaker_states", e))?,
                ),
                half_open_successes: from_i32(
                    row.try_get("half_open_successes")
                        .map_err(|e| map_sqlx_error("load_breaker_states", e))?,
                ),
                half_open_since,
            });
        }
        Ok(states)
    }
}
