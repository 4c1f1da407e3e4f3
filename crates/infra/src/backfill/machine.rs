//! Progressive backfill driver: one bounded chunk per invocation.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use hybridcap_core::{Clock, DomainError, ResourceId};

use super::state::{BackfillState, BackfillStatus};
use super::store::BackfillStore;
use crate::error::{CaptureError, StoreError};
use crate::jobs::capture::CaptureService;
use crate::remote::Cursor;
use crate::resilience::ResilienceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillConfig {
    /// Items per chunk for new backfills (1..=100).
    pub chunk_size: u32,
    /// Consecutive chunk failures that pause a backfill.
    pub error_threshold: u32,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            chunk_size: 25,
            error_threshold: 3,
        }
    }
}

/// What one `run_chunk` call did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChunkOutcome {
    Advanced { processed_items: u64, total_items: u64 },
    Completed { processed_items: u64 },
    /// The chunk failed; the backfill stays active for the next tick.
    Retrying { consecutive_errors: u32, error: String },
    Paused { consecutive_errors: u32, error: String },
    /// The resource is gone upstream.
    Failed { error: String },
    /// The resource's breaker is open; no error was counted.
    Deferred,
    /// The backfill is not active.
    Skipped { status: BackfillStatus },
}

impl ChunkOutcome {
    /// The backfill reached a terminal state with this chunk.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChunkOutcome::Completed { .. } | ChunkOutcome::Failed { .. })
    }
}

#[derive(Debug)]
pub struct BackfillMachine {
    store: Arc<dyn BackfillStore>,
    capture: Arc<CaptureService>,
    config: BackfillConfig,
    clock: Arc<dyn Clock>,
}

impl BackfillMachine {
    pub fn new(
        store: Arc<dyn BackfillStore>,
        capture: Arc<CaptureService>,
        config: BackfillConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            capture,
            config,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn BackfillStore> {
        &self.store
    }

    /// Create the backfill for a resource, or reuse the existing one.
    ///
    /// A completed backfill is reopened when `estimated_total` exceeds what
    /// was captured; an unfinished one has its total raised if needed.
    pub async fn start(
        &self,
        resource_id: &ResourceId,
        resource_name: &str,
        estimated_total: u64,
    ) -> Result<BackfillState, CaptureError> {
        let now = self.clock.now();
        let Some(mut state) = self.store.get(resource_id).await? else {
            let fresh = BackfillState::new(
                resource_id.clone(),
                resource_name,
                estimated_total,
                self.config.chunk_size,
                now,
            )?;
            let stored = self.store.create_if_absent(&fresh).await?;
            info!(
                resource_id = %resource_id,
                total_items = stored.total_items,
                chunk_size = stored.chunk_size,
                "backfill created"
            );
            return Ok(stored);
        };

        let expected = state.last_cursor.clone();
        match state.status {
            BackfillStatus::Completed if estimated_total > state.processed_items => {
                state.reopen(estimated_total, now)?;
                info!(
                    resource_id = %resource_id,
                    total_items = estimated_total,
                    "completed backfill reopened"
                );
            }
            BackfillStatus::Active | BackfillStatus::Paused
                if estimated_total > state.total_items =>
            {
                state.total_items = estimated_total;
                state.touch(now);
            }
            _ => return Ok(state),
        }
        self.persist(&mut state, expected.as_ref()).await?;
        Ok(state)
    }

    /// Process at most one chunk for `resource_id`, starting at its cursor.
    pub async fn run_chunk(&self, resource_id: &ResourceId) -> Result<ChunkOutcome, CaptureError> {
        let mut state = self
            .store
            .get(resource_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("backfill {resource_id}")))?;
        if state.status != BackfillStatus::Active {
            return Ok(ChunkOutcome::Skipped {
                status: state.status,
            });
        }

        let start_cursor = state.last_cursor.clone();
        let fetched = self
            .capture
            .fetch_chunk(
                &state.resource_id,
                &state.resource_name,
                start_cursor.as_ref(),
                state.chunk_size,
            )
            .await;

        let now = self.clock.now();
        let page = match fetched {
            Ok(page) => page,
            Err(ResilienceError::CircuitOpen { key }) => {
                info!(resource_id = %resource_id, circuit_key = %key, "breaker open, chunk deferred");
                state.touch(now);
                self.persist(&mut state, start_cursor.as_ref()).await?;
                return Ok(ChunkOutcome::Deferred);
            }
            Err(err) if err.is_resource_gone() => {
                let error = err.to_string();
                warn!(resource_id = %resource_id, error = %error, "resource gone, backfill failed");
                state.mark_failed(error.clone(), now);
                self.persist(&mut state, start_cursor.as_ref()).await?;
                return Ok(ChunkOutcome::Failed { error });
            }
            Err(err) => return self.record_failure(state, start_cursor, err.to_string()).await,
        };

        // Items are written before the cursor moves: a crash in between
        // replays the same range, which the upserts absorb.
        if let Err(err) = self.capture.store_items(&state.resource_id, &page.items).await {
            return self
                .record_failure(state, start_cursor, format!("storing chunk failed: {err}"))
                .await;
        }

        state.apply_chunk_success(page.items.len() as u64, page.next_cursor, now)?;
        self.persist(&mut state, start_cursor.as_ref()).await?;

        info!(
            resource_id = %resource_id,
            processed_items = state.processed_items,
            total_items = state.total_items,
            progress = %format!("{:.1}%", state.progress_percent()),
            "backfill chunk processed"
        );

        if state.status == BackfillStatus::Completed {
            info!(resource_id = %resource_id, processed_items = state.processed_items, "backfill completed");
            return Ok(ChunkOutcome::Completed {
                processed_items: state.processed_items,
            });
        }
        Ok(ChunkOutcome::Advanced {
            processed_items: state.processed_items,
            total_items: state.total_items,
        })
    }

    async fn record_failure(
        &self,
        mut state: BackfillState,
        start_cursor: Option<Cursor>,
        error: String,
    ) -> Result<ChunkOutcome, CaptureError> {
        let paused =
            state.apply_chunk_failure(error.clone(), self.config.error_threshold, self.clock.now())?;
        self.persist(&mut state, start_cursor.as_ref()).await?;

        if paused {
            warn!(
                resource_id = %state.resource_id,
                consecutive_errors = state.consecutive_errors,
                error = %error,
                "backfill paused"
            );
            return Ok(ChunkOutcome::Paused {
                consecutive_errors: state.consecutive_errors,
                error,
            });
        }
        warn!(
            resource_id = %state.resource_id,
            consecutive_errors = state.consecutive_errors,
            error = %error,
            "backfill chunk failed, will retry on next tick"
        );
        Ok(ChunkOutcome::Retrying {
            consecutive_errors: state.consecutive_errors,
            error,
        })
    }

    async fn persist(
        &self,
        state: &mut BackfillState,
        expected_cursor: Option<&Cursor>,
    ) -> Result<(), StoreError> {
        self.store.save(state, expected_cursor).await?;
        state.revision += 1;
        Ok(())
    }

    /// External reactivation of a paused backfill.
    pub async fn reactivate(&self, resource_id: &ResourceId) -> Result<BackfillState, CaptureError> {
        let mut state = self
            .store
            .get(resource_id)
            .await?
            .ok_or_else(DomainError::not_found)?;
        let expected = state.last_cursor.clone();
        state.reactivate(self.clock.now())?;
        self.persist(&mut state, expected.as_ref()).await?;
        info!(resource_id = %resource_id, "backfill reactivated");
        Ok(state)
    }
}
