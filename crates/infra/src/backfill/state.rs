//! Backfill state and its transitions.
//!
//! ```text
//! active ──chunk, more remain──▶ active
//! active ──chunk, none remain──▶ completed
//! active ──errors ≥ threshold──▶ paused ──reactivate──▶ active
//! any    ──resource gone───────▶ failed
//! completed ──more items reported──▶ active (reopen)
//! ```

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use hybridcap_core::{DomainError, DomainResult, ResourceId};

use crate::remote::Cursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

impl BackfillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillStatus::Active => "active",
            BackfillStatus::Paused => "paused",
            BackfillStatus::Completed => "completed",
            BackfillStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BackfillStatus::Completed | BackfillStatus::Failed)
    }
}

impl std::fmt::Display for BackfillStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackfillStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(BackfillStatus::Active),
            "paused" => Ok(BackfillStatus::Paused),
            "completed" => Ok(BackfillStatus::Completed),
            "failed" => Ok(BackfillStatus::Failed),
            other => Err(DomainError::validation(format!(
                "unknown backfill status '{other}'"
            ))),
        }
    }
}

/// Resumable ingestion progress for one large resource.
///
/// `processed_items <= total_items` always holds: a chunk that would exceed
/// the estimate raises `total_items` instead. `last_cursor` only moves
/// forward; the store rejects writes that start from a stale cursor.
/// `revision` counts stored writes and is bumped by the store on every save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillState {
    pub resource_id: ResourceId,
    pub resource_name: String,
    pub total_items: u64,
    pub processed_items: u64,
    pub last_cursor: Option<Cursor>,
    pub chunk_size: u32,
    pub status: BackfillStatus,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: Value,
    #[serde(default)]
    pub revision: u64,
}

impl BackfillState {
    pub fn new(
        resource_id: ResourceId,
        resource_name: impl Into<String>,
        total_items: u64,
        chunk_size: u32,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if chunk_size == 0 {
            return Err(DomainError::validation("chunk size must be positive"));
        }
        Ok(Self {
            resource_id,
            resource_name: resource_name.into(),
            total_items,
            processed_items: 0,
            last_cursor: None,
            chunk_size,
            status: BackfillStatus::Active,
            consecutive_errors: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            metadata: Value::Object(Map::new()),
            revision: 0,
        })
    }

    pub fn remaining(&self) -> u64 {
        self.total_items.saturating_sub(self.processed_items)
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_items == 0 {
            return 100.0;
        }
        self.processed_items as f64 * 100.0 / self.total_items as f64
    }

    fn require_active(&self, action: &str) -> DomainResult<()> {
        if self.status != BackfillStatus::Active {
            return Err(DomainError::invariant(format!(
                "cannot {action} backfill for {} while {}",
                self.resource_id, self.status
            )));
        }
        Ok(())
    }

    /// Record a processed chunk.
    ///
    /// Completes when the remote reports no further page or the total is
    /// reached. The cursor is kept when there is no next page so a reopened
    /// backfill resumes from the last position.
    pub fn apply_chunk_success(
        &mut self,
        items: u64,
        next_cursor: Option<Cursor>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.require_active("advance")?;

        self.processed_items = self.processed_items.saturating_add(items);
        if self.processed_items > self.total_items {
            self.total_items = self.processed_items;
        }
        let exhausted = next_cursor.is_none();
        if let Some(next) = next_cursor {
            self.last_cursor = Some(next);
        }
        self.consecutive_errors = 0;
        self.last_error = None;
        self.updated_at = now;

        if exhausted || self.processed_items >= self.total_items {
            self.status = BackfillStatus::Completed;
        }
        Ok(())
    }

    /// Record a failed chunk; pauses once `error_threshold` consecutive
    /// failures are reached. Returns true when this call paused the backfill.
    pub fn apply_chunk_failure(
        &mut self,
        error: impl Into<String>,
        error_threshold: u32,
        now: DateTime<Utc>,
    ) -> DomainResult<bool> {
        self.require_active("record a failure on")?;

        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.last_error = Some(error.into());
        self.updated_at = now;
        if self.consecutive_errors >= error_threshold.max(1) {
            self.status = BackfillStatus::Paused;
            return Ok(true);
        }
        Ok(false)
    }

    /// Unrecoverable failure, e.g. the resource was deleted upstream.
    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = BackfillStatus::Failed;
        self.last_error = Some(error.into());
        self.updated_at = now;
    }

    /// External reactivation of a paused backfill.
    pub fn reactivate(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != BackfillStatus::Paused {
            return Err(DomainError::conflict(format!(
                "only paused backfills can be reactivated; {} is {}",
                self.resource_id, self.status
            )));
        }
        self.status = BackfillStatus::Active;
        self.consecutive_errors = 0;
        self.updated_at = now;
        Ok(())
    }

    /// Restart a completed backfill because the resource grew to `new_total`.
    pub fn reopen(&mut self, new_total: u64, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != BackfillStatus::Completed {
            return Err(DomainError::conflict(format!(
                "only completed backfills can be reopened; {} is {}",
                self.resource_id, self.status
            )));
        }
        if new_total <= self.processed_items {
            return Err(DomainError::validation(format!(
                "reopen total {new_total} does not exceed {} processed items",
                self.processed_items
            )));
        }
        self.total_items = new_total;
        self.status = BackfillStatus::Active;
        self.consecutive_errors = 0;
        self.last_error = None;
        self.updated_at = now;
        Ok(())
    }

    /// Bump `updated_at` without progress (deferred chunk); keeps rotation fair.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}
