//! Backfill state persistence.
//!
//! Writes are compare-and-set. A writer names the cursor its chunk started
//! from, and `state.revision` must still match the stored row. A stale writer
//! gets `StoreError::Conflict`, so the cursor is never rewound and a failure
//! count cannot overwrite a concurrent total raise. A successful save stores
//! `revision + 1`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use hybridcap_core::ResourceId;

use super::state::{BackfillState, BackfillStatus};
use crate::error::StoreError;
use crate::postgres::{from_i32, from_i64, map_sqlx_error, to_i32, to_i64};
use crate::remote::Cursor;

#[async_trait]
pub trait BackfillStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, resource_id: &ResourceId) -> Result<Option<BackfillState>, StoreError>;

    /// Insert `state` unless a row for the resource exists; returns the row
    /// that is stored afterwards.
    async fn create_if_absent(&self, state: &BackfillState) -> Result<BackfillState, StoreError>;

    /// Overwrite the row if its cursor still equals `expected_cursor` and its
    /// revision still equals `state.revision`.
    async fn save(
        &self,
        state: &BackfillState,
        expected_cursor: Option<&Cursor>,
    ) -> Result<(), StoreError>;

    /// Rows ordered least recently updated first.
    async fn list(
        &self,
        status: Option<BackfillStatus>,
        limit: usize,
    ) -> Result<Vec<BackfillState>, StoreError>;
}

/// In-memory backfill store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryBackfillStore {
    states: RwLock<HashMap<ResourceId, BackfillState>>,
}

impl InMemoryBackfillStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<ResourceId, BackfillState>>, StoreError> {
        self.states
            .read()
            .map_err(|_| StoreError::Storage("backfill store lock poisoned".into()))
    }

    fn write(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<ResourceId, BackfillState>>, StoreError> {
        self.states
            .write()
            .map_err(|_| StoreError::Storage("backfill store lock poisoned".into()))
    }
}

#[async_trait]
impl BackfillStore for InMemoryBackfillStore {
    async fn get(&self, resource_id: &ResourceId) -> Result<Option<BackfillState>, StoreError> {
        Ok(self.read()?.get(resource_id).cloned())
    }

    async fn create_if_absent(&self, state: &BackfillState) -> Result<BackfillState, StoreError> {
        let mut states = self.write()?;
        Ok(states
            .entry(state.resource_id.clone())
            .or_insert_with(|| state.clone())
            .clone())
    }

    async fn save(
        &self,
        state: &BackfillState,
        expected_cursor: Option<&Cursor>,
    ) -> Result<(), StoreError> {
        let mut states = self.write()?;
        let current = states
            .get_mut(&state.resource_id)
            .ok_or_else(|| StoreError::NotFound(format!("backfill {}", state.resource_id)))?;
        if current.last_cursor.as_ref() != expected_cursor || current.revision != state.revision {
            return Err(stale_writer(&state.resource_id));
        }
        *current = BackfillState {
            revision: state.revision + 1,
            ..state.clone()
        };
        Ok(())
    }

    async fn list(
        &self,
        status: Option<BackfillStatus>,
        limit: usize,
    ) -> Result<Vec<BackfillState>, StoreError> {
        let states = self.read()?;
        let mut result: Vec<_> = states
            .values()
            .filter(|s| status.is_none_or(|st| s.status == st))
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.resource_id.cmp(&b.resource_id))
        });
        result.truncate(limit);
        Ok(result)
    }
}

fn stale_writer(resource_id: &ResourceId) -> StoreError {
    StoreError::Conflict(format!(
        "backfill {resource_id} was modified by another writer"
    ))
}

/// Postgres-backed backfill store (`backfill_states`).
#[derive(Debug, Clone)]
pub struct PostgresBackfillStore {
    pool: Arc<PgPool>,
}

impl PostgresBackfillStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

const BACKFILL_COLUMNS: &str = "resource_id, resource_name, total_items, processed_items, \
     last_cursor, chunk_size, status, consecutive_errors, last_error, created_at, updated_at, metadata, revision";

fn backfill_from_row(row: &PgRow) -> Result<BackfillState, StoreError> {
    let decode = |e| map_sqlx_error("decode_backfill", e);

    let resource_id: String = row.try_get("resource_id").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let last_cursor: Option<String> = row.try_get("last_cursor").map_err(decode)?;

    Ok(BackfillState {
        resource_id: ResourceId::new(resource_id)
            .map_err(|e| StoreError::Storage(format!("invalid resource_id in backfill_states: {e}")))?,
        resource_name: row.try_get("resource_name").map_err(decode)?,
        total_items: from_i64(row.try_get("total_items").map_err(decode)?),
        processed_items: from_i64(row.try_get("processed_items").map_err(decode)?),
        last_cursor: last_cursor.map(Cursor::new),
        chunk_size: from_i32(row.try_get("chunk_size").map_err(decode)?),
        status: status
            .parse()
            .map_err(|e| StoreError::Storage(format!("invalid status in backfill_states: {e}")))?,
        consecutive_errors: from_i32(row.try_get("consecutive_errors").map_err(decode)?),
        last_error: row.try_get("last_error").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
        metadata: row.try_get("metadata").map_err(decode)?,
        revision: from_i64(row.try_get("revision").map_err(decode)?),
    })
}

#[async_trait]
impl BackfillStore for PostgresBackfillStore {
    async fn get(&self, resource_id: &ResourceId) -> Result<Option<BackfillState>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {BACKFILL_COLUMNS} FROM backfill_states WHERE resource_id = $1"
        ))
        .bind(resource_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_backfill", e))?;
        row.as_ref().map(backfill_from_row).transpose()
    }

    async fn create_if_absent(&self, state: &BackfillState) -> Result<BackfillState, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO backfill_states (
                resource_id, resource_name, total_items, processed_items, last_cursor,
                chunk_size, status, consecutive_errors, last_error, created_at, updated_at, metadata,
                revision
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 0)
            ON CONFLICT (resource_id) DO NOTHING
            "#,
        )
        .bind(state.resource_id.as_str())
        .bind(&state.resource_name)
        .bind(to_i64(state.total_items))
        .bind(to_i64(state.processed_items))
        .bind(state.last_cursor.as_ref().map(Cursor::as_str))
        .bind(to_i32(state.chunk_size))
        .bind(state.status.as_str())
        .bind(to_i32(state.consecutive_errors))
        .bind(state.last_error.as_deref())
        .bind(state.created_at)
        .bind(state.updated_at)
        .bind(&state.metadata)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_backfill", e))?;

        self.get(&state.resource_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("backfill {}", state.resource_id)))
    }

    async fn save(
        &self,
        state: &BackfillState,
        expected_cursor: Option<&Cursor>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE backfill_states SET
                resource_name = $2,
                total_items = $3,
                processed_items = $4,
                last_cursor = $5,
                chunk_size = $6,
                status = $7,
                consecutive_errors = $8,
                last_error = $9,
                updated_at = $10,
                metadata = $11,
                revision = revision + 1
            WHERE resource_id = $1
              AND last_cursor IS NOT DISTINCT FROM $12
              AND revision = $13
            "#,
        )
        .bind(state.resource_id.as_str())
        .bind(&state.resource_name)
        .bind(to_i64(state.total_items))
        .bind(to_i64(state.processed_items))
        .bind(state.last_cursor.as_ref().map(Cursor::as_str))
        .bind(to_i32(state.chunk_size))
        .bind(state.status.as_str())
        .bind(to_i32(state.consecutive_errors))
        .bind(state.last_error.as_deref())
        .bind(state.updated_at)
        .bind(&state.metadata)
        .bind(expected_cursor.map(Cursor::as_str))
        .bind(to_i64(state.revision))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_backfill", e))?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        match self.get(&state.resource_id).await? {
            None => Err(StoreError::NotFound(format!("backfill {}", state.resource_id))),
            Some(_) => Err(stale_writer(&state.resource_id)),
        }
    }

    async fn list(
        &self,
        status: Option<BackfillStatus>,
        limit: usize,
    ) -> Result<Vec<BackfillState>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {BACKFILL_COLUMNS} FROM backfill_states \
             WHERE ($1::TEXT IS NULL OR status = $1) \
             ORDER BY updated_at ASC, resource_id ASC \
             LIMIT $2"
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_backfills", e))?;
        rows.iter().map(backfill_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn state(resource: &str) -> BackfillState {
        BackfillState::new(ResourceId::new(resource).unwrap(), "o/n", 100, 25, Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn create_if_absent_keeps_existing_row() {
        let store = InMemoryBackfillStore::new();
        let mut first = state("r");
        first.processed_items = 50;
        store.create_if_absent(&first).await.unwrap();

        let stored = store.create_if_absent(&state("r")).await.unwrap();
        assert_eq!(stored.processed_items, 50);
    }

    #[tokio::test]
    async fn save_rejects_stale_cursor() {
        let store = InMemoryBackfillStore::new();
        let initial = store.create_if_absent(&state("r")).await.unwrap();

        let mut advanced = initial.clone();
        advanced
            .apply_chunk_success(25, Some(Cursor::new("2")), Utc::now())
            .unwrap();
        store.save(&advanced, None).await.unwrap();

        // A second writer that also started from the initial cursor loses.
        let mut stale = initial.clone();
        stale
            .apply_chunk_success(25, Some(Cursor::new("2")), Utc::now())
            .unwrap();
        assert!(matches!(
            store.save(&stale, None).await,
            Err(StoreError::Conflict(_))
        ));

        let stored = store.get(&initial.resource_id).await.unwrap().unwrap();
        assert_eq!(stored.processed_items, 25);
        assert_eq!(stored.last_cursor, Some(Cursor::new("2")));
        assert_eq!(stored.revision, 1);
    }

    #[tokio::test]
    async fn failure_write_cannot_clobber_a_concurrent_total_raise() {
        let store = InMemoryBackfillStore::new();
        let initial = store.create_if_absent(&state("r")).await.unwrap();

        let mut raised = initial.clone();
        raised.total_items = 500;
        store.save(&raised, None).await.unwrap();

        // Same cursor, but read before the raise.
        let mut failing = initial.clone();
        failing.apply_chunk_failure("boom", 3, Utc::now()).unwrap();
        assert!(matches!(
            store.save(&failing, None).await,
            Err(StoreError::Conflict(_))
        ));

        let stored = store.get(&initial.resource_id).await.unwrap().unwrap();
        assert_eq!(stored.total_items, 500);
        assert_eq!(stored.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn save_unknown_is_not_found() {
        let store = InMemoryBackfillStore::new();
        assert!(matches!(
            store.save(&state("ghost"), None).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_filters_and_orders_by_update_time() {
        let store = InMemoryBackfillStore::new();
        let t0 = Utc::now();
        let mut a = state("a");
        a.updated_at = t0 + chrono::Duration::seconds(10);
        let mut b = state("b");
        b.updated_at = t0;
        let mut c = state("c");
        c.status = BackfillStatus::Paused;
        for s in [&a, &b, &c] {
            store.create_if_absent(s).await.unwrap();
        }

        let active = store.list(Some(BackfillStatus::Active), 10).await.unwrap();
        let ids: Vec<_> = active.iter().map(|s| s.resource_id.as_str()).collect();
        assert_eq!(ids, ["b", "a"]);
        assert_eq!(store.list(None, 2).await.unwrap().len(), 2);
    }
}
