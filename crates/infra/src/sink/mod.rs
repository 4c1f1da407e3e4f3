//! Idempotent persistence of captured items.
//!
//! Writes are upserts keyed by `(resource_id, item id)`, so replaying a chunk
//! or a window never produces duplicate rows.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sqlx::PgPool;

use hybridcap_core::ResourceId;

use crate::error::StoreError;
use crate::postgres::{from_i64, map_sqlx_error};
use crate::remote::RemoteItem;

#[async_trait]
pub trait ItemSink: Send + Sync + std::fmt::Debug {
    /// Upsert `items` for `resource_id`; returns the number of items written.
    async fn upsert_items(
        &self,
        resource_id: &ResourceId,
        items: &[RemoteItem],
    ) -> Result<u64, StoreError>;

    /// Number of distinct items stored for `resource_id`.
    async fn count(&self, resource_id: &ResourceId) -> Result<u64, StoreError>;
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryItemSink {
    items: RwLock<BTreeMap<(ResourceId, String), RemoteItem>>,
}

impl InMemoryItemSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn items_for(&self, resource_id: &ResourceId) -> Vec<RemoteItem> {
        self.items
            .read()
            .map(|items| {
                items
                    .iter()
                    .filter(|((rid, _), _)| rid == resource_id)
                    .map(|(_, item)| item.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl ItemSink for InMemoryItemSink {
    async fn upsert_items(
        &self,
        resource_id: &ResourceId,
        items: &[RemoteItem],
    ) -> Result<u64, StoreError> {
        let mut stored = self
            .items
            .write()
            .map_err(|_| StoreError::Storage("item sink lock poisoned".into()))?;
        for item in items {
            stored.insert((resource_id.clone(), item.id.clone()), item.clone());
        }
        Ok(items.len() as u64)
    }

    async fn count(&self, resource_id: &ResourceId) -> Result<u64, StoreError> {
        let stored = self
            .items
            .read()
            .map_err(|_| StoreError::Storage("item sink lock poisoned".into()))?;
        Ok(stored.keys().filter(|(rid, _)| rid == resource_id).count() as u64)
    }
}

/// Postgres-backed sink (`captured_items`).
#[derive(Debug, Clone)]
pub struct PostgresItemSink {
    pool: Arc<PgPool>,
}

impl PostgresItemSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl ItemSink for PostgresItemSink {
    async fn upsert_items(
        &self,
        resource_id: &ResourceId,
        items: &[RemoteItem],
    ) -> Result<u64, StoreError> {
        let mut written = 0u64;
        for item in items {
            let result = sqlx::query(
                r#"
                INSERT INTO captured_items (resource_id, item_id, kind, created_at, payload, captured_at)
                VALUES ($1, $2, $3, $4, $5, NOW())
                ON CONFLICT (resource_id, item_id)
                DO UPDATE SET
                    kind = EXCLUDED.kind,
                    created_at = EXCLUDED.created_at,
                    payload = EXCLUDED.payload,
                    captured_at = NOW()
                "#,
            )
            .bind(resource_id.as_str())
            .bind(&item.id)
            .bind(item.kind.as_deref())
            .bind(item.created_at)
            .bind(&item.payload)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("upsert_items", e))?;
            written += result.rows_affected();
        }
        Ok(written)
    }

    async fn count(&self, resource_id: &ResourceId) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM captured_items WHERE resource_id = $1")
                .bind(resource_id.as_str())
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("count_items", e))?;
        Ok(from_i64(count))
    }
}
