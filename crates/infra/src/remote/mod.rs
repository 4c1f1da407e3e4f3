//! Remote data API boundary.
//!
//! The orchestrator only needs pages of items plus an opaque cursor to the
//! next page. Status codes and rate-limit headers are interpreted by the
//! adapter and surface as [`RemoteError`] kinds and governor updates.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use hybridcap_core::ResourceId;

use crate::resilience::RemoteError;

pub use http::{HttpRemoteConfig, HttpRemoteSource};

/// Opaque pointer into a paginated remote dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One page read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub resource_id: ResourceId,
    /// Upstream name, `owner/name` for a repository.
    pub resource_name: String,
    /// `None` reads the first page.
    pub cursor: Option<Cursor>,
    pub per_page: u32,
}

/// An item keyed by its stable upstream identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub kind: Option<String>,
    pub payload: Value,
}

impl RemoteItem {
    /// Build an item from a raw JSON object. `id` may be a string or a number.
    pub fn from_json(value: Value) -> Result<Self, RemoteError> {
        let id = match value.get("id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(RemoteError::Decode("item without a usable id".into())),
        };
        let created_at = value
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc));
        let kind = value.get("type").and_then(Value::as_str).map(str::to_string);

        Ok(Self {
            id,
            created_at,
            kind,
            payload: value,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Page {
    pub items: Vec<RemoteItem>,
    /// `None` when this is the last page.
    pub next_cursor: Option<Cursor>,
}

#[async_trait]
pub trait RemoteSource: Send + Sync + std::fmt::Debug {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, RemoteError>;
}
