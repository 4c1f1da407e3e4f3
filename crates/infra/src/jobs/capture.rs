//! Capture operations shared by the substrates and the backfill machine.
//!
//! Every remote read goes through the [`ResilientExecutor`] with a breaker
//! keyed by resource, so all jobs against one repository share a breaker.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use hybridcap_core::{Clock, ResourceId};

use crate::error::{CaptureError, StoreError};
use crate::remote::{Cursor, Page, PageRequest, RemoteItem, RemoteSource};
use crate::resilience::{ResilienceError, ResilientExecutor, RetryConfig};
use crate::sink::ItemSink;

/// Operation component of breaker keys for page reads.
pub const FETCH_PAGE_OPERATION: &str = "fetch_page";

/// Breaker key for remote reads against `resource_id`.
pub fn circuit_key(resource_id: &ResourceId) -> String {
    format!("{resource_id}:{FETCH_PAGE_OPERATION}")
}

/// Paging limits for window captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    pub page_size: u32,
    pub max_pages: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: 10,
        }
    }
}

/// Result of a window capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct WindowReport {
    pub pages: u32,
    pub items_captured: u64,
    /// An item older than the window was seen.
    pub reached_cutoff: bool,
}

#[derive(Debug)]
pub struct CaptureService {
    remote: Arc<dyn RemoteSource>,
    sink: Arc<dyn ItemSink>,
    executor: Arc<ResilientExecutor>,
    retry: RetryConfig,
    window: WindowConfig,
    clock: Arc<dyn Clock>,
}

impl CaptureService {
    pub fn new(
        remote: Arc<dyn RemoteSource>,
        sink: Arc<dyn ItemSink>,
        executor: Arc<ResilientExecutor>,
        retry: RetryConfig,
        window: WindowConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            remote,
            sink,
            executor,
            retry,
            window,
            clock,
        }
    }

    pub fn executor(&self) -> &Arc<ResilientExecutor> {
        &self.executor
    }

    /// One resilient page read.
    pub async fn fetch_page(&self, request: &PageRequest) -> Result<Page, ResilienceError> {
        let key = circuit_key(&request.resource_id);
        let remote = &self.remote;
        self.executor
            .execute_with_backoff(&self.retry, Some(&key), || remote.fetch_page(request))
            .await
    }

    pub async fn store_items(
        &self,
        resource_id: &ResourceId,
        items: &[RemoteItem],
    ) -> Result<u64, StoreError> {
        if items.is_empty() {
            return Ok(0);
        }
        self.sink.upsert_items(resource_id, items).await
    }

    /// One chunk of a progressive backfill: a single page of `chunk_size`
    /// items starting at `cursor`. Items are not stored here.
    pub async fn fetch_chunk(
        &self,
        resource_id: &ResourceId,
        resource_name: &str,
        cursor: Option<&Cursor>,
        chunk_size: u32,
    ) -> Result<Page, ResilienceError> {
        let request = PageRequest {
            resource_id: resource_id.clone(),
            resource_name: resource_name.to_string(),
            cursor: cursor.cloned(),
            per_page: chunk_size,
        };
        self.fetch_page(&request).await
    }

    /// Capture items created within the last `days` days, newest first.
    ///
    /// Stops at the first item older than the window, at the last page, or
    /// after `max_pages` pages.
    pub async fn capture_window(
        &self,
        resource_id: &ResourceId,
        resource_name: &str,
        days: u32,
    ) -> Result<WindowReport, CaptureError> {
        let cutoff = self.clock.now() - chrono::Duration::days(i64::from(days));
        let mut request = PageRequest {
            resource_id: resource_id.clone(),
            resource_name: resource_name.to_string(),
            cursor: None,
            per_page: self.window.page_size,
        };
        let mut report = WindowReport::default();

        while report.pages < self.window.max_pages {
            let page = self.fetch_page(&request).await?;
            report.pages += 1;

            let (kept, reached_cutoff) = within_window(page.items, cutoff);
            report.items_captured += self.store_items(resource_id, &kept).await?;

            if reached_cutoff {
                report.reached_cutoff = true;
                debug!(resource_id = %resource_id, page = report.pages, "reached window cutoff");
                break;
            }
            match page.next_cursor {
                Some(next) => request.cursor = Some(next),
                None => break,
            }
        }

        info!(
            resource_id = %resource_id,
            pages = report.pages,
            items = report.items_captured,
            "window capture finished"
        );
        Ok(report)
    }
}

/// Items up to the first one older than `cutoff` (items are newest first).
/// Items without a timestamp are kept.
fn within_window(items: Vec<RemoteItem>, cutoff: DateTime<Utc>) -> (Vec<RemoteItem>, bool) {
    let mut kept = Vec::with_capacity(items.len());
    for item in items {
        match item.created_at {
            Some(at) if at < cutoff => return (kept, true),
            _ => kept.push(item),
        }
    }
    (kept, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(id: &str, at: DateTime<Utc>) -> RemoteItem {
        RemoteItem::from_json(json!({"id": id, "created_at": at.to_rfc3339()})).unwrap()
    }

    #[test]
    fn window_stops_at_first_older_item() {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::days(1);
        let items = vec![
            item("3", now),
            item("2", now - chrono::Duration::hours(23)),
            item("1", now - chrono::Duration::hours(25)),
            item("0", now),
        ];

        let (kept, reached) = within_window(items, cutoff);
        assert!(reached);
        assert_eq!(kept.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(), ["3", "2"]);
    }

    #[test]
    fn circuit_key_is_resource_scoped() {
        let id = ResourceId::new("repo-42").unwrap();
        assert_eq!(circuit_key(&id), "repo-42:fetch_page");
    }
}
