use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use hybridcap_core::{JobId, ResourceId};
use hybridcap_infra::backfill::{BackfillState, BackfillStatus};
use hybridcap_infra::jobs::{JobFilter, JobStatus, Processor};
use hybridcap_infra::resilience::RateLimitInfo;

use crate::app::errors;

/// Largest `limit` a list endpoint accepts.
pub const MAX_LIST_LIMIT: usize = 1_000;

// -------------------------
// Query DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
pub struct JobListQuery {
    pub status: Option<String>,
    pub processor: Option<String>,
    pub limit: Option<usize>,
}

impl JobListQuery {
    pub fn into_filter(self) -> Result<JobFilter, axum::response::Response> {
        let mut filter = JobFilter::default();
        if let Some(status) = self.status.as_deref() {
            filter.status = Some(status.parse::<JobStatus>().map_err(bad_query)?);
        }
        if let Some(processor) = self.processor.as_deref() {
            filter.processor = Some(processor.parse::<Processor>().map_err(bad_query)?);
        }
        if let Some(limit) = self.limit {
            filter.limit = limit.clamp(1, MAX_LIST_LIMIT);
        }
        Ok(filter)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct BackfillListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

impl BackfillListQuery {
    pub fn status(&self) -> Result<Option<BackfillStatus>, axum::response::Response> {
        self.status
            .as_deref()
            .map(|s| s.parse::<BackfillStatus>().map_err(bad_query))
            .transpose()
    }

    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(100).clamp(1, MAX_LIST_LIMIT)
    }
}

fn bad_query(err: impl std::fmt::Display) -> axum::response::Response {
    errors::json_error(StatusCode::BAD_REQUEST, "invalid_query", err.to_string())
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct BackfillView {
    #[serde(flatten)]
    pub state: BackfillState,
    pub remaining_items: u64,
    pub progress_percent: f64,
}

impl From<BackfillState> for BackfillView {
    fn from(state: BackfillState) -> Self {
        Self {
            remaining_items: state.remaining(),
            progress_percent: state.progress_percent(),
            state,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RateLimitView {
    /// `None` until the first remote response was seen.
    pub rate_limit: Option<RateLimitInfo>,
    pub wait_before_next_call_ms: u64,
}

// -------------------------
// Path parsing
// -------------------------

pub fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse::<JobId>().map_err(errors::domain_error_to_response)
}

pub fn parse_resource_id(raw: &str) -> Result<ResourceId, axum::response::Response> {
    ResourceId::new(raw).map_err(errors::domain_error_to_response)
}
