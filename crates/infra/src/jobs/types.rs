//! Core job types.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use hybridcap_core::{DomainError, DomainResult, JobId, ResourceId};

/// Execution substrate a job is assigned to. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Processor {
    /// Low-latency, invoked on hand-off.
    Immediate,
    /// Scheduled, advanced by external ticks.
    Batch,
}

impl Processor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Processor::Immediate => "immediate",
            Processor::Batch => "batch",
        }
    }
}

impl std::fmt::Display for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Processor {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(Processor::Immediate),
            "batch" => Ok(Processor::Batch),
            other => Err(DomainError::validation(format!("unknown processor '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Small window of recent items.
    RecentCapture,
    /// Longer window read page by page in one batch run.
    HistoricalCapture,
    /// Drives a progressive backfill; settled when the backfill ends.
    BackfillChunk,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::RecentCapture => "recent_capture",
            JobType::HistoricalCapture => "historical_capture",
            JobType::BackfillChunk => "backfill_chunk",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recent_capture" => Ok(JobType::RecentCapture),
            "historical_capture" => Ok(JobType::HistoricalCapture),
            "backfill_chunk" => Ok(JobType::BackfillChunk),
            other => Err(DomainError::validation(format!("unknown job type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// Initiated by a user.
    Manual,
    Scheduled,
    Webhook,
    #[default]
    Automatic,
}

/// Inbound routing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub resource_id: String,
    /// `owner/name` of the upstream repository.
    pub resource_name: String,
    pub time_range_days: i64,
    #[serde(default)]
    pub estimated_item_count: Option<u64>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub trigger_source: TriggerSource,
}

/// What a job needs to run, stored in its `payload` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturePayload {
    pub resource_name: String,
    pub time_range_days: u32,
    pub estimated_items: u64,
    pub priority: Priority,
    pub trigger_source: TriggerSource,
}

/// A unit of capture work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub resource_id: ResourceId,
    pub payload: Value,
    pub processor: Processor,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub metadata: Value,
}

impl Job {
    pub fn new(
        job_type: JobType,
        resource_id: ResourceId,
        payload: &CapturePayload,
        processor: Processor,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| DomainError::validation(format!("unencodable job payload: {e}")))?;
        Ok(Self {
            id: JobId::new(),
            job_type,
            resource_id,
            payload,
            processor,
            status: JobStatus::Queued,
            created_at: now,
            started_at: None,
            completed_at: None,
            error: None,
            metadata: Value::Object(Map::new()),
        })
    }

    pub fn capture_payload(&self) -> DomainResult<CapturePayload> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            DomainError::invariant(format!("job {} has an invalid payload: {e}", self.id))
        })
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != JobStatus::Queued {
            return Err(DomainError::invariant(format!(
                "job {} cannot start from {}",
                self.id, self.status
            )));
        }
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != JobStatus::Processing {
            return Err(DomainError::invariant(format!(
                "job {} cannot complete from {}",
                self.id, self.status
            )));
        }
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Mark failed, keeping `error` verbatim.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::invariant(format!(
                "job {} is already {}",
                self.id, self.status
            )));
        }
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn set_metadata(&mut self, key: &str, value: impl Into<Value>) {
        if !self.metadata.is_object() {
            self.metadata = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.metadata {
            map.insert(key.to_string(), value.into());
        }
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }
}

/// Listing filter; results are ordered oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub processor: Option<Processor>,
    pub limit: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            processor: None,
            limit: 100,
        }
    }
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.processor.is_none_or(|p| job.processor == p)
    }
}
