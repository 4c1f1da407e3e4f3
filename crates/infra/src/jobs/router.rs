//! Job router: classifies capture requests and hands them to a substrate.
//!
//! ## Policy (in tie-break order)
//!
//! 1. Estimated items above `size_threshold` → batch. Never downgraded.
//! 2. Time range above `recency_threshold_days` → batch, unless the request
//!    is escalated (priority `high`/`critical` or a manual trigger).
//! 3. Everything else → immediate.
//!
//! Batch work large enough to outlive a single run (estimate at or above
//! `backfill_threshold`) becomes a progressive backfill.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use hybridcap_core::{Clock, DomainError, JobId, ResourceId};

use super::JobDispatch;
use super::store::JobStore;
use super::types::{CapturePayload, CaptureRequest, Job, JobType, Priority, Processor, TriggerSource};
use crate::backfill::BackfillMachine;
use crate::error::CaptureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub size_threshold: u64,
    pub recency_threshold_days: u32,
    /// Used to estimate item counts when the request carries no hint.
    pub items_per_day_estimate: u64,
    pub backfill_threshold: u64,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            size_threshold: 1_000,
            recency_threshold_days: 1,
            items_per_day_estimate: 100,
            backfill_threshold: 5_000,
        }
    }
}

/// A request that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequest {
    pub resource_id: ResourceId,
    pub resource_name: String,
    pub time_range_days: u32,
    pub estimated_item_count: Option<u64>,
    pub priority: Priority,
    pub trigger_source: TriggerSource,
}

impl ValidatedRequest {
    pub fn parse(request: CaptureRequest) -> Result<Self, DomainError> {
        let resource_id = ResourceId::new(request.resource_id)?;
        let resource_name = request.resource_name.trim().to_string();
        if resource_name.is_empty() {
            return Err(DomainError::validation("resource name must not be blank"));
        }
        if request.time_range_days <= 0 {
            return Err(DomainError::validation(format!(
                "time range must be positive, got {} day(s)",
                request.time_range_days
            )));
        }
        let time_range_days = u32::try_from(request.time_range_days).map_err(|_| {
            DomainError::validation(format!(
                "time range of {} days is out of range",
                request.time_range_days
            ))
        })?;

        Ok(Self {
            resource_id,
            resource_name,
            time_range_days,
            estimated_item_count: request.estimated_item_count,
            priority: request.priority,
            trigger_source: request.trigger_source,
        })
    }

    fn is_escalated(&self) -> bool {
        self.priority >= Priority::High || self.trigger_source == TriggerSource::Manual
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub processor: Processor,
    pub job_type: JobType,
    pub estimated_items: u64,
}

impl RoutingPolicy {
    pub fn estimate(&self, request: &ValidatedRequest) -> u64 {
        request.estimated_item_count.unwrap_or_else(|| {
            u64::from(request.time_range_days).saturating_mul(self.items_per_day_estimate)
        })
    }

    pub fn classify(&self, request: &ValidatedRequest) -> Classification {
        let estimated_items = self.estimate(request);

        let processor = if estimated_items > self.size_threshold {
            Processor::Batch
        } else if request.time_range_days > self.recency_threshold_days && !request.is_escalated() {
            Processor::Batch
        } else {
            Processor::Immediate
        };

        let job_type = match processor {
            Processor::Immediate => JobType::RecentCapture,
            Processor::Batch if estimated_items >= self.backfill_threshold => JobType::BackfillChunk,
            Processor::Batch => JobType::HistoricalCapture,
        };

        Classification {
            processor,
            job_type,
            estimated_items,
        }
    }
}

/// Result of routing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouteOutcome {
    pub job_id: JobId,
    pub assigned_processor: Processor,
    pub job_type: JobType,
}

#[derive(Debug)]
pub struct JobRouter {
    policy: RoutingPolicy,
    jobs: Arc<dyn JobStore>,
    machine: Arc<BackfillMachine>,
    immediate: Arc<dyn JobDispatch>,
    batch: Arc<dyn JobDispatch>,
    clock: Arc<dyn Clock>,
}

impl JobRouter {
    pub fn new(
        policy: RoutingPolicy,
        jobs: Arc<dyn JobStore>,
        machine: Arc<BackfillMachine>,
        immediate: Arc<dyn JobDispatch>,
        batch: Arc<dyn JobDispatch>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy,
            jobs,
            machine,
            immediate,
            batch,
            clock,
        }
    }

    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    fn dispatcher(&self, processor: Processor) -> &Arc<dyn JobDispatch> {
        match processor {
            Processor::Immediate => &self.immediate,
            Processor::Batch => &self.batch,
        }
    }

    /// Classify, persist and hand off one request.
    ///
    /// The job is persisted as `queued` before the hand-off; the router never
    /// performs the capture itself.
    pub async fn route(&self, request: CaptureRequest) -> Result<RouteOutcome, CaptureError> {
        let request = ValidatedRequest::parse(request)?;
        let class = self.policy.classify(&request);

        if class.job_type == JobType::BackfillChunk {
            self.machine
                .start(&request.resource_id, &request.resource_name, class.estimated_items)
                .await?;
        }

        let payload = CapturePayload {
            resource_name: request.resource_name.clone(),
            time_range_days: request.time_range_days,
            estimated_items: class.estimated_items,
            priority: request.priority,
            trigger_source: request.trigger_source,
        };
        let job = Job::new(
            class.job_type,
            request.resource_id.clone(),
            &payload,
            class.processor,
            self.clock.now(),
        )?;
        self.jobs.insert(&job).await?;

        info!(
            job_id = %job.id,
            resource_id = %job.resource_id,
            processor = %class.processor,
            job_type = %class.job_type,
            estimated_items = class.estimated_items,
            "job routed"
        );

        if let Err(err) = self.dispatcher(class.processor).dispatch(&job).await {
            warn!(job_id = %job.id, error = %err, "hand-off failed");
            let mut failed = job.clone();
            if failed.fail(err.to_string(), self.clock.now()).is_ok() {
                self.jobs.update(&failed).await?;
            }
            return Err(err);
        }

        Ok(RouteOutcome {
            job_id: job.id,
            assigned_processor: class.processor,
            job_type: class.job_type,
        })
    }
}
