//! Capture jobs: model, storage, routing, and the two execution substrates.
//!
//! ## Design
//!
//! - Every job is assigned exactly one [`Processor`] at creation
//! - The router persists the job as `queued`, then hands it off
//! - The immediate substrate runs a job as soon as it is handed over
//! - The batch substrate does its work when an external tick arrives
//! - Failures are recorded on the job row, never raised to the caller
//!
//! ## Components
//!
//! - `Job`: unit of capture work with payload and metadata
//! - `JobStore`: persistence for jobs (in-memory or Postgres)
//! - `JobRouter`: classification and hand-off
//! - `ImmediateSubstrate` / `BatchSubstrate`: the two [`JobDispatch`] handlers

pub mod batch;
pub mod capture;
pub mod immediate;
pub mod router;
pub mod store;
pub mod types;

use async_trait::async_trait;
use tracing::{info, warn};

use hybridcap_core::Clock;

use crate::error::CaptureError;

pub use batch::{BatchConfig, BatchSubstrate, ChunkReport, TickReport};
pub use capture::{CaptureService, WindowConfig, WindowReport, circuit_key};
pub use immediate::{HandoffMode, ImmediateConfig, ImmediateSubstrate};
pub use router::{Classification, JobRouter, RouteOutcome, RoutingPolicy, ValidatedRequest};
pub use store::{InMemoryJobStore, JobStore, PostgresJobStore};
pub use types::{
    CapturePayload, CaptureRequest, Job, JobFilter, JobStats, JobStatus, JobType, Priority,
    Processor, TriggerSource,
};

/// Hand-off entry point of an execution substrate.
#[async_trait]
pub trait JobDispatch: Send + Sync + std::fmt::Debug {
    fn processor(&self) -> Processor;

    /// Accept a freshly persisted, queued job.
    async fn dispatch(&self, job: &Job) -> Result<(), CaptureError>;
}

/// Run a claimed window-capture job and record the outcome on its row.
///
/// Capture failures end up in `job.error`; only a failed row update is returned.
pub(crate) async fn run_window_job(
    capture: &CaptureService,
    jobs: &dyn JobStore,
    clock: &dyn Clock,
    mut job: Job,
) -> Result<Job, CaptureError> {
    let outcome = match job.capture_payload() {
        Ok(payload) => {
            capture
                .capture_window(&job.resource_id, &payload.resource_name, payload.time_range_days)
                .await
        }
        Err(err) => Err(err.into()),
    };

    let now = clock.now();
    match outcome {
        Ok(report) => {
            job.set_metadata("pages", report.pages);
            job.set_metadata("items_captured", report.items_captured);
            job.set_metadata("reached_cutoff", report.reached_cutoff);
            job.complete(now)?;
            info!(
                job_id = %job.id,
                resource_id = %job.resource_id,
                processor = %job.processor,
                items = report.items_captured,
                "job completed"
            );
        }
        Err(err) => {
            if let CaptureError::Remote(remote) = &err {
                job.set_metadata("attempts", remote.attempts());
            }
            job.fail(err.to_string(), now)?;
            warn!(
                job_id = %job.id,
                resource_id = %job.resource_id,
                processor = %job.processor,
                error = %err,
                "job failed"
            );
        }
    }

    jobs.update(&job).await?;
    Ok(job)
}
