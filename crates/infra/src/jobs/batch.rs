//! Batch substrate: work advances only when an external tick arrives.
//!
//! A tick drains queued batch jobs and then advances active backfills by one
//! chunk each, least recently updated first. Ticks may arrive late, early, or
//! not at all; all progress lives in the stores, so any tick resumes where
//! the last one stopped. Overlapping ticks are skipped.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use hybridcap_core::{Clock, ResourceId};

use super::capture::CaptureService;
use super::store::JobStore;
use super::types::{Job, JobStatus, JobType, Processor};
use super::{JobDispatch, run_window_job};
use crate::backfill::{BackfillMachine, BackfillState, BackfillStatus, ChunkOutcome};
use crate::error::CaptureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_jobs_per_tick: usize,
    pub max_backfills_per_tick: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_jobs_per_tick: 10,
            max_backfills_per_tick: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkReport {
    pub resource_id: ResourceId,
    #[serde(flatten)]
    pub outcome: ChunkOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Another tick was still running.
    pub skipped: bool,
    pub jobs_completed: usize,
    pub jobs_failed: usize,
    /// Backfill jobs claimed this tick (they stay processing).
    pub backfill_jobs_claimed: usize,
    /// Backfill jobs settled because their backfill ended.
    pub backfill_jobs_settled: usize,
    pub chunks: Vec<ChunkReport>,
    pub errors: Vec<String>,
}

#[derive(Debug)]
pub struct BatchSubstrate {
    capture: Arc<CaptureService>,
    machine: Arc<BackfillMachine>,
    jobs: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    config: BatchConfig,
    running: tokio::sync::Mutex<()>,
}

impl BatchSubstrate {
    pub fn new(
        capture: Arc<CaptureService>,
        machine: Arc<BackfillMachine>,
        jobs: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        config: BatchConfig,
    ) -> Self {
        Self {
            capture,
            machine,
            jobs,
            clock,
            config,
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// The scheduled entry point.
    pub async fn tick(&self) -> Result<TickReport, CaptureError> {
        let Ok(_running) = self.running.try_lock() else {
            debug!("batch tick already running, skipping");
            return Ok(TickReport {
                skipped: true,
                ..TickReport::default()
            });
        };

        let mut report = TickReport::default();
        self.drain_jobs(&mut report).await?;
        self.advance_backfills(&mut report).await?;

        info!(
            jobs_completed = report.jobs_completed,
            jobs_failed = report.jobs_failed,
            backfill_jobs_claimed = report.backfill_jobs_claimed,
            chunks = report.chunks.len(),
            errors = report.errors.len(),
            "batch tick finished"
        );
        Ok(report)
    }

    async fn drain_jobs(&self, report: &mut TickReport) -> Result<(), CaptureError> {
        for _ in 0..self.config.max_jobs_per_tick {
            let Some(job) = self
                .jobs
                .claim_next(Processor::Batch, self.clock.now())
                .await?
            else {
                break;
            };

            if job.job_type == JobType::BackfillChunk {
                report.backfill_jobs_claimed += 1;
                if let Err(err) = self.attach_backfill(&job, report).await {
                    report.errors.push(format!("job {}: {err}", job.id));
                }
                continue;
            }

            let job = run_window_job(&self.capture, self.jobs.as_ref(), self.clock.as_ref(), job)
                .await?;
            match job.status {
                JobStatus::Completed => report.jobs_completed += 1,
                JobStatus::Failed => report.jobs_failed += 1,
                JobStatus::Queued | JobStatus::Processing => {}
            }
        }
        Ok(())
    }

    /// Make sure a claimed backfill job has a backfill to follow; settle it
    /// right away if that backfill already ended.
    async fn attach_backfill(&self, job: &Job, report: &mut TickReport) -> Result<(), CaptureError> {
        let state = match self.machine.store().get(&job.resource_id).await? {
            Some(state) => state,
            None => {
                let payload = job.capture_payload()?;
                self.machine
                    .start(&job.resource_id, &payload.resource_name, payload.estimated_items)
                    .await?
            }
        };
        if state.status.is_terminal() {
            report.backfill_jobs_settled += self.settle_backfill_jobs(&state).await?;
        }
        Ok(())
    }

    async fn advance_backfills(&self, report: &mut TickReport) -> Result<(), CaptureError> {
        let active = self
            .machine
            .store()
            .list(Some(BackfillStatus::Active), self.config.max_backfills_per_tick)
            .await?;

        for state in active {
            let resource_id = state.resource_id.clone();
            match self.machine.run_chunk(&resource_id).await {
                Ok(outcome) => {
                    if outcome.is_terminal() {
                        if let Some(done) = self.machine.store().get(&resource_id).await? {
                            report.backfill_jobs_settled += self.settle_backfill_jobs(&done).await?;
                        }
                    }
                    report.chunks.push(ChunkReport {
                        resource_id,
                        outcome,
                    });
                }
                Err(err) => {
                    warn!(resource_id = %resource_id, error = %err, "backfill chunk errored");
                    report.errors.push(format!("backfill {resource_id}: {err}"));
                }
            }
        }
        Ok(())
    }

    /// Complete or fail the processing backfill jobs of a finished backfill.
    async fn settle_backfill_jobs(&self, state: &BackfillState) -> Result<usize, CaptureError> {
        let now = self.clock.now();
        let mut settled = 0;
        for mut job in self.jobs.list_open_for_resource(&state.resource_id).await? {
            if job.job_type != JobType::BackfillChunk || job.status != JobStatus::Processing {
                continue;
            }
            job.set_metadata("processed_items", state.processed_items);
            match state.status {
                BackfillStatus::Completed => job.complete(now)?,
                BackfillStatus::Failed => job.fail(
                    state
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "backfill failed".to_string()),
                    now,
                )?,
                BackfillStatus::Active | BackfillStatus::Paused => continue,
            }
            self.jobs.update(&job).await?;
            settled += 1;
            info!(job_id = %job.id, resource_id = %job.resource_id, status = %job.status, "backfill job settled");
        }
        Ok(settled)
    }
}

#[async_trait]
impl JobDispatch for BatchSubstrate {
    fn processor(&self) -> Processor {
        Processor::Batch
    }

    async fn dispatch(&self, job: &Job) -> Result<(), CaptureError> {
        debug!(job_id = %job.id, job_type = %job.job_type, "job queued for the next batch tick");
        Ok(())
    }
}
