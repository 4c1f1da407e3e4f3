//! Immediate substrate: runs small, urgent jobs as soon as they are handed over.
//!
//! Concurrency is bounded twice: a per-resource lock keeps two jobs from
//! processing the same resource at the same time, and a global semaphore caps
//! concurrent jobs. The resource lock is taken first, so jobs queued behind a
//! busy resource hold no permit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use hybridcap_core::{Clock, JobId, ResourceId};

use super::capture::CaptureService;
use super::store::JobStore;
use super::types::{Job, JobType, Processor};
use super::{JobDispatch, run_window_job};
use crate::error::CaptureError;

/// How a hand-off is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandoffMode {
    /// Run on a spawned task; the router returns right away.
    #[default]
    Spawn,
    /// Run to completion inside the hand-off call.
    Inline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImmediateConfig {
    pub max_concurrent: usize,
    pub mode: HandoffMode,
}

impl Default for ImmediateConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            mode: HandoffMode::Spawn,
        }
    }
}

type ResourceLocks = Mutex<HashMap<ResourceId, Arc<tokio::sync::Mutex<()>>>>;

#[derive(Debug, Clone)]
pub struct ImmediateSubstrate {
    capture: Arc<CaptureService>,
    jobs: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    resource_locks: Arc<ResourceLocks>,
    mode: HandoffMode,
}

impl ImmediateSubstrate {
    pub fn new(
        capture: Arc<CaptureService>,
        jobs: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        config: ImmediateConfig,
    ) -> Self {
        Self {
            capture,
            jobs,
            clock,
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            resource_locks: Arc::new(Mutex::new(HashMap::new())),
            mode: config.mode,
        }
    }

    fn resource_lock(&self, resource_id: &ResourceId) -> Arc<tokio::sync::Mutex<()>> {
        self.resource_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(resource_id.clone())
            .or_default()
            .clone()
    }

    fn release_lock(&self, resource_id: &ResourceId) {
        let mut locks = self
            .resource_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(resource_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(resource_id);
        }
    }

    /// Run one job now.
    ///
    /// Returns `None` when the job was deleted or claimed elsewhere before
    /// this call got to it.
    pub async fn handle_job(&self, job_id: JobId) -> Result<Option<Job>, CaptureError> {
        let Some(queued) = self.jobs.get(job_id).await? else {
            debug!(job_id = %job_id, "job vanished before execution");
            return Ok(None);
        };
        let resource_id = queued.resource_id.clone();

        let lock = self.resource_lock(&resource_id);
        let result = {
            let _guard = lock.lock().await;
            match self.permits.acquire().await {
                Ok(_permit) => self.run_claimed(job_id).await,
                Err(_) => Err(CaptureError::Dispatch(
                    "immediate substrate is shut down".into(),
                )),
            }
        };
        drop(lock);
        self.release_lock(&resource_id);
        result
    }

    async fn run_claimed(&self, job_id: JobId) -> Result<Option<Job>, CaptureError> {
        let Some(mut job) = self.jobs.claim(job_id, self.clock.now()).await? else {
            debug!(job_id = %job_id, "job no longer queued, skipping");
            return Ok(None);
        };

        if job.job_type == JobType::BackfillChunk {
            job.fail("backfill chunks run on the batch substrate", self.clock.now())?;
            self.jobs.update(&job).await?;
            warn!(job_id = %job.id, "backfill job handed to immediate substrate");
            return Ok(Some(job));
        }

        run_window_job(&self.capture, self.jobs.as_ref(), self.clock.as_ref(), job)
            .await
            .map(Some)
    }
}

#[async_trait]
impl JobDispatch for ImmediateSubstrate {
    fn processor(&self) -> Processor {
        Processor::Immediate
    }

    async fn dispatch(&self, job: &Job) -> Result<(), CaptureError> {
        match self.mode {
            HandoffMode::Inline => {
                self.handle_job(job.id).await?;
            }
            HandoffMode::Spawn => {
                let substrate = self.clone();
                let job_id = job.id;
                tokio::spawn(async move {
                    if let Err(err) = substrate.handle_job(job_id).await {
                        error!(job_id = %job_id, error = %err, "immediate job errored");
                    }
                });
            }
        }
        Ok(())
    }
}
