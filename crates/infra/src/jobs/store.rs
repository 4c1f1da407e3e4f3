//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use hybridcap_core::{JobId, ResourceId};

use super::types::{Job, JobFilter, JobStats, JobStatus, Processor};
use crate::error::StoreError;
use crate::postgres::map_sqlx_error;

/// Job store abstraction. Every mutation is a single-row write keyed by id.
#[async_trait]
pub trait JobStore: Send + Sync + std::fmt::Debug {
    /// Persist a new job. Fails with `Conflict` if the id exists.
    async fn insert(&self, job: &Job) -> Result<(), StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Atomically move a queued job to processing.
    ///
    /// Returns `None` if the job is gone or no longer queued.
    async fn claim(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<Job>, StoreError>;

    /// Claim the oldest queued job assigned to `processor`.
    async fn claim_next(
        &self,
        processor: Processor,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// Overwrite an existing job.
    async fn update(&self, job: &Job) -> Result<(), StoreError>;

    /// Delete a job that no substrate has claimed yet.
    async fn delete_queued(&self, id: JobId) -> Result<(), StoreError>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    async fn stats(&self) -> Result<JobStats, StoreError>;

    /// Queued or processing jobs for a resource, oldest first.
    async fn list_open_for_resource(
        &self,
        resource_id: &ResourceId,
    ) -> Result<Vec<Job>, StoreError>;
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, StoreError> {
        self.jobs
            .read()
            .map_err(|_| StoreError::Storage("job store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, StoreError> {
        self.jobs
            .write()
            .map_err(|_| StoreError::Storage("job store lock poisoned".into()))
    }
}

fn claim_in_place(job: &mut Job, now: DateTime<Utc>) -> Option<Job> {
    job.start(now).ok()?;
    Some(job.clone())
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job {} already exists", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn claim(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.write()?;
        Ok(jobs.get_mut(&id).and_then(|job| claim_in_place(job, now)))
    }

    async fn claim_next(
        &self,
        processor: Processor,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.write()?;

        // FIFO by creation time; ids are time-ordered and break ties.
        let next = jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued && j.processor == processor)
            .min_by_key(|j| (j.created_at, *j.id.as_uuid()))
            .map(|j| j.id);

        Ok(next.and_then(|id| jobs.get_mut(&id).and_then(|job| claim_in_place(job, now))))
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.write()?;
        match jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("job {}", job.id))),
        }
    }

    async fn delete_queued(&self, id: JobId) -> Result<(), StoreError> {
        let mut jobs = self.write()?;
        match jobs.get(&id).map(|j| j.status) {
            None => Err(StoreError::NotFound(format!("job {id}"))),
            Some(JobStatus::Queued) => {
                jobs.remove(&id);
                Ok(())
            }
            Some(status) => Err(StoreError::Conflict(format!(
                "job {id} is {status}; only queued jobs can be deleted"
            ))),
        }
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        result.sort_by_key(|j| (j.created_at, *j.id.as_uuid()));
        result.truncate(filter.limit);
        Ok(result)
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.record(job.status);
        }
        Ok(stats)
    }

    async fn list_open_for_resource(
        &self,
        resource_id: &ResourceId,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| &j.resource_id == resource_id && !j.status.is_terminal())
            .cloned()
            .collect();
        result.sort_by_key(|j| (j.created_at, *j.id.as_uuid()));
        Ok(result)
    }
}

/// Postgres-backed job store (`capture_jobs`).
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

const JOB_COLUMNS: &str = "id, job_type, resource_id, payload, processor, status, \
     created_at, started_at, completed_at, error, metadata";

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let decode = |e| map_sqlx_error("decode_job", e);
    let parse = |what: &str, e: hybridcap_core::DomainError| {
        StoreError::Storage(format!("invalid {what} in capture_jobs: {e}"))
    };

    let id: uuid::Uuid = row.try_get("id").map_err(decode)?;
    let job_type: String = row.try_get("job_type").map_err(decode)?;
    let resource_id: String = row.try_get("resource_id").map_err(decode)?;
    let processor: String = row.try_get("processor").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;

    Ok(Job {
        id: JobId::from_uuid(id),
        job_type: job_type.parse().map_err(|e| parse("job_type", e))?,
        resource_id: ResourceId::new(resource_id).map_err(|e| parse("resource_id", e))?,
        payload: row.try_get("payload").map_err(decode)?,
        processor: processor.parse().map_err(|e| parse("processor", e))?,
        status: status.parse().map_err(|e| parse("status", e))?,
        created_at: row.try_get("created_at").map_err(decode)?,
        started_at: row.try_get("started_at").map_err(decode)?,
        completed_at: row.try_get("completed_at").map_err(decode)?,
        error: row.try_get("error").map_err(decode)?,
        metadata: row.try_get("metadata").map_err(decode)?,
    })
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO capture_jobs (
                id, job_type, resource_id, payload, processor, status,
                created_at, started_at, completed_at, error, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.job_type.as_str())
        .bind(job.resource_id.as_str())
        .bind(&job.payload)
        .bind(job.processor.as_str())
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.error.as_deref())
        .bind(&job.metadata)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM capture_jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn claim(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE capture_jobs SET status = 'processing', started_at = $2 \
             WHERE id = $1 AND status = 'queued' RETURNING {JOB_COLUMNS}"
        ))
        .bind(id.as_uuid())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn claim_next(
        &self,
        processor: Processor,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        // SKIP LOCKED lets concurrent tick runners claim different rows.
        let row = sqlx::query(&format!(
            "UPDATE capture_jobs SET status = 'processing', started_at = $2 \
             WHERE id = ( \
                 SELECT id FROM capture_jobs \
                 WHERE status = 'queued' AND processor = $1 \
                 ORDER BY created_at ASC, id ASC \
                 LIMIT 1 FOR UPDATE SKIP LOCKED \
             ) AND status = 'queued' \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(processor.as_str())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE capture_jobs SET
                status = $2,
                started_at = $3,
                completed_at = $4,
                error = $5,
                metadata = $6
            WHERE id = $1
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.error.as_deref())
        .bind(&job.metadata)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job {}", job.id)));
        }
        Ok(())
    }

    async fn delete_queued(&self, id: JobId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM capture_jobs WHERE id = $1 AND status = 'queued'")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_job", e))?;
        if result.rows_affected() > 0 {
            return Ok(());
        }

        match self.get(id).await? {
            None => Err(StoreError::NotFound(format!("job {id}"))),
            Some(job) => Err(StoreError::Conflict(format!(
                "job {id} is {}; only queued jobs can be deleted",
                job.status
            ))),
        }
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM capture_jobs \
             WHERE ($1::TEXT IS NULL OR status = $1) \
               AND ($2::TEXT IS NULL OR processor = $2) \
             ORDER BY created_at ASC, id ASC \
             LIMIT $3"
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.processor.map(|p| p.as_str()))
        .bind(i64::try_from(filter.limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM capture_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("job_stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("job_stats", e))?;
            let n = usize::try_from(n).unwrap_or(0);
            match status.parse::<JobStatus>() {
                Ok(JobStatus::Queued) => stats.queued = n,
                Ok(JobStatus::Processing) => stats.processing = n,
                Ok(JobStatus::Completed) => stats.completed = n,
                Ok(JobStatus::Failed) => stats.failed = n,
                Err(_) => {}
            }
        }
        Ok(stats)
    }

    async fn list_open_for_resource(
        &self,
        resource_id: &ResourceId,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM capture_jobs \
             WHERE resource_id = $1 AND status IN ('queued', 'processing') \
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(resource_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_open_jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }
}
