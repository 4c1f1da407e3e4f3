//! Process wiring: stores, resilience, capture, backfill, router, substrates.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use hybridcap_core::{Clock, SystemClock};

use crate::backfill::{BackfillMachine, BackfillStore, InMemoryBackfillStore, PostgresBackfillStore};
use crate::config::OrchestratorConfig;
use crate::error::{CaptureError, StoreError};
use crate::jobs::{
    BatchSubstrate, CaptureService, ImmediateSubstrate, InMemoryJobStore, JobRouter, JobStore,
    PostgresJobStore, TickReport,
};
use crate::postgres;
use crate::remote::{HttpRemoteSource, RemoteSource};
use crate::resilience::{
    BreakerStateStore, CircuitBreakerRegistry, InMemoryBreakerStateStore,
    PostgresBreakerStateStore, RateLimitGovernor, ResilientExecutor, Sleeper, TokioSleeper,
};
use crate::sink::{InMemoryItemSink, ItemSink, PostgresItemSink};

/// The four persistence ports.
#[derive(Debug, Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub backfills: Arc<dyn BackfillStore>,
    pub breakers: Arc<dyn BreakerStateStore>,
    pub sink: Arc<dyn ItemSink>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            jobs: InMemoryJobStore::arc(),
            backfills: InMemoryBackfillStore::arc(),
            breakers: InMemoryBreakerStateStore::arc(),
            sink: InMemoryItemSink::arc(),
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self {
            jobs: Arc::new(PostgresJobStore::new(pool.clone())),
            backfills: Arc::new(PostgresBackfillStore::new(pool.clone())),
            breakers: Arc::new(PostgresBreakerStateStore::new(pool.clone())),
            sink: Arc::new(PostgresItemSink::new(pool)),
        }
    }
}

#[derive(Debug)]
pub struct Orchestrator {
    stores: Stores,
    breakers: Arc<CircuitBreakerRegistry>,
    governor: Arc<RateLimitGovernor>,
    capture: Arc<CaptureService>,
    machine: Arc<BackfillMachine>,
    router: JobRouter,
    immediate: Arc<ImmediateSubstrate>,
    batch: Arc<BatchSubstrate>,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    /// Wire every component around the given ports.
    ///
    /// `governor` must be the one the remote adapter reports quota headers to.
    pub fn new(
        config: &OrchestratorConfig,
        stores: Stores,
        remote: Arc<dyn RemoteSource>,
        governor: Arc<RateLimitGovernor>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker, clock.clone()));
        let executor = Arc::new(ResilientExecutor::new(
            breakers.clone(),
            governor.clone(),
            sleeper,
        ));
        let capture = Arc::new(CaptureService::new(
            remote,
            stores.sink.clone(),
            executor,
            config.retry,
            config.window,
            clock.clone(),
        ));
        let machine = Arc::new(BackfillMachine::new(
            stores.backfills.clone(),
            capture.clone(),
            config.backfill,
            clock.clone(),
        ));
        let immediate = Arc::new(ImmediateSubstrate::new(
            capture.clone(),
            stores.jobs.clone(),
            clock.clone(),
            config.immediate,
        ));
        let batch = Arc::new(BatchSubstrate::new(
            capture.clone(),
            machine.clone(),
            stores.jobs.clone(),
            clock.clone(),
            config.batch,
        ));
        let router = JobRouter::new(
            config.routing,
            stores.jobs.clone(),
            machine.clone(),
            immediate.clone(),
            batch.clone(),
            clock.clone(),
        );

        Self {
            stores,
            breakers,
            governor,
            capture,
            machine,
            router,
            immediate,
            batch,
            clock,
        }
    }

    /// Production wiring: Postgres when `database_url` is set (schema applied
    /// on connect), in-memory stores otherwise; HTTP remote; breaker state
    /// restored from the store.
    pub async fn from_config(config: &OrchestratorConfig) -> Result<Self, CaptureError> {
        let stores = match &config.database_url {
            Some(url) => {
                let pool = postgres::connect(url).await?;
                postgres::ensure_schema(&pool).await?;
                info!("using postgres stores");
                Stores::postgres(pool)
            }
            None => {
                warn!("DATABASE_URL not set, using in-memory stores");
                Stores::in_memory()
            }
        };

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let governor = Arc::new(RateLimitGovernor::with_max_reset_wait(
            clock.clone(),
            config.max_rate_limit_wait,
        ));
        let remote = HttpRemoteSource::new(config.remote.clone(), governor.clone())
            .map_err(|e| CaptureError::Dispatch(e.to_string()))?;

        let orchestrator = Self::new(
            config,
            stores,
            Arc::new(remote),
            governor,
            clock,
            Arc::new(TokioSleeper),
        );
        orchestrator.restore_breakers().await?;
        Ok(orchestrator)
    }

    pub fn router(&self) -> &JobRouter {
        &self.router
    }

    pub fn immediate(&self) -> &Arc<ImmediateSubstrate> {
        &self.immediate
    }

    pub fn batch(&self) -> &Arc<BatchSubstrate> {
        &self.batch
    }

    pub fn capture(&self) -> &Arc<CaptureService> {
        &self.capture
    }

    pub fn machine(&self) -> &Arc<BackfillMachine> {
        &self.machine
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.stores.jobs
    }

    pub fn backfills(&self) -> &Arc<dyn BackfillStore> {
        &self.stores.backfills
    }

    pub fn sink(&self) -> &Arc<dyn ItemSink> {
        &self.stores.sink
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn governor(&self) -> &Arc<RateLimitGovernor> {
        &self.governor
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// One batch tick, followed by a breaker snapshot.
    pub async fn tick(&self) -> Result<TickReport, CaptureError> {
        let report = self.batch.tick().await?;
        if !report.skipped {
            self.persist_breakers().await?;
        }
        Ok(report)
    }

    pub async fn persist_breakers(&self) -> Result<(), StoreError> {
        self.stores.breakers.save_all(&self.breakers.snapshot()).await
    }

    /// Load persisted breaker state into the registry; returns the number of keys.
    pub async fn restore_breakers(&self) -> Result<usize, StoreError> {
        let states = self.stores.breakers.load_all().await?;
        let count = states.len();
        self.breakers.restore(states);
        if count > 0 {
            info!(breakers = count, "breaker state restored");
        }
        Ok(count)
    }

    /// Tick on a fixed cadence until the task is aborted.
    pub fn spawn_ticker(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let Err(err) = self.tick().await {
                    warn!(error = %err, "scheduled batch tick failed");
                }
            }
        })
    }
}
