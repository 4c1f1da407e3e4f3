//! Test support: a scripted in-memory remote and a fully wired harness.
//!
//! Compiled for this crate's tests and, through the `test-util` feature, for
//! downstream crates' tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tokio::sync::Semaphore;

use hybridcap_core::{Clock, ManualClock};

use crate::backfill::InMemoryBackfillStore;
use crate::config::OrchestratorConfig;
use crate::jobs::{HandoffMode, InMemoryJobStore};
use crate::orchestrator::{Orchestrator, Stores};
use crate::remote::{Cursor, Page, PageRequest, RemoteItem, RemoteSource};
use crate::resilience::{
    InMemoryBreakerStateStore, RateLimitGovernor, RecordingSleeper, RemoteError,
};
use crate::sink::InMemoryItemSink;

/// Fixed start time of every harness clock.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

#[derive(Debug, Default)]
struct Script {
    total: usize,
    newest: Option<DateTime<Utc>>,
    spacing: chrono::Duration,
    failures: VecDeque<RemoteError>,
    fail_always: Option<RemoteError>,
    requests: Vec<PageRequest>,
}

/// Paginated remote serving `total` items, newest first.
///
/// Item `i` has id `item-{i}` and was created `i * spacing` before the
/// newest item. Cursors are item offsets. Scripted failures are consumed in
/// order before any page is served. A gated remote records each request and
/// then holds it until [`ScriptedRemote::release`] lets it through.
#[derive(Debug)]
pub struct ScriptedRemote {
    script: Mutex<Script>,
    gate: Option<Semaphore>,
}

impl ScriptedRemote {
    pub fn with_items(total: usize) -> Self {
        Self {
            script: Mutex::new(Script {
                total,
                newest: Some(base_time()),
                spacing: chrono::Duration::minutes(1),
                ..Script::default()
            }),
            gate: None,
        }
    }

    pub fn arc(total: usize) -> Arc<Self> {
        Arc::new(Self::with_items(total))
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Space items `spacing` apart, newest first.
    pub fn spaced(self, spacing: chrono::Duration) -> Self {
        self.script().spacing = spacing;
        self
    }

    /// Hold every fetch until it is released.
    pub fn gated(self) -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..self
        }
    }

    /// Let `fetches` held fetches through.
    pub fn release(&self, fetches: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(fetches);
        }
    }

    /// Serve items without a `created_at`.
    pub fn without_timestamps(self) -> Self {
        self.script().newest = None;
        self
    }

    pub fn set_total(&self, total: usize) {
        self.script().total = total;
    }

    /// Fail the next call with `error`.
    pub fn fail_next(&self, error: RemoteError) {
        self.script().failures.push_back(error);
    }

    /// Fail the next `times` calls with `error`.
    pub fn fail_times(&self, times: usize, error: RemoteError) {
        let mut script = self.script();
        for _ in 0..times {
            script.failures.push_back(error.clone());
        }
    }

    /// Fail every call until [`ScriptedRemote::recover`].
    pub fn fail_always(&self, error: RemoteError) {
        self.script().fail_always = Some(error);
    }

    pub fn recover(&self) {
        let mut script = self.script();
        script.fail_always = None;
        script.failures.clear();
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.script().requests.clone()
    }

    pub fn call_count(&self) -> usize {
        self.script().requests.len()
    }

    fn item(script: &Script, index: usize) -> RemoteItem {
        let id = format!("item-{index}");
        let created_at = script
            .newest
            .map(|newest| newest - script.spacing * i32::try_from(index).unwrap_or(i32::MAX));
        let mut payload = json!({"id": id, "type": "PushEvent"});
        if let Some(at) = created_at {
            payload["created_at"] = json!(at.to_rfc3339());
        }
        RemoteItem {
            id,
            created_at,
            kind: Some("PushEvent".to_string()),
            payload,
        }
    }
}

#[async_trait]
impl RemoteSource for ScriptedRemote {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, RemoteError> {
        self.script().requests.push(request.clone());
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| RemoteError::Network("remote gate closed".into()))?
                .forget();
        }

        let mut script = self.script();

        if let Some(error) = script.fail_always.clone() {
            return Err(error);
        }
        if let Some(error) = script.failures.pop_front() {
            return Err(error);
        }

        let start = match &request.cursor {
            Some(cursor) => cursor
                .as_str()
                .parse::<usize>()
                .map_err(|e| RemoteError::Client {
                    status: 422,
                    message: format!("bad cursor '{cursor}': {e}"),
                })?,
            None => 0,
        };
        let end = (start + request.per_page as usize).min(script.total);
        let items = (start.min(end)..end)
            .map(|index| Self::item(&script, index))
            .collect();
        let next_cursor = (end < script.total).then(|| Cursor::new(end.to_string()));
        Ok(Page { items, next_cursor })
    }
}

/// Defaults with jitter off and inline immediate hand-off, so timing and
/// job outcomes are deterministic.
pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.retry.backoff.jitter = false;
    config.immediate.mode = HandoffMode::Inline;
    config
}

/// An orchestrator over in-memory stores, a manual clock, a recording
/// sleeper and a scripted remote.
#[derive(Debug)]
pub struct Harness {
    pub config: OrchestratorConfig,
    pub clock: Arc<ManualClock>,
    pub sleeper: Arc<RecordingSleeper>,
    pub remote: Arc<ScriptedRemote>,
    pub jobs: Arc<InMemoryJobStore>,
    pub backfills: Arc<InMemoryBackfillStore>,
    pub breaker_store: Arc<InMemoryBreakerStateStore>,
    pub sink: Arc<InMemoryItemSink>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub fn new(remote: ScriptedRemote) -> Self {
        Self::with_config(remote, test_config())
    }

    pub fn with_config(remote: ScriptedRemote, config: OrchestratorConfig) -> Self {
        let clock = Arc::new(ManualClock::new(base_time()));
        let sleeper = Arc::new(RecordingSleeper::advancing(clock.clone()));
        let remote = Arc::new(remote);
        let jobs = InMemoryJobStore::arc();
        let backfills = InMemoryBackfillStore::arc();
        let breaker_store = InMemoryBreakerStateStore::arc();
        let sink = InMemoryItemSink::arc();
        let stores = Stores {
            jobs: jobs.clone(),
            backfills: backfills.clone(),
            breakers: breaker_store.clone(),
            sink: sink.clone(),
        };

        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let governor = Arc::new(RateLimitGovernor::with_max_reset_wait(
            dyn_clock.clone(),
            config.max_rate_limit_wait,
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            &config,
            stores,
            remote.clone(),
            governor,
            dyn_clock,
            sleeper.clone(),
        ));

        Self {
            config,
            clock,
            sleeper,
            remote,
            jobs,
            backfills,
            breaker_store,
            sink,
            orchestrator,
        }
    }
}
