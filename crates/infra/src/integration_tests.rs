//! Integration tests for the full capture pipeline.
//!
//! Tests: Request → Router → Substrate → Resilient executor → Remote → Sink
//!
//! Verifies:
//! - Routing decisions and job lifecycles on both substrates
//! - Backfills advance one chunk per tick, pause, resume and fail as designed
//! - Replayed chunks never duplicate items
//! - Jobs for one resource never overlap on the immediate substrate
//! - Breaker state gates chunks and survives a restore

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use hybridcap_core::{JobId, ResourceId};

    use crate::backfill::{BackfillState, BackfillStatus, BackfillStore, ChunkOutcome};
    use crate::error::CaptureError;
    use crate::jobs::{
        CapturePayload, CaptureRequest, HandoffMode, Job, JobStatus, JobStore, JobType, Priority,
        Processor, TriggerSource, circuit_key,
    };
    use crate::remote::Cursor;
    use crate::resilience::{BreakerStateStore, CircuitState, RemoteError};
    use crate::sink::ItemSink;
    use crate::testing::{Harness, ScriptedRemote, test_config};

    fn rid(value: &str) -> ResourceId {
        ResourceId::new(value).unwrap()
    }

    fn request(resource_id: &str, days: i64, estimate: Option<u64>) -> CaptureRequest {
        CaptureRequest {
            resource_id: resource_id.to_string(),
            resource_name: "acme/widgets".to_string(),
            time_range_days: days,
            estimated_item_count: estimate,
            priority: Priority::Normal,
            trigger_source: TriggerSource::Automatic,
        }
    }

    fn server_error() -> RemoteError {
        RemoteError::Server {
            status: 503,
            message: "unavailable".into(),
        }
    }

    // ---- routing and window jobs ----

    #[tokio::test]
    async fn recent_request_runs_on_immediate_substrate() {
        let h = Harness::new(ScriptedRemote::with_items(100));

        let outcome = h
            .orchestrator
            .router()
            .route(request("repo:1", 1, None))
            .await
            .unwrap();
        assert_eq!(outcome.assigned_processor, Processor::Immediate);
        assert_eq!(outcome.job_type, JobType::RecentCapture);

        let job = h.jobs.get(outcome.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.metadata["items_captured"], 100);
        assert_eq!(h.sink.count(&rid("repo:1")).await.unwrap(), 100);
        assert!(h.sleeper.waits().is_empty());
    }

    #[tokio::test]
    async fn window_capture_stops_at_cutoff() {
        let remote = ScriptedRemote::with_items(300).spaced(chrono::Duration::minutes(10));
        let h = Harness::new(remote);

        let outcome = h
            .orchestrator
            .router()
            .route(request("repo:1", 1, None))
            .await
            .unwrap();

        let job = h.jobs.get(outcome.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        // 144 ten-minute steps fit in a day, plus the newest item.
        assert_eq!(job.metadata["items_captured"], 145);
        assert_eq!(job.metadata["reached_cutoff"], true);
        assert_eq!(h.remote.call_count(), 2);
    }

    #[tokio::test]
    async fn immediate_job_retries_then_succeeds() {
        let h = Harness::new(ScriptedRemote::with_items(10));
        h.remote.fail_times(2, server_error());

        let outcome = h
            .orchestrator
            .router()
            .route(request("repo:1", 1, None))
            .await
            .unwrap();

        let job = h.jobs.get(outcome.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(
            h.sleeper.waits(),
            vec![Duration::from_millis(1_000), Duration::from_millis(2_000)]
        );
        let breaker = h.orchestrator.breakers().get_state(&circuit_key(&rid("repo:1")));
        assert_eq!(breaker.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn exhausted_immediate_job_is_failed_not_raised() {
        let h = Harness::new(ScriptedRemote::with_items(10));
        h.remote.fail_always(server_error());

        let outcome = h
            .orchestrator
            .router()
            .route(request("repo:1", 1, None))
            .await
            .unwrap();

        let job = h.jobs.get(outcome.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.metadata["attempts"], 3);
        assert!(job.error.as_deref().unwrap_or_default().contains("503"));
        assert!(job.completed_at.is_some());
        assert_eq!(h.remote.call_count(), 3);
    }

    #[tokio::test]
    async fn invalid_request_is_rejected_without_a_job() {
        let h = Harness::new(ScriptedRemote::with_items(10));

        let err = h
            .orchestrator
            .router()
            .route(request("repo:1", 0, None))
            .await
            .unwrap_err();
        assert!(err.is_caller_error());

        let err = h
            .orchestrator
            .router()
            .route(request("  ", 1, None))
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Caller(_)));
        assert_eq!(h.jobs.stats().await.unwrap().queued, 0);
        assert_eq!(h.remote.call_count(), 0);
    }

    #[tokio::test]
    async fn historical_job_waits_for_tick() {
        let h = Harness::new(ScriptedRemote::with_items(3_000));

        let outcome = h
            .orchestrator
            .router()
            .route(request("repo:7", 30, Some(3_000)))
            .await
            .unwrap();
        assert_eq!(outcome.assigned_processor, Processor::Batch);
        assert_eq!(outcome.job_type, JobType::HistoricalCapture);

        let queued = h.jobs.get(outcome.job_id).await.unwrap().unwrap();
        assert_eq!(queued.status, JobStatus::Queued);
        assert_eq!(h.remote.call_count(), 0);

        let report = h.orchestrator.tick().await.unwrap();
        assert_eq!(report.jobs_completed, 1);

        let job = h.jobs.get(outcome.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        // Ten pages of one hundred, then the page limit stops the window.
        assert_eq!(job.metadata["pages"], 10);
        assert_eq!(job.metadata["items_captured"], 1_000);
    }

    #[tokio::test]
    async fn deleted_job_is_never_executed() {
        let h = Harness::new(ScriptedRemote::with_items(10));
        let payload = CapturePayload {
            resource_name: "acme/widgets".into(),
            time_range_days: 1,
            estimated_items: 100,
            priority: Priority::Normal,
            trigger_source: TriggerSource::Manual,
        };
        let job = Job::new(
            JobType::RecentCapture,
            rid("repo:1"),
            &payload,
            Processor::Immediate,
            Utc::now(),
        )
        .unwrap();
        h.jobs.insert(&job).await.unwrap();
        h.jobs.delete_queued(job.id).await.unwrap();

        let ran = h.orchestrator.immediate().handle_job(job.id).await.unwrap();
        assert!(ran.is_none());
        assert_eq!(h.remote.call_count(), 0);
    }

    #[tokio::test]
    async fn a_job_is_claimed_once() {
        let h = Harness::new(ScriptedRemote::with_items(10));
        let payload = CapturePayload {
            resource_name: "acme/widgets".into(),
            time_range_days: 1,
            estimated_items: 10,
            priority: Priority::High,
            trigger_source: TriggerSource::Webhook,
        };
        let job = Job::new(
            JobType::RecentCapture,
            rid("repo:1"),
            &payload,
            Processor::Immediate,
            Utc::now(),
        )
        .unwrap();
        h.jobs.insert(&job).await.unwrap();

        let immediate = h.orchestrator.immediate();
        let (a, b) = tokio::join!(immediate.handle_job(job.id), immediate.handle_job(job.id));
        let ran = [a.unwrap(), b.unwrap()]
            .into_iter()
            .filter(Option::is_some)
            .count();
        assert_eq!(ran, 1);
        assert_eq!(h.remote.call_count(), 1);
    }

    // ---- immediate substrate concurrency ----

    fn spawning_harness(remote: ScriptedRemote, max_concurrent: usize) -> Harness {
        let mut config = test_config();
        config.immediate.mode = HandoffMode::Spawn;
        config.immediate.max_concurrent = max_concurrent;
        Harness::with_config(remote, config)
    }

    async fn wait_for_calls(h: &Harness, calls: usize) {
        for _ in 0..1_000 {
            if h.remote.call_count() >= calls {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("expected {calls} remote calls, saw {}", h.remote.call_count());
    }

    async fn let_tasks_run() {
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
    }

    async fn status_of(h: &Harness, job_id: JobId) -> JobStatus {
        h.jobs.get(job_id).await.unwrap().unwrap().status
    }

    async fn wait_for_status(h: &Harness, job_id: JobId, status: JobStatus) {
        for _ in 0..1_000 {
            if status_of(h, job_id).await == status {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("job {job_id} never reached {status:?}");
    }

    #[tokio::test]
    async fn jobs_for_one_resource_never_overlap() {
        let h = spawning_harness(ScriptedRemote::with_items(10).gated(), 4);
        let router = h.orchestrator.router();
        let first = router.route(request("repo:1", 1, None)).await.unwrap().job_id;
        let second = router.route(request("repo:1", 1, None)).await.unwrap().job_id;

        wait_for_calls(&h, 1).await;
        let_tasks_run().await;
        assert_eq!(h.remote.call_count(), 1);
        assert_eq!(status_of(&h, first).await, JobStatus::Processing);
        assert_eq!(status_of(&h, second).await, JobStatus::Queued);

        h.remote.release(1);
        wait_for_calls(&h, 2).await;
        assert_eq!(status_of(&h, first).await, JobStatus::Completed);

        h.remote.release(1);
        wait_for_status(&h, second, JobStatus::Completed).await;
        assert_eq!(h.remote.call_count(), 2);
    }

    #[tokio::test]
    async fn busy_resource_does_not_hold_permits_from_others() {
        let h = spawning_harness(ScriptedRemote::with_items(10).gated(), 2);
        let router = h.orchestrator.router();
        let a1 = router.route(request("repo:a", 1, None)).await.unwrap().job_id;
        let a2 = router.route(request("repo:a", 1, None)).await.unwrap().job_id;
        let b1 = router.route(request("repo:b", 1, None)).await.unwrap().job_id;

        wait_for_calls(&h, 2).await;
        let_tasks_run().await;
        let fetched: Vec<_> = h
            .remote
            .requests()
            .iter()
            .map(|r| r.resource_id.as_str().to_string())
            .collect();
        assert_eq!(fetched, ["repo:a", "repo:b"]);
        assert_eq!(status_of(&h, a2).await, JobStatus::Queued);

        h.remote.release(3);
        for job_id in [a1, a2, b1] {
            wait_for_status(&h, job_id, JobStatus::Completed).await;
        }
        assert_eq!(h.remote.call_count(), 3);
    }

    // ---- progressive backfill ----

    #[tokio::test]
    async fn backfill_completes_in_forty_chunks() {
        let h = Harness::new(ScriptedRemote::with_items(1_000));
        let repo = rid("repo:99");
        h.orchestrator
            .machine()
            .start(&repo, "acme/widgets", 1_000)
            .await
            .unwrap();

        for tick in 1..=40u64 {
            let report = h.orchestrator.tick().await.unwrap();
            assert_eq!(report.chunks.len(), 1, "tick {tick}");
            let state = h.backfills.get(&repo).await.unwrap().unwrap();
            assert_eq!(state.processed_items, (tick * 25).min(1_000));
        }

        let state = h.backfills.get(&repo).await.unwrap().unwrap();
        assert_eq!(state.status, BackfillStatus::Completed);
        assert_eq!(state.processed_items, 1_000);
        assert_eq!(h.remote.call_count(), 40);
        assert_eq!(h.sink.count(&repo).await.unwrap(), 1_000);

        let report = h.orchestrator.tick().await.unwrap();
        assert!(report.chunks.is_empty());
        assert_eq!(h.remote.call_count(), 40);
    }

    #[tokio::test]
    async fn chunks_follow_the_cursor_in_order() {
        let h = Harness::new(ScriptedRemote::with_items(100));
        let repo = rid("repo:5");
        h.orchestrator
            .machine()
            .start(&repo, "acme/widgets", 100)
            .await
            .unwrap();

        for _ in 0..4 {
            h.orchestrator.tick().await.unwrap();
        }
        let cursors: Vec<Option<String>> = h
            .remote
            .requests()
            .into_iter()
            .map(|r| r.cursor.map(Cursor::into_string))
            .collect();
        assert_eq!(
            cursors,
            vec![None, Some("25".into()), Some("50".into()), Some("75".into())]
        );
        assert!(h.remote.requests().iter().all(|r| r.per_page == 25));
    }

    #[tokio::test]
    async fn backfill_resumes_from_persisted_cursor() {
        let h = Harness::new(ScriptedRemote::with_items(1_000));
        let repo = rid("repo:99");
        let mut state =
            BackfillState::new(repo.clone(), "acme/widgets", 1_000, 25, Utc::now()).unwrap();
        state.processed_items = 500;
        state.last_cursor = Some(Cursor::new("500"));
        h.backfills.create_if_absent(&state).await.unwrap();

        let outcome = h.orchestrator.machine().run_chunk(&repo).await.unwrap();
        assert_eq!(
            outcome,
            ChunkOutcome::Advanced {
                processed_items: 525,
                total_items: 1_000
            }
        );
        let requests = h.remote.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].cursor, Some(Cursor::new("500")));

        let saved = h.backfills.get(&repo).await.unwrap().unwrap();
        assert_eq!(saved.last_cursor, Some(Cursor::new("525")));
    }

    #[tokio::test]
    async fn replayed_chunk_does_not_duplicate_items() {
        let h = Harness::new(ScriptedRemote::with_items(100));
        let repo = rid("repo:3");
        let initial = h
            .orchestrator
            .machine()
            .start(&repo, "acme/widgets", 100)
            .await
            .unwrap();

        h.orchestrator.machine().run_chunk(&repo).await.unwrap();
        assert_eq!(h.sink.count(&repo).await.unwrap(), 25);

        // Items were written but the cursor update was lost.
        let current = h.backfills.get(&repo).await.unwrap().unwrap();
        let rewound = BackfillState {
            revision: current.revision,
            ..initial.clone()
        };
        h.backfills
            .save(&rewound, Some(&Cursor::new("25")))
            .await
            .unwrap();
        h.orchestrator.machine().run_chunk(&repo).await.unwrap();

        assert_eq!(h.sink.count(&repo).await.unwrap(), 25);
        let state = h.backfills.get(&repo).await.unwrap().unwrap();
        assert_eq!(state.processed_items, 25);
        assert_eq!(state.last_cursor, Some(Cursor::new("25")));
    }

    #[tokio::test]
    async fn stale_writer_cannot_rewind_cursor() {
        let h = Harness::new(ScriptedRemote::with_items(100));
        let repo = rid("repo:3");
        let initial = h
            .orchestrator
            .machine()
            .start(&repo, "acme/widgets", 100)
            .await
            .unwrap();
        h.orchestrator.machine().run_chunk(&repo).await.unwrap();

        // Saving against the pre-chunk cursor is a conflict.
        let err = h.backfills.save(&initial, None).await.unwrap_err();
        assert!(matches!(err, crate::error::StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn three_failed_chunks_pause_until_reactivated() {
        let h = Harness::new(ScriptedRemote::with_items(100));
        let repo = rid("repo:12");
        h.orchestrator
            .machine()
            .start(&repo, "acme/widgets", 100)
            .await
            .unwrap();
        h.remote.fail_always(RemoteError::Network("connection reset".into()));

        let first = h.orchestrator.tick().await.unwrap();
        assert!(matches!(
            first.chunks[0].outcome,
            ChunkOutcome::Retrying {
                consecutive_errors: 1,
                ..
            }
        ));
        h.orchestrator.tick().await.unwrap();
        let third = h.orchestrator.tick().await.unwrap();
        assert!(matches!(
            third.chunks[0].outcome,
            ChunkOutcome::Paused {
                consecutive_errors: 3,
                ..
            }
        ));

        let state = h.backfills.get(&repo).await.unwrap().unwrap();
        assert_eq!(state.status, BackfillStatus::Paused);
        assert_eq!(state.processed_items, 0);
        assert!(state.last_error.is_some());

        // Three attempts per chunk, no further calls while paused.
        let calls = h.remote.call_count();
        assert_eq!(calls, 9);
        let idle = h.orchestrator.tick().await.unwrap();
        assert!(idle.chunks.is_empty());
        assert_eq!(h.remote.call_count(), calls);

        h.remote.recover();
        let resumed = h.orchestrator.machine().reactivate(&repo).await.unwrap();
        assert_eq!(resumed.status, BackfillStatus::Active);
        assert_eq!(resumed.consecutive_errors, 0);

        h.orchestrator.tick().await.unwrap();
        let state = h.backfills.get(&repo).await.unwrap().unwrap();
        assert_eq!(state.processed_items, 25);
    }

    #[tokio::test]
    async fn reactivating_an_active_backfill_conflicts() {
        let h = Harness::new(ScriptedRemote::with_items(100));
        let repo = rid("repo:12");
        h.orchestrator
            .machine()
            .start(&repo, "acme/widgets", 100)
            .await
            .unwrap();

        let err = h.orchestrator.machine().reactivate(&repo).await.unwrap_err();
        assert!(matches!(
            err,
            CaptureError::Caller(hybridcap_core::DomainError::Conflict(_))
        ));
        let missing = h
            .orchestrator
            .machine()
            .reactivate(&rid("repo:none"))
            .await
            .unwrap_err();
        assert!(matches!(
            missing,
            CaptureError::Caller(hybridcap_core::DomainError::NotFound)
        ));
    }

    #[tokio::test]
    async fn open_breaker_defers_chunk_without_counting_an_error() {
        let h = Harness::new(ScriptedRemote::with_items(100));
        let repo = rid("repo:42");
        h.orchestrator
            .machine()
            .start(&repo, "acme/widgets", 100)
            .await
            .unwrap();
        let key = circuit_key(&repo);
        for _ in 0..5 {
            h.orchestrator.breakers().record_failure(&key);
        }

        let report = h.orchestrator.tick().await.unwrap();
        assert_eq!(report.chunks[0].outcome, ChunkOutcome::Deferred);
        assert_eq!(h.remote.call_count(), 0);
        let state = h.backfills.get(&repo).await.unwrap().unwrap();
        assert_eq!(state.consecutive_errors, 0);
        assert_eq!(state.status, BackfillStatus::Active);

        h.clock.advance(chrono::Duration::seconds(60));
        let report = h.orchestrator.tick().await.unwrap();
        assert!(matches!(
            report.chunks[0].outcome,
            ChunkOutcome::Advanced {
                processed_items: 25,
                ..
            }
        ));
        assert_eq!(
            h.orchestrator.breakers().get_state(&key).state,
            CircuitState::HalfOpen
        );
    }

    #[tokio::test]
    async fn routed_backfill_job_settles_with_its_backfill() {
        let h = Harness::new(ScriptedRemote::with_items(60));

        let outcome = h
            .orchestrator
            .router()
            .route(request("repo:8", 365, Some(6_000)))
            .await
            .unwrap();
        assert_eq!(outcome.job_type, JobType::BackfillChunk);
        let state = h.backfills.get(&rid("repo:8")).await.unwrap().unwrap();
        assert_eq!(state.total_items, 6_000);

        let first = h.orchestrator.tick().await.unwrap();
        assert_eq!(first.backfill_jobs_claimed, 1);
        let job = h.jobs.get(outcome.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);

        h.orchestrator.tick().await.unwrap();
        let last = h.orchestrator.tick().await.unwrap();
        assert_eq!(last.backfill_jobs_settled, 1);
        assert_eq!(
            last.chunks[0].outcome,
            ChunkOutcome::Completed { processed_items: 60 }
        );

        let job = h.jobs.get(outcome.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.metadata["processed_items"], 60);
    }

    #[tokio::test]
    async fn gone_resource_fails_backfill_and_job() {
        let h = Harness::new(ScriptedRemote::with_items(60));
        h.remote.fail_always(RemoteError::Gone {
            status: 404,
            message: "Not Found".into(),
        });

        let outcome = h
            .orchestrator
            .router()
            .route(request("repo:9", 365, Some(6_000)))
            .await
            .unwrap();
        let report = h.orchestrator.tick().await.unwrap();

        assert!(matches!(report.chunks[0].outcome, ChunkOutcome::Failed { .. }));
        assert_eq!(report.backfill_jobs_settled, 1);
        assert_eq!(h.remote.call_count(), 1);

        let state = h.backfills.get(&rid("repo:9")).await.unwrap().unwrap();
        assert_eq!(state.status, BackfillStatus::Failed);
        let job = h.jobs.get(outcome.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.is_some());
    }

    #[tokio::test]
    async fn tick_advances_least_recently_updated_backfills_first() {
        let mut config = crate::testing::test_config();
        config.batch.max_backfills_per_tick = 1;
        let h = Harness::with_config(ScriptedRemote::with_items(100), config);

        for id in ["repo:a", "repo:b"] {
            h.orchestrator
                .machine()
                .start(&rid(id), "acme/widgets", 100)
                .await
                .unwrap();
            h.clock.advance(chrono::Duration::seconds(1));
        }

        let first = h.orchestrator.tick().await.unwrap();
        assert_eq!(first.chunks[0].resource_id, rid("repo:a"));
        h.clock.advance(chrono::Duration::seconds(1));
        let second = h.orchestrator.tick().await.unwrap();
        assert_eq!(second.chunks[0].resource_id, rid("repo:b"));
    }

    // ---- breaker persistence ----

    #[tokio::test]
    async fn breaker_state_is_persisted_after_tick_and_restored() {
        let h = Harness::new(ScriptedRemote::with_items(100));
        let key = circuit_key(&rid("repo:42"));
        for _ in 0..5 {
            h.orchestrator.breakers().record_failure(&key);
        }
        h.orchestrator.tick().await.unwrap();

        let saved = h.breaker_store.load_all().await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].state, CircuitState::Open);

        h.orchestrator.breakers().reset_all();
        assert_eq!(
            h.orchestrator.breakers().get_state(&key).state,
            CircuitState::Closed
        );
        assert_eq!(h.orchestrator.restore_breakers().await.unwrap(), 1);
        assert_eq!(
            h.orchestrator.breakers().get_state(&key).state,
            CircuitState::Open
        );
    }
}
