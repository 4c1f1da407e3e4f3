use hybridcap_infra::jobs::circuit_key;
use hybridcap_infra::testing::{Harness, ScriptedRemote};
use hybridcap_core::ResourceId;
use reqwest::StatusCode;
use serde_json::{json, Value};

struct TestServer {
    base_url: String,
    harness: Harness,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(remote: ScriptedRemote) -> Self {
        // Same router as prod over a harness orchestrator, bound to an ephemeral port.
        let harness = Harness::new(remote);
        let app = hybridcap_api::app::build_app(harness.orchestrator.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            harness,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn post_capture(client: &reqwest::Client, server: &TestServer, body: Value) -> reqwest::Response {
    client
        .post(server.url("/v1/captures"))
        .json(&body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let server = TestServer::spawn(ScriptedRemote::with_items(0)).await;
    let res = reqwest::get(server.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn recent_capture_is_routed_and_completed() {
    let server = TestServer::spawn(ScriptedRemote::with_items(50)).await;
    let client = reqwest::Client::new();

    let res = post_capture(
        &client,
        &server,
        json!({
            "resource_id": "repo:42",
            "resource_name": "acme/widgets",
            "time_range_days": 1,
            "priority": "high",
            "trigger_source": "webhook"
        }),
    )
    .await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["assigned_processor"], "immediate");
    assert_eq!(body["job_type"], "recent_capture");

    let job_id = body["job_id"].as_str().unwrap().to_string();
    let job: Value = client
        .get(server.url(&format!("/v1/jobs/{job_id}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(job["status"], "completed");
    assert_eq!(job["processor"], "immediate");
    assert_eq!(job["metadata"]["items_captured"], 50);
}

#[tokio::test]
async fn invalid_capture_request_is_400() {
    let server = TestServer::spawn(ScriptedRemote::with_items(10)).await;
    let client = reqwest::Client::new();

    let res = post_capture(
        &client,
        &server,
        json!({
            "resource_id": "repo:42",
            "resource_name": "acme/widgets",
            "time_range_days": 0
        }),
    )
    .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let stats: Value = client
        .get(server.url("/v1/jobs/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats, json!({"queued": 0, "processing": 0, "completed": 0, "failed": 0}));
}

#[tokio::test]
async fn queued_job_can_be_deleted_once() {
    let server = TestServer::spawn(ScriptedRemote::with_items(10)).await;
    let client = reqwest::Client::new();

    let body: Value = post_capture(
        &client,
        &server,
        json!({
            "resource_id": "repo:7",
            "resource_name": "acme/widgets",
            "time_range_days": 30,
            "estimated_item_count": 3000
        }),
    )
    .await
    .json()
    .await
    .unwrap();
    assert_eq!(body["assigned_processor"], "batch");
    assert_eq!(body["job_type"], "historical_capture");
    let job_url = server.url(&format!("/v1/jobs/{}", body["job_id"].as_str().unwrap()));

    let queued: Value = client
        .get(server.url("/v1/jobs?status=queued&processor=batch"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(queued.as_array().unwrap().len(), 1);

    let res = client.delete(&job_url).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let res = client.get(&job_url).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let res = client.delete(&job_url).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deleting_a_finished_job_conflicts() {
    let server = TestServer::spawn(ScriptedRemote::with_items(10)).await;
    let client = reqwest::Client::new();

    let body: Value = post_capture(
        &client,
        &server,
        json!({"resource_id": "repo:1", "resource_name": "acme/widgets", "time_range_days": 1}),
    )
    .await
    .json()
    .await
    .unwrap();

    let res = client
        .delete(server.url(&format!("/v1/jobs/{}", body["job_id"].as_str().unwrap())))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn malformed_ids_and_filters_are_400() {
    let server = TestServer::spawn(ScriptedRemote::with_items(0)).await;
    let client = reqwest::Client::new();

    let res = client.get(server.url("/v1/jobs/not-a-uuid")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .get(server.url("/v1/jobs?status=sleeping"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .get(server.url("/v1/backfills?status=done"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn backfill_advances_on_external_tick() {
    let server = TestServer::spawn(ScriptedRemote::with_items(60)).await;
    let client = reqwest::Client::new();

    let body: Value = post_capture(
        &client,
        &server,
        json!({
            "resource_id": "repo:8",
            "resource_name": "acme/widgets",
            "time_range_days": 365,
            "estimated_item_count": 6000
        }),
    )
    .await
    .json()
    .await
    .unwrap();
    assert_eq!(body["job_type"], "backfill_chunk");

    let backfill: Value = client
        .get(server.url("/v1/backfills/repo:8"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(backfill["status"], "active");
    assert_eq!(backfill["total_items"], 6000);
    assert_eq!(backfill["processed_items"], 0);

    let tick: Value = client
        .post(server.url("/v1/batch/tick"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(tick["skipped"], false);
    assert_eq!(tick["backfill_jobs_claimed"], 1);
    assert_eq!(tick["chunks"][0]["resource_id"], "repo:8");
    assert_eq!(tick["chunks"][0]["outcome"], "advanced");
    assert_eq!(tick["chunks"][0]["processed_items"], 25);

    let active: Value = client
        .get(server.url("/v1/backfills?status=active"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(active.as_array().unwrap().len(), 1);
    assert_eq!(active[0]["processed_items"], 25);
}

#[tokio::test]
async fn reactivation_requires_a_paused_backfill() {
    let server = TestServer::spawn(ScriptedRemote::with_items(60)).await;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url("/v1/backfills/repo:none/reactivate"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    server
        .harness
        .orchestrator
        .machine()
        .start(&ResourceId::new("repo:3").unwrap(), "acme/widgets", 60)
        .await
        .unwrap();
    let res = client
        .post(server.url("/v1/backfills/repo:3/reactivate"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn breakers_can_be_listed_and_reset() {
    let server = TestServer::spawn(ScriptedRemote::with_items(0)).await;
    let client = reqwest::Client::new();
    let key = circuit_key(&ResourceId::new("repo:42").unwrap());
    for _ in 0..5 {
        server.harness.orchestrator.breakers().record_failure(&key);
    }

    let breakers: Value = client
        .get(server.url("/v1/breakers"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(breakers[0]["key"], key.as_str());
    assert_eq!(breakers[0]["state"], "OPEN");

    let reset: Value = client
        .post(server.url(&format!("/v1/breakers/{key}/reset")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reset["state"], "CLOSED");
    assert_eq!(reset["consecutive_failures"], 0);

    let res = client
        .post(server.url("/v1/breakers/reset"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn rate_limit_is_empty_before_any_response() {
    let server = TestServer::spawn(ScriptedRemote::with_items(0)).await;
    let body: Value = reqwest::get(server.url("/v1/rate-limit"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["rate_limit"], Value::Null);
    assert_eq!(body["wait_before_next_call_ms"], 0);
}
