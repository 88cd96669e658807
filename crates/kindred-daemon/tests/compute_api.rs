//! End-to-end tests of the compute API over a real listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kindred_core::aggregate::Aggregator;
use kindred_core::model::{AnalysisStatus, Artifact, Difficulty, Fingerprints, HashEntry};
use kindred_core::status::MemoryStatusLedger;
use kindred_core::store::{ArtifactStore, ResultStore, SqliteStore};
use kindred_core::WorkerPool;
use kindred_daemon::http::rate_limit::{RateLimitConfig, RateLimiter};
use kindred_daemon::http::{router, AppState};
use kindred_daemon::metrics::Metrics;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

const SECRET: &str = "test-secret";

struct TestServer {
    base: String,
    store: Arc<SqliteStore>,
    client: reqwest::Client,
    shutdown: CancellationToken,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with_rate_limit(RateLimitConfig {
            max_requests: 10_000,
            window: Duration::from_secs(1),
            max_tracked_clients: 100,
        })
        .await
    }

    async fn spawn_with_rate_limit(rate_limit: RateLimitConfig) -> Self {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let status = Arc::new(MemoryStatusLedger::new());
        let shutdown = CancellationToken::new();
        let pool = Arc::new(WorkerPool::with_size(2, shutdown.child_token()));
        let aggregator = Arc::new(Aggregator::new(
            Arc::clone(&store) as _,
            Arc::clone(&store) as _,
            Arc::clone(&status) as _,
            Arc::clone(&pool),
            100,
        ));

        let state = AppState {
            artifacts: Arc::clone(&store) as _,
            results: Arc::clone(&store) as _,
            status: Arc::clone(&status) as _,
            aggregator,
            compute_sem: Arc::new(Semaphore::new(2)),
            computation_timeout: Duration::from_secs(60),
            api_secret: Arc::new(SECRET.to_string()),
            rate_limiter: Arc::new(RateLimiter::new(rate_limit)),
            metrics: Arc::new(Metrics::new().unwrap()),
            shutdown: shutdown.clone(),
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state);
        let serve_shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
            .await
            .unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            store,
            client: reqwest::Client::new(),
            shutdown,
        }
    }

    async fn compute(&self, drive_id: &str) -> reqwest::Response {
        self.client
            .post(format!("{}/api/v1/compute", self.base))
            .bearer_auth(SECRET)
            .json(&serde_json::json!({ "driveId": drive_id }))
            .send()
            .await
            .unwrap()
    }

    async fn seed_identical_pair(&self, drive_id: &str) {
        for (attempt, email) in [("a-1", "e1@x.com"), ("a-2", "e2@x.com")] {
            self.store
                .insert_artifact(&artifact(drive_id, attempt, email))
                .await
                .unwrap();
        }
    }

    async fn wait_for_report_status(&self, drive_id: &str, status: AnalysisStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            let report = self.store.report_by_drive(drive_id).await.unwrap();
            if report.is_some_and(|report| report.status == status) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for report status {status}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// An artifact rich enough for a copy of itself to score 1.0.
fn artifact(drive_id: &str, attempt_id: &str, email: &str) -> Artifact {
    Artifact {
        email: email.to_string(),
        attempt_id: attempt_id.to_string(),
        test_id: "t-1".to_string(),
        drive_id: drive_id.to_string(),
        difficulty: Difficulty::Medium,
        source_code: "def f(n): return n * n".to_string(),
        q_id: 1,
        language: "python".to_string(),
        lang_code: "py".to_string(),
        tokens: Vec::new(),
        normalized_tokens: ["def", "f", "(", "n", ")", ":", "return", "n"]
            .iter()
            .map(ToString::to_string)
            .collect(),
        ast: None,
        cfg: None,
        fingerprints: Some(Fingerprints {
            method: "winnowing".to_string(),
            k_gram_size: 5,
            window_size: 4,
            hashes: (0..4)
                .map(|i| HashEntry {
                    hash: format!("h{i}"),
                    position: i,
                })
                .collect(),
        }),
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn health_is_open() {
    let server = TestServer::spawn().await;
    let response = server
        .client
        .get(format!("{}/health", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn api_requires_the_bearer_secret() {
    let server = TestServer::spawn().await;

    let missing = server
        .client
        .post(format!("{}/api/v1/compute", server.base))
        .json(&serde_json::json!({ "driveId": "d-1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 401);

    let wrong = server
        .client
        .post(format!("{}/api/v1/compute", server.base))
        .bearer_auth("not-the-secret")
        .json(&serde_json::json!({ "driveId": "d-1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);
    let body: serde_json::Value = wrong.json().await.unwrap();
    assert_eq!(body["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn unknown_and_empty_drives_are_rejected() {
    let server = TestServer::spawn().await;

    let unknown = server.compute("no-such-drive").await;
    assert_eq!(unknown.status(), 400);
    let body: serde_json::Value = unknown.json().await.unwrap();
    assert_eq!(body["code"], "DRIVE_ID_NOT_FOUND");

    let empty = server.compute("").await;
    assert_eq!(empty.status(), 400);
    let body: serde_json::Value = empty.json().await.unwrap();
    assert_eq!(body["code"], "INVALID_DRIVE_ID");
}

#[tokio::test]
async fn accepted_computation_runs_to_completion() {
    let server = TestServer::spawn().await;
    server.seed_identical_pair("d-1").await;

    let response = server.compute("d-1").await;
    assert_eq!(response.status(), 202);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["step"], "initiated");
    assert_eq!(body["testId"], "d-1");

    server
        .wait_for_report_status("d-1", AnalysisStatus::Completed)
        .await;

    let results = server.store.candidate_results_by_drive("d-1").await.unwrap();
    assert_eq!(results.len(), 2);

    // Re-triggering a completed drive conflicts.
    let again = server.compute("d-1").await;
    assert_eq!(again.status(), 409);
    let body: serde_json::Value = again.json().await.unwrap();
    assert_eq!(body["code"], "ALREADY_COMPLETED");
}

#[tokio::test]
async fn requests_over_budget_are_rate_limited() {
    let server = TestServer::spawn_with_rate_limit(RateLimitConfig {
        max_requests: 2,
        window: Duration::from_secs(60),
        max_tracked_clients: 100,
    })
    .await;

    assert_eq!(server.compute("no-such-drive").await.status(), 400);
    assert_eq!(server.compute("no-such-drive").await.status(), 400);

    let limited = server.compute("no-such-drive").await;
    assert_eq!(limited.status(), 429);
    let body: serde_json::Value = limited.json().await.unwrap();
    assert_eq!(body["code"], "RATE_LIMITED");
}

#[tokio::test]
async fn metrics_are_exposed_in_text_format() {
    let server = TestServer::spawn().await;
    server.seed_identical_pair("d-1").await;
    assert_eq!(server.compute("d-1").await.status(), 202);
    server
        .wait_for_report_status("d-1", AnalysisStatus::Completed)
        .await;

    // The outcome counter is bumped just after the report flips, so poll.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let response = server
            .client
            .get(format!("{}/metrics", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let text = response.text().await.unwrap();
        if text.contains("kindred_computations_total{outcome=\"completed\"} 1") {
            assert!(text.contains("kindred_computations_active 0"));
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for completion metric"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
