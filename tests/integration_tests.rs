//! End-to-end tests over a real socket.
//!
//! Each test binds an ephemeral port, runs the orchestrator on it with a
//! router that adds a few instrumented routes behind the full pipeline, and
//! talks to it with `reqwest`.
//!
//! Run with: `cargo test --test integration_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use reqwest::Client;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use edgeguard::middleware::cache_control::NO_STORE;
use edgeguard::{AppResult, AppState, Config, LifecyclePhase, Orchestrator, apply_pipeline, handlers};

/// Routes used by the tests, behind the full pipeline.
fn test_router(state: &AppState, started: Arc<Notify>) -> Router {
    let slow_started = started.clone();
    let router = Router::new()
        .route("/health", get(handlers::health_check))
        .with_state(state.clone())
        .route(
            "/slow",
            get(move || {
                let started = slow_started.clone();
                async move {
                    started.notify_one();
                    sleep(Duration::from_millis(500)).await;
                    "done"
                }
            }),
        )
        .route(
            "/hang",
            get(move || {
                let started = started.clone();
                async move {
                    started.notify_one();
                    std::future::pending::<&'static str>().await
                }
            }),
        )
        .route("/fail", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
        .route("/panic", get(panicking))
        .fallback(handlers::not_found);

    apply_pipeline(router, state)
}

async fn panicking() -> &'static str {
    panic!("handler bug")
}

/// Test fixture running the orchestrator on an ephemeral port.
struct TestFixture {
    base_url: String,
    client: Client,
    started: Arc<Notify>,
    phase: watch::Receiver<LifecyclePhase>,
    stop: Option<oneshot::Sender<()>>,
    server: JoinHandle<AppResult<()>>,
}

impl TestFixture {
    async fn new(config: Config) -> Self {
        let orchestrator = Orchestrator::new(config).expect("invalid test config");
        let started = Arc::new(Notify::new());
        let router = test_router(orchestrator.state(), started.clone());
        let phase = orchestrator.phase();

        // Bound before the server task starts, so early connects queue up
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(orchestrator.run_router(listener, router, async {
            let _ = stop_rx.await;
        }));

        Self {
            base_url,
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap(),
            started,
            phase,
            stop: Some(stop_tx),
            server,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("request failed")
    }

    /// Signal stop and wait for the orchestrator to return.
    async fn shutdown(&mut self) -> AppResult<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(Duration::from_secs(10), &mut self.server)
            .await
            .expect("orchestrator did not stop")
            .expect("orchestrator task panicked")
    }
}

fn base_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        shutdown_grace_period: Duration::from_secs(2),
        ..Config::default()
    }
}

fn unlimited_config() -> Config {
    Config {
        rate_limit_rps: 0,
        ..base_config()
    }
}

// ============================================================================
// Health & Pipeline Tests
// ============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let mut fixture = TestFixture::new(base_config()).await;

    let response = fixture.get("/health").await;
    assert_eq!(response.status(), 200);

    let headers = response.headers();
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["cache-control"], NO_STORE);
    assert_eq!(headers["access-control-allow-origin"], "*");

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["circuit"], "closed");
    assert!(body["time"].is_string());

    assert!(fixture.shutdown().await.is_ok());
}

#[tokio::test]
async fn test_unknown_path_returns_json_404() {
    let mut fixture = TestFixture::new(base_config()).await;

    let response = fixture.get("/does/not/exist").await;
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Not found");

    fixture.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_panic_is_contained() {
    let mut fixture = TestFixture::new(unlimited_config()).await;

    let response = fixture.get("/panic").await;
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Internal server error");

    // Same process keeps serving
    let response = fixture.get("/health").await;
    assert_eq!(response.status(), 200);

    fixture.shutdown().await.unwrap();
}

// ============================================================================
// Admission Tests
// ============================================================================

#[tokio::test]
async fn test_rate_limit_returns_429_and_recovers() {
    let mut fixture = TestFixture::new(Config {
        rate_limit_rps: 5,
        rate_limit_burst: 10,
        ..base_config()
    })
    .await;

    for i in 0..10 {
        let response = fixture.get("/health").await;
        assert_eq!(response.status(), 200, "request {i} should be admitted");
    }

    let response = fixture.get("/health").await;
    assert_eq!(response.status(), 429);
    assert!(response.headers().contains_key("retry-after"));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Too many requests");
    assert_eq!(body["retry_after"], "1s");

    // At 5 RPS a second restores several tokens
    sleep(Duration::from_millis(1100)).await;
    let response = fixture.get("/health").await;
    assert_eq!(response.status(), 200);

    fixture.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_circuit_opens_after_server_errors() {
    let mut fixture = TestFixture::new(Config {
        circuit_breaker_max_failures: 3,
        ..unlimited_config()
    })
    .await;

    for _ in 0..3 {
        assert_eq!(fixture.get("/fail").await.status(), 500);
    }

    let response = fixture.get("/health").await;
    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Service temporarily unavailable");

    fixture.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let mut fixture = TestFixture::new(Config {
        max_request_body_size: 16,
        ..unlimited_config()
    })
    .await;

    let response = fixture
        .client
        .post(fixture.url("/health"))
        .body(vec![b'x'; 64])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 413);

    fixture.shutdown().await.unwrap();
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_phase_reaches_stopped() {
    let mut fixture = TestFixture::new(base_config()).await;

    fixture
        .phase
        .wait_for(|p| *p == LifecyclePhase::Running)
        .await
        .unwrap();

    fixture.shutdown().await.unwrap();
    assert_eq!(*fixture.phase.borrow(), LifecyclePhase::Stopped);
}

#[tokio::test]
async fn test_in_flight_request_drains() {
    let mut fixture = TestFixture::new(unlimited_config()).await;

    let client = fixture.client.clone();
    let url = fixture.url("/slow");
    let request = tokio::spawn(async move { client.get(url).send().await });

    fixture.started.notified().await;
    fixture.shutdown().await.unwrap();

    let response = request.await.unwrap().expect("in-flight request was cut off");
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "done");

    // Nothing accepts connections any more
    let refused = fixture.client.get(fixture.url("/health")).send().await;
    assert!(refused.is_err());
}

#[tokio::test]
async fn test_stuck_request_is_forced_closed_after_grace() {
    let mut fixture = TestFixture::new(Config {
        shutdown_grace_period: Duration::from_millis(300),
        ..unlimited_config()
    })
    .await;

    let client = fixture.client.clone();
    let url = fixture.url("/hang");
    let request = tokio::spawn(async move { client.get(url).send().await });

    fixture.started.notified().await;
    let stopping = Instant::now();
    fixture.shutdown().await.unwrap();

    // One grace period bounds the whole drain
    assert!(stopping.elapsed() >= Duration::from_millis(300));
    assert!(stopping.elapsed() < Duration::from_secs(1));
    assert!(request.await.unwrap().is_err());
}
