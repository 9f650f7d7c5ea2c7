//! Application routing with the admission pipeline.
//!
//! # Pipeline (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │  Fault Boundary  │ ← 500 on panic, counted as a circuit failure
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │     Observe      │ ← client key, active gauge, breaker feedback on 5xx
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Access Log     │ ← [METHOD] path client status elapsed
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │ Security Headers │
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Rate Limiting   │ ← 429 if the client's bucket is empty
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │ Circuit Breaker  │ ← 503 while open
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Cache-Control   │
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Body Limit     │ ← 413 on oversized Content-Length
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │      CORS        │ ← 204 for OPTIONS
//! └────────┬─────────┘
//!          ▼
//!      Handler
//! ```
//!
//! # Routes
//!
//! - `GET /health` - Health check
//! - anything else - 404 JSON

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::get;
use tracing::info;

use crate::handlers;
use crate::middleware::{
    FaultBoundaryLayer, ObserveLayer, RateLimitLayer, access_log, body_limit, cache_control,
    circuit, cors, security_headers,
};
use crate::state::AppState;

/// Build the application router with all routes and the pipeline installed.
pub fn build_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/health", get(handlers::health_check))
        .fallback(handlers::not_found)
        .with_state(state.clone());

    apply_pipeline(router, &state)
}

/// Wrap `router` in the admission pipeline.
///
/// Works on any router, so tests (and embedders) can put their own handlers
/// behind exactly the same stages.
pub fn apply_pipeline<S>(mut router: Router<S>, state: &AppState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let config = &state.config;

    // =========================================================================
    // Apply Pipeline (order matters - applied innermost first)
    // =========================================================================

    // 9. CORS
    router = router.layer(from_fn(cors::cors));

    // 8. Request body size limit
    info!(
        max_bytes = config.max_request_body_size,
        "Request body size limit configured"
    );
    let extractor_limit = usize::try_from(config.max_request_body_size).unwrap_or(usize::MAX);
    router = router
        .layer(DefaultBodyLimit::max(extractor_limit))
        .layer(from_fn_with_state(
            config.max_request_body_size,
            body_limit::limit_declared_size,
        ));

    // 7. Cache-Control
    let static_prefix: Arc<str> = Arc::from(config.static_path_prefix.as_str());
    router = router.layer(from_fn_with_state(static_prefix, cache_control::cache_control));

    // 6. Circuit breaker gate
    router = router.layer(from_fn_with_state(
        state.circuit_breaker.clone(),
        circuit::circuit_gate,
    ));

    // 5. Rate limiting (if enabled)
    match &state.rate_limiter {
        Some(limiter) => {
            info!(
                rps = limiter.rps(),
                burst = limiter.burst(),
                trusted_proxies = config.trusted_proxies.len(),
                "Rate limiting enabled"
            );
            router = router.layer(RateLimitLayer::new(limiter.clone()));
        }
        None => info!("Rate limiting disabled (RATE_LIMIT_RPS=0)"),
    }

    // 4. Security headers
    router = security_headers::apply(router);

    // 3. Access log
    router = router.layer(from_fn(access_log::log_access));

    // 2. Metrics and breaker feedback
    router = router.layer(ObserveLayer::new(state));

    // 1. Fault boundary - applied last, runs first
    router.layer(FaultBoundaryLayer::new(state))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode, header};
    use serde_json::{Value, json};
    use std::time::Duration;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::handlers::HealthResponse;
    use crate::middleware::cache_control::{NO_STORE, STATIC_ASSET_CACHE};
    use crate::middleware::security_headers::SECURITY_HEADERS;

    fn state_with(config: Config) -> AppState {
        AppState::new(config).unwrap().0
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn fail() -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    async fn panicking() -> &'static str {
        panic!("handler bug")
    }

    /// Pipeline over the real routes plus a failing and a panicking one.
    fn test_app(state: &AppState) -> Router {
        let router = Router::new()
            .route("/health", get(handlers::health_check))
            .route("/fail", get(fail))
            .route("/panic", get(panicking))
            .route("/static/app.css", get(|| async { "body {}" }))
            .fallback(handlers::not_found)
            .with_state(state.clone());
        apply_pipeline(router, state)
    }

    #[tokio::test]
    async fn test_health_has_all_headers() {
        let state = state_with(Config::default());
        let app = build_router(state.clone());

        let response = app.oneshot(get_req("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let headers = response.headers();
        for (name, value) in SECURITY_HEADERS {
            assert_eq!(headers[&name], value);
        }
        assert_eq!(headers[header::CACHE_CONTROL], NO_STORE);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");

        let body: HealthResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(body.status, "ok");
        assert_eq!(body.circuit, "closed");
        assert_eq!(body.active_requests, 1);

        assert_eq!(state.metrics.snapshot().active_requests, 0);
    }

    #[tokio::test]
    async fn test_not_found_fallback() {
        let app = build_router(state_with(Config::default()));

        let response = app.oneshot(get_req("/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[header::CACHE_CONTROL], NO_STORE);
        assert_eq!(body_json(response).await, json!({"error": "Not found"}));
    }

    #[tokio::test]
    async fn test_static_prefix_cache_header() {
        let state = state_with(Config::default());
        let app = test_app(&state);

        for uri in ["/static/app.css", "/static/missing.png"] {
            let response = app.clone().oneshot(get_req(uri)).await.unwrap();
            assert_eq!(response.headers()[header::CACHE_CONTROL], STATIC_ASSET_CACHE);
        }
    }

    #[tokio::test]
    async fn test_rate_limited_before_inner_stages() {
        let state = state_with(Config {
            rate_limit_rps: 1,
            rate_limit_burst: 2,
            ..Config::default()
        });
        let app = build_router(state.clone());

        for _ in 0..2 {
            let response = app.clone().oneshot(get_req("/health")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.clone().oneshot(get_req("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
        // Outer stages ran, inner ones did not
        assert_eq!(response.headers()[header::X_FRAME_OPTIONS], "DENY");
        assert!(!response.headers().contains_key(header::CACHE_CONTROL));
        assert!(
            !response
                .headers()
                .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        );
        assert_eq!(
            body_json(response).await,
            json!({"error": "Too many requests", "retry_after": "1s"})
        );

        // Client errors never trip the circuit
        assert_eq!(state.circuit_breaker.failure_count(), 0);
        let snapshot = state.metrics.snapshot();
        assert_eq!(snapshot.request_count, 3);
        assert_eq!(snapshot.error_count, 1);
    }

    #[tokio::test]
    async fn test_preflight_gets_no_content() {
        let app = build_router(state_with(Config::default()));

        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()[header::ACCESS_CONTROL_MAX_AGE], "86400");
        assert_eq!(response.headers()[header::CACHE_CONTROL], NO_STORE);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let state = state_with(Config {
            max_request_body_size: 8,
            ..Config::default()
        });
        let app = build_router(state);

        let req = Request::builder()
            .method(Method::POST)
            .uri("/health")
            .header(header::CONTENT_LENGTH, "9")
            .body(Body::from("123456789"))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            body_json(response).await,
            json!({"error": "Request size exceeds maximum allowed size of 8 bytes"})
        );
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let state = state_with(Config::default());
        let app = test_app(&state);

        let response = app.clone().oneshot(get_req("/panic")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(response).await,
            json!({"error": "Internal server error"})
        );

        assert_eq!(state.circuit_breaker.failure_count(), 1);
        assert_eq!(state.metrics.snapshot().active_requests, 0);

        let response = app.oneshot(get_req("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_trips_and_recovers() {
        let state = state_with(Config {
            rate_limit_rps: 0,
            circuit_breaker_max_failures: 5,
            circuit_breaker_cooldown: Duration::from_secs(30),
            ..Config::default()
        });
        let app = test_app(&state);

        for _ in 0..5 {
            let response = app.clone().oneshot(get_req("/fail")).await.unwrap();
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }
        assert_eq!(state.circuit_breaker.failure_count(), 5);

        tokio::time::advance(Duration::from_secs(10)).await;
        let response = app.clone().oneshot(get_req("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body_json(response).await,
            json!({"error": "Service temporarily unavailable"})
        );
        // The gate's own 503 does not extend the cooldown
        assert_eq!(state.circuit_breaker.failure_count(), 5);

        tokio::time::advance(Duration::from_secs(21)).await;
        let response = app.clone().oneshot(get_req("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.circuit_breaker.failure_count(), 0);
    }
}
