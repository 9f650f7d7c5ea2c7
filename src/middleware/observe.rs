//! Observability stage.
//!
//! Wraps everything inside the fault boundary:
//!
//! 1. resolves the client key and stores a [`PipelineContext`] in the request
//! 2. enters the active-request gauge
//! 3. on completion records status and latency, and feeds the circuit breaker
//!    on server-class responses
//!
//! Responses tagged [`AdmissionRejected`] (the breaker's own 503) never count
//! as circuit failures, or a tripped circuit under steady traffic would keep
//! re-arming itself.
//!
//! If the inner future is dropped (client abort, panic, forced close) the
//! in-flight guard still leaves the gauge exactly once.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::debug;

use crate::admission::CircuitBreaker;
use crate::context::PipelineContext;
use crate::error::AdmissionRejected;
use crate::metrics::RequestMetrics;
use crate::middleware::ip::{TrustedProxies, resolve_client_key};
use crate::state::AppState;

#[derive(Clone)]
pub struct ObserveLayer {
    metrics: Arc<RequestMetrics>,
    circuit_breaker: Arc<CircuitBreaker>,
    trusted_proxies: Arc<TrustedProxies>,
}

impl ObserveLayer {
    pub fn new(state: &AppState) -> Self {
        Self {
            metrics: state.metrics.clone(),
            circuit_breaker: state.circuit_breaker.clone(),
            trusted_proxies: state.trusted_proxies.clone(),
        }
    }
}

impl<S> Layer<S> for ObserveLayer {
    type Service = ObserveService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ObserveService {
            inner,
            metrics: self.metrics.clone(),
            circuit_breaker: self.circuit_breaker.clone(),
            trusted_proxies: self.trusted_proxies.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ObserveService<S> {
    inner: S,
    metrics: Arc<RequestMetrics>,
    circuit_breaker: Arc<CircuitBreaker>,
    trusted_proxies: Arc<TrustedProxies>,
}

impl<S> Service<Request<Body>> for ObserveService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let client_key = resolve_client_key(&req, &self.trusted_proxies);
        req.extensions_mut()
            .insert(PipelineContext::new(client_key));

        let in_flight = self.metrics.on_request_start();
        let circuit_breaker = self.circuit_breaker.clone();

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let response = inner.call(req).await?;
            let status = response.status();
            in_flight.finish(status);

            if status.is_server_error() {
                if response.extensions().get::<AdmissionRejected>().is_some() {
                    debug!(%status, "Admission rejection, not a circuit failure");
                } else {
                    circuit_breaker.record_failure();
                }
            }

            Ok(response)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::{ConnectInfo, Extension};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use std::net::SocketAddr;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::error::Rejection;

    fn state() -> AppState {
        AppState::new(Config::default()).unwrap().0
    }

    async fn send(app: &Router, uri: &str) -> StatusCode {
        let mut req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let peer: SocketAddr = "198.51.100.4:4000".parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(peer));
        app.clone().oneshot(req).await.unwrap().status()
    }

    fn app(state: &AppState) -> Router {
        Router::new()
            .route("/ok", get(|| async { "ok" }))
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
            .route("/boom", get(|| async { StatusCode::BAD_GATEWAY }))
            .route("/gate", get(|| async { Rejection::CircuitOpen.into_response() }))
            .route(
                "/whoami",
                get(|Extension(ctx): Extension<PipelineContext>| async move {
                    ctx.client_key.to_string()
                }),
            )
            .layer(ObserveLayer::new(state))
    }

    #[tokio::test]
    async fn test_counts_requests_and_errors() {
        let state = state();
        let app = app(&state);

        assert_eq!(send(&app, "/ok").await, StatusCode::OK);
        assert_eq!(send(&app, "/missing").await, StatusCode::NOT_FOUND);

        let snapshot = state.metrics.snapshot();
        assert_eq!(snapshot.request_count, 2);
        assert_eq!(snapshot.error_count, 1);
        assert_eq!(snapshot.active_requests, 0);
    }

    #[tokio::test]
    async fn test_only_server_errors_feed_breaker() {
        let state = state();
        let app = app(&state);

        send(&app, "/missing").await;
        assert_eq!(state.circuit_breaker.failure_count(), 0);

        send(&app, "/boom").await;
        assert_eq!(state.circuit_breaker.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_admission_rejection_is_not_a_circuit_failure() {
        let state = state();
        let app = app(&state);

        assert_eq!(send(&app, "/gate").await, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.circuit_breaker.failure_count(), 0);
        assert_eq!(state.metrics.snapshot().error_count, 1);
    }

    #[tokio::test]
    async fn test_context_carries_peer_key() {
        let state = state();
        let app = app(&state);

        let mut req = Request::builder().uri("/whoami").body(Body::empty()).unwrap();
        let peer: SocketAddr = "198.51.100.4:4000".parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(peer));
        let response = app.oneshot(req).await.unwrap();

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"198.51.100.4");
    }
}
