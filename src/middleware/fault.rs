//! Outermost fault boundary.
//!
//! A panic anywhere inside the pipeline or the handler is caught here and
//! turned into a 500 with `{"error": "Internal server error"}`. The process
//! keeps serving.
//!
//! The inner stages never see the outcome of a panicking request, so the
//! boundary does their bookkeeping itself: it counts the request as an error
//! in metrics, records a circuit failure, and forwards a report to the error
//! queue. The active-request gauge needs no help; the in-flight guard owned by
//! the observability stage is dropped with the panicked future.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use futures::FutureExt;
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::error;

use crate::admission::CircuitBreaker;
use crate::error::Rejection;
use crate::metrics::RequestMetrics;
use crate::reporting::ErrorReporter;
use crate::state::AppState;

#[derive(Clone)]
pub struct FaultBoundaryLayer {
    metrics: Arc<RequestMetrics>,
    circuit_breaker: Arc<CircuitBreaker>,
    errors: ErrorReporter,
}

impl FaultBoundaryLayer {
    pub fn new(state: &AppState) -> Self {
        Self {
            metrics: state.metrics.clone(),
            circuit_breaker: state.circuit_breaker.clone(),
            errors: state.errors.clone(),
        }
    }
}

impl<S> Layer<S> for FaultBoundaryLayer {
    type Service = FaultBoundary<S>;

    fn layer(&self, inner: S) -> Self::Service {
        FaultBoundary {
            inner,
            metrics: self.metrics.clone(),
            circuit_breaker: self.circuit_breaker.clone(),
            errors: self.errors.clone(),
        }
    }
}

#[derive(Clone)]
pub struct FaultBoundary<S> {
    inner: S,
    metrics: Arc<RequestMetrics>,
    circuit_breaker: Arc<CircuitBreaker>,
    errors: ErrorReporter,
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic payload"
    }
}

impl<S> Service<Request<Body>> for FaultBoundary<S>
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

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let started_at = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        let metrics = self.metrics.clone();
        let circuit_breaker = self.circuit_breaker.clone();
        let errors = self.errors.clone();

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            // Covers panics while building the future as well as while polling it
            let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| inner.call(req))) {
                Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
                Err(payload) => Err(payload),
            };

            match outcome {
                Ok(result) => result,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(%method, %path, panic = %message, "Recovered from handler panic");

                    errors.report(format!("handler panicked: {message}"));
                    metrics.record_fault(started_at.elapsed());
                    circuit_breaker.record_failure();

                    Ok(Rejection::InternalFault.into_response())
                }
            }
        })
    }
}
