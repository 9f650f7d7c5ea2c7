//! Rate limiting stage.
//!
//! Looks up the client key resolved by the observability stage and consumes
//! one token from that client's bucket. An empty bucket short-circuits with
//! 429 before any inner stage or handler runs.
//!
//! # Response Headers
//!
//! On rate limit exceeded (429):
//! - `Retry-After`: Whole seconds until the next token (at least 1)
//!
//! The JSON body carries a fixed `"retry_after": "1s"` hint for clients that
//! do not read headers.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::warn;

use crate::admission::ClientRateLimiter;
use crate::context::PipelineContext;
use crate::error::Rejection;

/// Rate limiting layer for the request pipeline.
///
/// # Example
///
/// ```rust,ignore
/// let limiter = Arc::new(ClientRateLimiter::new(5, 10)?);
/// let app = Router::new()
///     .route("/", get(handler))
///     .layer(RateLimitLayer::new(limiter));
/// ```
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<ClientRateLimiter>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<ClientRateLimiter>) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<ClientRateLimiter>,
}

/// Whole seconds to wait, rounded up, never below 1.
fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}

impl<S> Service<Request<Body>> for RateLimitService<S>
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
        let client_key = PipelineContext::client_key_of(&req);

        if let Err(wait) = self.limiter.check(&client_key) {
            let retry_after = retry_after_secs(wait);
            warn!(
                client = %client_key,
                path = %req.uri().path(),
                retry_after_secs = retry_after,
                "Rate limit exceeded"
            );

            return Box::pin(async move {
                Ok(Rejection::TooManyRequests {
                    retry_after_secs: retry_after,
                }
                .into_response())
            });
        }

        // Swap in a fresh clone so the service that was polled ready is the
        // one that gets called
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move { inner.call(req).await })
    }
}
