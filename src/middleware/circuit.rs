//! Circuit breaker gate.
//!
//! Rejects with 503 while the breaker is open. The rejection is tagged as an
//! admission rejection so the observability stage does not count it as a
//! new failure.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::admission::CircuitBreaker;
use crate::context::PipelineContext;
use crate::error::Rejection;

pub async fn circuit_gate(
    State(circuit_breaker): State<Arc<CircuitBreaker>>,
    request: Request,
    next: Next,
) -> Response {
    if !circuit_breaker.allow() {
        warn!(
            client = %PipelineContext::client_key_of(&request),
            path = %request.uri().path(),
            failures = circuit_breaker.failure_count(),
            "Circuit breaker open, rejecting request"
        );
        return Rejection::CircuitOpen.into_response();
    }

    next.run(request).await
}
