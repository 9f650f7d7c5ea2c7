//! Access logging stage.
//!
//! Emits one line per request after the inner stages and the handler have
//! produced a response:
//!
//! ```text
//! [GET] /search?q=rust 203.0.113.7 200 1.204ms
//! ```
//!
//! Lines go to the `access` tracing target so they can be filtered separately
//! (e.g. `RUST_LOG=info,access=off`).

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use tokio::time::Instant;
use tracing::info;

use crate::context::PipelineContext;

/// Log method, path with query, client key, status and elapsed time.
pub async fn log_access(request: Request, next: Next) -> Response {
    let started_at = Instant::now();
    let method = request.method().clone();
    let path = match request.uri().query() {
        Some(query) => format!("{}?{}", request.uri().path(), query),
        None => request.uri().path().to_owned(),
    };
    let client_key = PipelineContext::client_key_of(&request);

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let elapsed = started_at.elapsed();
    info!(
        target: "access",
        %method,
        %path,
        client = %client_key,
        status,
        elapsed_ms = elapsed.as_secs_f64() * 1_000.0,
        "[{method}] {path} {client_key} {status} {elapsed:?}"
    );

    response
}
