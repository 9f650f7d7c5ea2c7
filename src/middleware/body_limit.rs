//! Declared request size gate.
//!
//! Rejects with 413 when `Content-Length` exceeds the configured ceiling,
//! before any of the body is read. Bodies without a declared length (chunked)
//! pass this stage; `axum::extract::DefaultBodyLimit`, installed next to it,
//! bounds how much of them an extractor will buffer.

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::error::Rejection;

/// The state is the ceiling in bytes.
pub async fn limit_declared_size(State(limit): State<u64>, request: Request, next: Next) -> Response {
    let declared = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    if let Some(length) = declared
        && length > limit
    {
        debug!(length, limit, "Declared body size exceeds limit");
        return Rejection::PayloadTooLarge { limit }.into_response();
    }

    next.run(request).await
}
