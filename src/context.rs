//! Per-request pipeline context.
//!
//! The observability stage creates one [`PipelineContext`] per request and
//! stores it in the request extensions. Later stages (access log, rate
//! limiter) read the resolved [`ClientKey`] from there instead of resolving
//! it again.

use std::fmt;
use std::sync::Arc;

use axum::http::Request;
use tokio::time::Instant;

use crate::middleware::ip::UNKNOWN_CLIENT;

/// Identifier used to partition rate-limiting state per caller.
///
/// Cheap to clone: the key is shared, not copied, between the context, the
/// limiter's store and log lines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientKey(Arc<str>);

impl ClientKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    /// Shared key for requests whose origin cannot be determined.
    pub fn unknown() -> Self {
        Self::new(UNKNOWN_CLIENT)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ClientKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Transient per-request record. Never shared across requests.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    /// When the request entered the pipeline.
    pub started_at: Instant,
    /// Resolved caller identity.
    pub client_key: ClientKey,
}

impl PipelineContext {
    pub fn new(client_key: ClientKey) -> Self {
        Self {
            started_at: Instant::now(),
            client_key,
        }
    }

    /// Client key recorded for this request, or [`ClientKey::unknown`] when
    /// the request never passed through the observability stage.
    pub fn client_key_of<B>(req: &Request<B>) -> ClientKey {
        req.extensions()
            .get::<PipelineContext>()
            .map(|ctx| ctx.client_key.clone())
            .unwrap_or_else(ClientKey::unknown)
    }
}
