//! Request pipeline stages.
//!
//! Each stage is either a `tower::Layer` or an `axum::middleware::from_fn*`
//! function. [`crate::routes::apply_pipeline`] installs them in this order,
//! outermost first:
//!
//! ```text
//! Request
//!    │
//!    ▼
//!  1. fault             ← 500 on handler panic
//!  2. observe           ← client key, metrics, breaker feedback
//!  3. access_log        ← one line per request
//!  4. security_headers  ← static response headers
//!  5. rate_limit        ← 429 if the client's bucket is empty
//!  6. circuit           ← 503 while the breaker is open
//!  7. cache_control     ← path-dependent Cache-Control
//!  8. body_limit        ← 413 on oversized Content-Length
//!  9. cors              ← CORS headers, 204 for OPTIONS
//!    │
//!    ▼
//! Handler
//! ```
//!
//! Only stages 5 and 6 turn requests away by admission policy. Stages 1-3
//! see every outcome, including early rejections from further in.

pub mod access_log;
pub mod body_limit;
pub mod cache_control;
pub mod circuit;
pub mod cors;
pub mod fault;
pub mod ip;
pub mod observe;
pub mod rate_limit;
pub mod security_headers;

pub use fault::FaultBoundaryLayer;
pub use ip::{CidrRange, TrustedProxies, UNKNOWN_CLIENT, resolve_client_key};
pub use observe::ObserveLayer;
pub use rate_limit::RateLimitLayer;
