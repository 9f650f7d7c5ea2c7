//! Static security response headers.
//!
//! Every response leaving this stage carries the same seven headers,
//! overriding anything set further in.

use axum::Router;
use axum::http::{HeaderName, HeaderValue, header};
use tower_http::set_header::SetResponseHeaderLayer;

const PERMISSIONS_POLICY: HeaderName = HeaderName::from_static("permissions-policy");

const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; \
    style-src 'self' 'unsafe-inline' https://cdnjs.cloudflare.com; \
    script-src 'self' https://cdnjs.cloudflare.com; \
    connect-src 'self' https://formsubmit.co; \
    img-src 'self' data: https:; \
    font-src 'self' https://cdnjs.cloudflare.com; \
    frame-src 'none'; \
    object-src 'none'; \
    base-uri 'self'; \
    form-action 'self' https://formsubmit.co;";

/// Header names and values applied to every response.
pub const SECURITY_HEADERS: [(HeaderName, &str); 7] = [
    (header::X_FRAME_OPTIONS, "DENY"),
    (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
    (header::X_XSS_PROTECTION, "1; mode=block"),
    (header::REFERRER_POLICY, "strict-origin-when-cross-origin"),
    (
        PERMISSIONS_POLICY,
        "camera=(), microphone=(), geolocation=()",
    ),
    (
        header::STRICT_TRANSPORT_SECURITY,
        "max-age=31536000; includeSubDomains",
    ),
    (header::CONTENT_SECURITY_POLICY, CONTENT_SECURITY_POLICY),
];

/// Wrap `router` so every response gets [`SECURITY_HEADERS`].
pub fn apply<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    SECURITY_HEADERS
        .into_iter()
        .fold(router, |router, (name, value)| {
            router.layer(SetResponseHeaderLayer::overriding(
                name,
                HeaderValue::from_static(value),
            ))
        })
}
