//! Path-dependent `Cache-Control` header.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderValue, header};
use axum::middleware::Next;
use axum::response::Response;

pub const STATIC_ASSET_CACHE: &str = "public, max-age=31536000";
pub const NO_STORE: &str = "no-store, must-revalidate";

/// Long-lived caching under the static prefix, no caching anywhere else.
///
/// The state is the static path prefix (e.g. `/static/`).
pub async fn cache_control(
    State(static_prefix): State<Arc<str>>,
    request: Request,
    next: Next,
) -> Response {
    let directive = if request.uri().path().starts_with(&*static_prefix) {
        STATIC_ASSET_CACHE
    } else {
        NO_STORE
    };

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static(directive));
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::http::Method;
    use axum::middleware::from_fn_with_state;
    use axum::routing::{get, post};
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/static/app.css", get(|| async { "body {}" }))
            .route("/contact", post(|| async { "sent" }))
            .layer(from_fn_with_state(Arc::<str>::from("/static/"), cache_control))
    }

    async fn cache_header(method: Method, uri: &str) -> String {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(req).await.unwrap();
        response.headers()[header::CACHE_CONTROL]
            .to_str()
            .unwrap()
            .to_owned()
    }

    #[tokio::test]
    async fn test_static_prefix_is_cached() {
        assert_eq!(cache_header(Method::GET, "/static/app.css").await, STATIC_ASSET_CACHE);
        // Missing assets under the prefix get the same directive
        assert_eq!(cache_header(Method::GET, "/static/gone.js").await, STATIC_ASSET_CACHE);
    }

    #[tokio::test]
    async fn test_other_paths_are_not_stored() {
        assert_eq!(cache_header(Method::POST, "/contact").await, NO_STORE);
        assert_eq!(cache_header(Method::GET, "/").await, NO_STORE);
        assert_eq!(cache_header(Method::GET, "/staticfoo").await, NO_STORE);
    }
}
