//! Health check and not-found endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Liveness with circuit state and in-flight count
//! - fallback - 404 JSON for every unmatched path

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::instrument;

use crate::admission::CircuitState;
use crate::state::AppState;

/// Health check response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the process serves requests
    pub status: String,
    /// Current UTC time
    pub time: DateTime<Utc>,
    /// `"closed"` or `"open"`
    pub circuit: String,
    /// Requests currently inside the pipeline, this one included
    pub active_requests: i64,
}

/// Health check endpoint.
///
/// Always returns 200 OK. The request still passes the rate limiter and the
/// circuit gate like any other.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "ok",
///   "time": "2024-01-15T10:30:00Z",
///   "circuit": "closed",
///   "active_requests": 1
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let circuit: CircuitState = state.circuit_breaker.state();

    Json(HealthResponse {
        status: "ok".to_string(),
        time: Utc::now(),
        circuit: circuit.to_string(),
        active_requests: state.metrics.active_requests(),
    })
}

/// Fallback for unmatched paths.
pub async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" })))
}
