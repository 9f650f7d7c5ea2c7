use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Application-wide fatal error types.
///
/// These never reach a client. They surface at the process boundary and are
/// mapped to an exit code by the binary.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Listener failed: {0}")]
    Listener(#[source] std::io::Error),

    #[error("Background task '{task}' failed: {reason}")]
    Task { task: &'static str, reason: String },

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// BSD sysexits code for this error.
    pub fn exit_code(&self) -> exitcode::ExitCode {
        match self {
            AppError::ConfigError(_) => exitcode::CONFIG,
            AppError::Bind { .. } => exitcode::UNAVAILABLE,
            AppError::Listener(_) => exitcode::IOERR,
            AppError::Task { .. } | AppError::Internal(_) => exitcode::SOFTWARE,
        }
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

/// Responses the pipeline produces on its own, before or instead of the
/// application handler.
///
/// Every variant renders as a JSON body of the form `{"error": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Per-client token bucket is empty.
    TooManyRequests {
        /// Seconds until the next token becomes available (at least 1).
        retry_after_secs: u64,
    },
    /// The circuit breaker is tripped.
    CircuitOpen,
    /// Declared `Content-Length` exceeds the configured ceiling.
    PayloadTooLarge { limit: u64 },
    /// A handler panicked.
    InternalFault,
}

/// Marker placed in response extensions for policy rejections.
///
/// The observability stage uses it to tell the breaker's own 503s apart from
/// genuine server failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionRejected;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<&'static str>,
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            Rejection::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            Rejection::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Rejection::InternalFault => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            Rejection::TooManyRequests { .. } => ErrorBody {
                error: "Too many requests".to_string(),
                retry_after: Some("1s"),
            },
            Rejection::CircuitOpen => ErrorBody {
                error: "Service temporarily unavailable".to_string(),
                retry_after: None,
            },
            Rejection::PayloadTooLarge { limit } => ErrorBody {
                error: format!("Request size exceeds maximum allowed size of {limit} bytes"),
                retry_after: None,
            },
            Rejection::InternalFault => ErrorBody {
                error: "Internal server error".to_string(),
                retry_after: None,
            },
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let mut response = (self.status(), Json(self.body())).into_response();

        match self {
            Rejection::TooManyRequests { retry_after_secs } => {
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
                response.extensions_mut().insert(AdmissionRejected);
            }
            Rejection::CircuitOpen | Rejection::PayloadTooLarge { .. } => {
                response.extensions_mut().insert(AdmissionRejected);
            }
            Rejection::InternalFault => {}
        }

        response
    }
}
