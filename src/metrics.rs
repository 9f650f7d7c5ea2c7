//! In-process request metrics.
//!
//! Four lock-free counters shared by every request and read periodically by
//! the lifecycle's reporter task:
//!
//! - `request_count` - completed requests (including faulted ones)
//! - `error_count` - completed requests with status >= 400
//! - `active_requests` - requests currently inside the pipeline
//! - `cumulative_latency` - sum of per-request elapsed time
//!
//! Each counter is independently atomic. A [`MetricsSnapshot`] is therefore
//! not a cross-field transaction, which is fine for a diagnostics feed.
//!
//! # Usage
//!
//! ```rust,ignore
//! let metrics = Arc::new(RequestMetrics::new());
//!
//! let in_flight = metrics.on_request_start();
//! let response = handler(req).await;
//! in_flight.finish(response.status());
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use axum::http::StatusCode;
use tokio::time::Instant;

/// Shared request counters.
#[derive(Debug, Default)]
pub struct RequestMetrics {
    request_count: AtomicU64,
    error_count: AtomicU64,
    active_requests: AtomicI64,
    cumulative_latency_nanos: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub request_count: u64,
    pub error_count: u64,
    pub active_requests: i64,
    pub cumulative_latency: Duration,
}

impl MetricsSnapshot {
    /// Mean latency over completed requests, zero when none completed.
    pub fn average_latency(&self) -> Duration {
        match u32::try_from(self.request_count) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.cumulative_latency / n,
            Err(_) => Duration::from_nanos(
                u64::try_from(self.cumulative_latency.as_nanos() / u128::from(self.request_count))
                    .unwrap_or(u64::MAX),
            ),
        }
    }
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a request as entering the pipeline.
    ///
    /// The returned guard decrements the active-request gauge exactly once,
    /// either through [`InFlightRequest::finish`] or on drop.
    pub fn on_request_start(self: &Arc<Self>) -> InFlightRequest {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
        InFlightRequest {
            metrics: Arc::clone(self),
            started_at: Instant::now(),
            finished: false,
        }
    }

    /// Record a completed request and leave the active set.
    ///
    /// Prefer [`InFlightRequest::finish`], which pairs this with the matching
    /// `on_request_start`.
    pub fn on_request_end(&self, status: StatusCode, elapsed: Duration) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
        self.record_completion(status.as_u16() >= 400, elapsed);
    }

    /// Record a request that ended in a recovered panic.
    ///
    /// Does not touch the gauge: the panicking request's guard is dropped
    /// during unwinding and decrements it there.
    pub fn record_fault(&self, elapsed: Duration) {
        self.record_completion(true, elapsed);
    }

    fn record_completion(&self, is_error: bool, elapsed: Duration) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.cumulative_latency_nanos
            .fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn active_requests(&self) -> i64 {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            request_count: self.request_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            active_requests: self.active_requests.load(Ordering::Relaxed),
            cumulative_latency: Duration::from_nanos(
                self.cumulative_latency_nanos.load(Ordering::Relaxed),
            ),
        }
    }
}

/// Guard for one request inside the pipeline.
///
/// Dropping it without calling [`finish`](Self::finish) (client abort,
/// panic, forced close) only leaves the active set; the request is not
/// counted as completed.
#[must_use = "dropping the guard immediately ends the request"]
pub struct InFlightRequest {
    metrics: Arc<RequestMetrics>,
    started_at: Instant,
    finished: bool,
}

impl InFlightRequest {
    /// Record the final status and elapsed time, consuming the guard.
    pub fn finish(mut self, status: StatusCode) -> Duration {
        let elapsed = self.started_at.elapsed();
        self.finished = true;
        self.metrics.on_request_end(status, elapsed);
        elapsed
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

impl Drop for InFlightRequest {
    fn drop(&mut self) {
        if !self.finished {
            self.metrics.active_requests.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for InFlightRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightRequest")
            .field("started_at", &self.started_at)
            .field("finished", &self.finished)
            .finish()
    }
}
