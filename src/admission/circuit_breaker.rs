//! Process-wide circuit breaker with cooldown-based self-healing.
//!
//! The breaker stops forwarding requests to application logic after repeated
//! server-class failures, and resumes once no failure has been recorded for a
//! cooldown period.
//!
//! # States
//!
//! ```text
//! ┌─────────┐   failures ≥ max_failures   ┌─────────┐
//! │ Closed  │ ──────────────────────────► │  Open   │
//! │ (allow) │                             │ (deny)  │
//! └─────────┘ ◄────────────────────────── └─────────┘
//!               allow() observes that
//!               cooldown has elapsed since
//!               the last failure: count := 0
//! ```
//!
//! There is no half-open probing: the first request to observe the expired
//! cooldown resets the count and is treated as fully trusted.
//!
//! # Concurrency
//!
//! The failure count is an atomic so the closed-state fast path of
//! [`CircuitBreaker::allow`] is a single load. The last-failure timestamp and
//! every read-modify-write of the count (increment, compare-and-reset) are
//! serialized by one mutex.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Below the failure threshold; all requests pass.
    Closed,
    /// At or above the threshold; requests are rejected until cooldown.
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures at which the circuit trips.
    pub max_failures: u32,
    /// Quiet period after the last failure before the circuit resets.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(max_failures: u32, cooldown: Duration) -> Self {
        Self {
            max_failures,
            cooldown,
        }
    }
}

/// Thread-safe, non-blocking circuit breaker shared by all requests.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    /// Failures since the last reset.
    failures: AtomicU32,
    /// When the most recent failure was recorded.
    last_failure: Mutex<Option<Instant>>,
    /// Total number of times the threshold was crossed (for diagnostics).
    times_tripped: AtomicU32,
    /// Total number of requests rejected while open (for diagnostics).
    requests_rejected: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            failures: AtomicU32::new(0),
            last_failure: Mutex::new(None),
            times_tripped: AtomicU32::new(0),
            requests_rejected: AtomicU64::new(0),
        }
    }

    /// Check if a request should be allowed through.
    ///
    /// - **Closed**: always `true`
    /// - **Open**: `false` until more than `cooldown` has passed since the
    ///   last failure; the first call after that resets the count to zero
    ///   and returns `true`
    pub fn allow(&self) -> bool {
        if self.failures.load(Ordering::Acquire) < self.config.max_failures {
            return true;
        }

        let last_failure = self.last_failure.lock();

        // Re-check in case another request already reset the count
        if self.failures.load(Ordering::Acquire) < self.config.max_failures {
            return true;
        }

        let cooled_down = last_failure.is_none_or(|at| at.elapsed() > self.config.cooldown);
        if cooled_down {
            self.failures.store(0, Ordering::Release);
            info!(
                cooldown = ?self.config.cooldown,
                "Circuit breaker cooldown elapsed, resetting failure count"
            );
            return true;
        }

        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Record a server-class failure.
    ///
    /// Always increments the count and stamps the failure time, whatever the
    /// current state. While open this extends the cooldown.
    pub fn record_failure(&self) {
        let mut last_failure = self.last_failure.lock();
        let failures = self
            .failures
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        *last_failure = Some(Instant::now());

        if failures == self.config.max_failures {
            self.times_tripped.fetch_add(1, Ordering::Relaxed);
            warn!(
                failures,
                cooldown = ?self.config.cooldown,
                "Circuit breaker tripped due to repeated server errors"
            );
        } else {
            debug!(
                failures,
                threshold = self.config.max_failures,
                "Circuit breaker recorded failure"
            );
        }
    }

    /// Failures since the last reset.
    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Current state as seen by the count alone.
    ///
    /// An open circuit whose cooldown has expired still reports `Open` until
    /// the next [`allow`](Self::allow) call resets it.
    pub fn state(&self) -> CircuitState {
        if self.failure_count() >= self.config.max_failures {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    /// Get the number of times the circuit has tripped.
    pub fn times_tripped(&self) -> u32 {
        self.times_tripped.load(Ordering::Relaxed)
    }

    /// Get the number of requests rejected due to open circuit.
    pub fn requests_rejected(&self) -> u64 {
        self.requests_rejected.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("failures", &self.failure_count())
            .field("max_failures", &self.config.max_failures)
            .field("cooldown", &self.config.cooldown)
            .finish()
    }
}
