//! Shared application state.
//!
//! One instance is built by the lifecycle orchestrator and cloned into every
//! pipeline stage and handler. It holds the process-wide admission and
//! observability components:
//!
//! - **Rate limiter**: per-client token buckets (absent when disabled)
//! - **Circuit breaker**: global failure gate
//! - **Metrics**: request counters and the active-request gauge
//! - **Error reporter**: producer side of the internal error queue
//!
//! # Thread Safety
//!
//! All components are wrapped in `Arc` or are cheap cloneable handles, so a
//! clone per request costs a handful of reference-count bumps.

use std::sync::Arc;
use std::time::Instant;

use crate::admission::{CircuitBreaker, CircuitBreakerConfig, ClientRateLimiter};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::metrics::RequestMetrics;
use crate::middleware::ip::TrustedProxies;
use crate::reporting::{ErrorDrain, ErrorReporter};

/// Shared state for pipeline stages and handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Per-client limiter, `None` when `RATE_LIMIT_RPS=0`
    pub rate_limiter: Option<Arc<ClientRateLimiter>>,
    /// Process-wide circuit breaker
    pub circuit_breaker: Arc<CircuitBreaker>,
    /// Request counters
    pub metrics: Arc<RequestMetrics>,
    /// Producer side of the error queue
    pub errors: ErrorReporter,
    /// Networks whose forwarding headers are honoured
    pub trusted_proxies: Arc<TrustedProxies>,
    /// Timestamp when the state was built
    pub started_at: Instant,
}

impl AppState {
    /// Build the shared components from configuration.
    ///
    /// Returns the state together with the consumer side of the error queue,
    /// which the caller is expected to drain.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if the rate limiter rejects its quota.
    pub fn new(config: Config) -> AppResult<(Self, ErrorDrain)> {
        let rate_limiter = if config.rate_limiting_enabled() {
            let limiter = ClientRateLimiter::new(config.rate_limit_rps, config.rate_limit_burst)
                .map_err(|e| AppError::ConfigError(e.to_string()))?;
            Some(Arc::new(limiter))
        } else {
            None
        };

        let circuit_breaker = CircuitBreaker::new(CircuitBreakerConfig::new(
            config.circuit_breaker_max_failures,
            config.circuit_breaker_cooldown,
        ));

        let (errors, drain) = ErrorReporter::channel(config.error_queue_capacity);
        let trusted_proxies = TrustedProxies::new(&config.trusted_proxies);

        let state = Self {
            config: Arc::new(config),
            rate_limiter,
            circuit_breaker: Arc::new(circuit_breaker),
            metrics: Arc::new(RequestMetrics::new()),
            errors,
            trusted_proxies: Arc::new(trusted_proxies),
            started_at: Instant::now(),
        };

        Ok((state, drain))
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("rate_limiter", &self.rate_limiter)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("metrics", &self.metrics.snapshot())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::admission::CircuitState;

    #[test]
    fn test_state_from_default_config() {
        let (state, _drain) = AppState::new(Config::default()).unwrap();

        let limiter = state.rate_limiter.as_ref().unwrap();
        assert_eq!(limiter.rps(), 5);
        assert_eq!(limiter.burst(), 10);
        assert_eq!(state.circuit_breaker.state(), CircuitState::Closed);
        assert_eq!(state.circuit_breaker.config().max_failures, 5);
        assert!(state.trusted_proxies.is_enabled());
    }

    #[test]
    fn test_rate_limiting_disabled() {
        let config = Config {
            rate_limit_rps: 0,
            ..Config::default()
        };
        let (state, _drain) = AppState::new(config).unwrap();
        assert!(state.rate_limiter.is_none());
    }

    #[tokio::test]
    async fn test_error_reporter_feeds_drain() {
        let (state, mut drain) = AppState::new(Config::default()).unwrap();
        state.errors.clone().report("boom");
        assert_eq!(drain.recv().await.as_deref(), Some("boom"));
    }
}
