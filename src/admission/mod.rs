//! Admission controls shared by every request: the per-client rate limiter and
//! the process-wide circuit breaker.

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use rate_limiter::{ClientRateLimiter, RateLimitError};
