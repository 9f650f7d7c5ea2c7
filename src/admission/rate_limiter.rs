//! Per-client token bucket admission filter.
//!
//! # Algorithm
//!
//! Uses the Governor crate's keyed Generic Cell Rate Algorithm (GCRA), which
//! is a continuous-refill token bucket: a key with rate `R` and burst `B`
//! holds at most `B` tokens and regains one token every `1/R` seconds, with no
//! discrete ticks.
//!
//! - Buckets are created on first observation of a key.
//! - The store is a sharded `DashMap`; creation is an atomic get-or-insert, so
//!   two concurrent first requests for the same key share one bucket.
//! - `allow` never blocks or waits for a token.
//!
//! # Idle Keys
//!
//! Without eviction the store grows by one entry per distinct client key.
//! [`ClientRateLimiter::sweep_idle`] drops buckets that have fully refilled,
//! since such a bucket is indistinguishable from a freshly created one. The
//! lifecycle orchestrator calls it periodically.

use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use tracing::debug;

use crate::context::ClientKey;

/// Error type for rate limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    /// RPS value cannot be zero.
    ZeroRps,
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::ZeroRps => {
                write!(
                    f,
                    "RPS must be greater than 0; disable rate limiting instead"
                )
            }
        }
    }
}

impl std::error::Error for RateLimitError {}

type KeyedLimiter<C> = RateLimiter<
    ClientKey,
    DefaultKeyedStateStore<ClientKey>,
    C,
    NoOpMiddleware<<C as Clock>::Instant>,
>;

/// Keyed token-bucket limiter shared by every request.
///
/// Generic over the clock so tests can drive time by hand with
/// `governor::clock::FakeRelativeClock`.
pub struct ClientRateLimiter<C = DefaultClock>
where
    C: Clock,
{
    limiter: KeyedLimiter<C>,
    clock: C,
    rps: u32,
    burst: u32,
}

impl ClientRateLimiter {
    /// Create a limiter on the real monotonic clock.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError::ZeroRps` if `rps` is 0.
    pub fn new(rps: u32, burst: u32) -> Result<Self, RateLimitError> {
        Self::with_clock(rps, burst, DefaultClock::default())
    }
}

impl<C> ClientRateLimiter<C>
where
    C: Clock + Clone,
{
    /// Create a limiter reading time from `clock`.
    ///
    /// A zero `burst` is clamped to 1 so that a key can ever be admitted.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError::ZeroRps` if `rps` is 0.
    pub fn with_clock(rps: u32, burst: u32, clock: C) -> Result<Self, RateLimitError> {
        let rps_nonzero = NonZeroU32::new(rps).ok_or(RateLimitError::ZeroRps)?;
        let burst_nonzero = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);

        // Burst capacity refilled continuously at `rps` per second
        let quota = Quota::per_second(rps_nonzero).allow_burst(burst_nonzero);
        let limiter = RateLimiter::new(
            quota,
            DefaultKeyedStateStore::<ClientKey>::default(),
            clock.clone(),
        );

        Ok(Self {
            limiter,
            clock,
            rps,
            burst: burst_nonzero.get(),
        })
    }

    /// Consume one token for `key` if available.
    pub fn allow(&self, key: &ClientKey) -> bool {
        self.check(key).is_ok()
    }

    /// Like [`allow`](Self::allow), but on denial returns how long until the
    /// next token for `key` becomes available.
    pub fn check(&self, key: &ClientKey) -> Result<(), Duration> {
        self.limiter
            .check_key(key)
            .map(|_| ())
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }

    /// Number of client keys currently holding a bucket.
    pub fn tracked_keys(&self) -> usize {
        self.limiter.len()
    }

    /// Evict buckets that have fully refilled and release the freed memory.
    ///
    /// Returns the number of evicted keys.
    pub fn sweep_idle(&self) -> usize {
        let before = self.limiter.len();
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        let after = self.limiter.len();
        let evicted = before.saturating_sub(after);

        debug!(evicted, remaining = after, "Rate limiter sweep complete");
        evicted
    }

    /// Configured steady-state rate.
    pub fn rps(&self) -> u32 {
        self.rps
    }

    /// Effective bucket capacity.
    pub fn burst(&self) -> u32 {
        self.burst
    }
}

impl<C> fmt::Debug for ClientRateLimiter<C>
where
    C: Clock + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRateLimiter")
            .field("rps", &self.rps)
            .field("burst", &self.burst)
            .field("tracked_keys", &self.tracked_keys())
            .finish()
    }
}
