//! Process lifecycle orchestration.
//!
//! # Phases
//!
//! ```text
//! Starting ──► Running ──► Draining ──► Stopped
//! ```
//!
//! On entering `Running` the orchestrator starts, under one shared
//! `CancellationToken`:
//!
//! - the HTTP listener serving the request pipeline
//! - a periodic metrics reporter
//! - the error-queue drain
//! - the idle rate-limit bucket sweeper (when enabled)
//!
//! `Draining` begins on whichever comes first: the external stop signal, a
//! background task failing or panicking, or the listener ending on its own.
//! The token is cancelled, then the listener drains connections and the
//! background tasks exit, both inside one grace-period budget.
//!
//! # Structured Concurrency
//!
//! Background tasks are spawned on a `tokio_util::task::TaskTracker`; a
//! supervising task per background task turns an unrecoverable failure into
//! cancellation of the shared token.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use governor::clock::Clock;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval, timeout_at};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::admission::ClientRateLimiter;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::metrics::RequestMetrics;
use crate::reporting::ErrorDrain;
use crate::routes::build_router;
use crate::server::{ServeOptions, serve};
use crate::state::AppState;

/// Process lifetime phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecyclePhase::Starting => write!(f, "starting"),
            LifecyclePhase::Running => write!(f, "running"),
            LifecyclePhase::Draining => write!(f, "draining"),
            LifecyclePhase::Stopped => write!(f, "stopped"),
        }
    }
}

/// Owns the shared components and drives the process through its phases.
///
/// # Example
///
/// ```rust,ignore
/// let orchestrator = Orchestrator::new(Config::from_env()?)?;
/// orchestrator.bind_and_run(utils::shutdown_signal()).await?;
/// ```
pub struct Orchestrator {
    state: AppState,
    drain: ErrorDrain,
    phase: watch::Sender<LifecyclePhase>,
}

impl Orchestrator {
    /// Validate `config` and build the shared components.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if the configuration is invalid.
    pub fn new(config: Config) -> AppResult<Self> {
        config.validate()?;
        let (state, drain) = AppState::new(config)?;
        let (phase, _) = watch::channel(LifecyclePhase::Starting);

        Ok(Self {
            state,
            drain,
            phase,
        })
    }

    /// Shared components, for building custom routers with
    /// [`crate::routes::apply_pipeline`].
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Subscribe to phase changes.
    pub fn phase(&self) -> watch::Receiver<LifecyclePhase> {
        self.phase.subscribe()
    }

    /// Bind `HOST:PORT` and run until `stop` resolves.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Bind` if the address cannot be bound, otherwise
    /// whatever [`run`](Self::run) returns.
    pub async fn bind_and_run<F>(self, stop: F) -> AppResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = self.state.config.server_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| AppError::Bind { addr, source })?;

        self.run(listener, stop).await
    }

    /// Serve the default routes on `listener` until `stop` resolves.
    pub async fn run<F>(self, listener: TcpListener, stop: F) -> AppResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        let router = build_router(self.state.clone());
        self.run_router(listener, router, stop).await
    }

    /// Serve `router` on `listener` until `stop` resolves.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Listener` if the listener failed, or
    /// `AppError::Task` if the listener task itself panicked. Background task
    /// failures are logged and trigger shutdown but are not returned.
    pub async fn run_router<F>(self, listener: TcpListener, router: Router, stop: F) -> AppResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Orchestrator {
            state,
            drain,
            phase,
        } = self;
        let config = state.config.clone();
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();

        // =====================================================================
        // Running
        // =====================================================================
        phase.send_replace(LifecyclePhase::Running);
        info!("Lifecycle entering running phase");

        spawn_supervised(
            &tracker,
            &token,
            "metrics-reporter",
            report_metrics(
                state.metrics.clone(),
                config.metrics_report_interval,
                token.clone(),
            ),
        );
        spawn_supervised(
            &tracker,
            &token,
            "error-drain",
            drain_errors(drain, token.clone()),
        );
        if let Some(limiter) = &state.rate_limiter
            && config.limiter_sweep_enabled()
        {
            spawn_supervised(
                &tracker,
                &token,
                "limiter-sweeper",
                sweep_idle_buckets(
                    limiter.clone(),
                    config.rate_limit_sweep_interval,
                    token.clone(),
                ),
            );
        }

        let mut server = tokio::spawn(serve(
            listener,
            router,
            ServeOptions::from_config(&config),
            token.clone(),
        ));

        let stop = std::pin::pin!(stop);
        let finished_early = tokio::select! {
            () = stop => {
                info!("Stop signal received");
                None
            }
            () = token.cancelled() => {
                warn!("Background task failure, shutting down");
                None
            }
            joined = &mut server => Some(joined),
        };

        // =====================================================================
        // Draining
        // =====================================================================
        phase.send_replace(LifecyclePhase::Draining);
        info!(grace_period = ?config.shutdown_grace_period, "Lifecycle entering draining phase");
        // One budget for the whole drain: connections first, then tasks
        let deadline = Instant::now() + config.shutdown_grace_period;
        token.cancel();

        let joined = match finished_early {
            Some(joined) => joined,
            None => server.await,
        };
        let result = joined.unwrap_or_else(|e| {
            Err(AppError::Task {
                task: "listener",
                reason: e.to_string(),
            })
        });

        await_background_tasks(&tracker, deadline).await;

        // =====================================================================
        // Stopped
        // =====================================================================
        phase.send_replace(LifecyclePhase::Stopped);
        match &result {
            Ok(()) => info!(uptime_secs = state.uptime_seconds(), "Lifecycle stopped"),
            Err(e) => error!(
                uptime_secs = state.uptime_seconds(),
                error = %e,
                "Lifecycle stopped with error"
            ),
        }
        result
    }
}

/// Wait for tracked tasks until `deadline`. Returns `false` if some were
/// still running when it passed; they are left detached.
async fn await_background_tasks(tracker: &TaskTracker, deadline: Instant) -> bool {
    tracker.close();
    if timeout_at(deadline, tracker.wait()).await.is_err() {
        warn!(
            remaining = tracker.len(),
            "Background tasks did not stop within the grace period"
        );
        return false;
    }
    true
}

/// Spawn `task` on `tracker`; a failure or panic cancels `token`.
fn spawn_supervised<F>(
    tracker: &TaskTracker,
    token: &CancellationToken,
    name: &'static str,
    task: F,
) where
    F: Future<Output = AppResult<()>> + Send + 'static,
{
    let handle = tracker.spawn(task);
    let token = token.clone();

    tracker.spawn(async move {
        match handle.await {
            Ok(Ok(())) => debug!(task = name, "Background task stopped"),
            Ok(Err(e)) => {
                error!(task = name, error = %e, "Background task failed");
                token.cancel();
            }
            Err(e) => {
                error!(task = name, error = %e, "Background task panicked");
                token.cancel();
            }
        }
    });
}

/// Log a metrics line every `period` until cancelled.
async fn report_metrics(
    metrics: Arc<RequestMetrics>,
    period: Duration,
    cancel: CancellationToken,
) -> AppResult<()> {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // Skip the first immediate tick

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot = metrics.snapshot();
                info!(
                    target: "metrics",
                    requests = snapshot.request_count,
                    errors = snapshot.error_count,
                    active = snapshot.active_requests,
                    avg_latency_ms = snapshot.average_latency().as_secs_f64() * 1_000.0,
                    "Metrics - Requests: {}, Errors: {}, Active: {}",
                    snapshot.request_count,
                    snapshot.error_count,
                    snapshot.active_requests
                );
            }
        }
    }

    Ok(())
}

/// Log each reported error until cancelled, then flush what is queued.
async fn drain_errors(mut drain: ErrorDrain, cancel: CancellationToken) -> AppResult<()> {
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,
            next = drain.recv() => match next {
                Some(message) => error!("Error: {message}"),
                None => {
                    return Err(AppError::Task {
                        task: "error-drain",
                        reason: "error queue closed".to_string(),
                    });
                }
            },
        }
    }

    drain.close();
    while let Some(message) = drain.try_recv() {
        error!("Error: {message}");
    }
    Ok(())
}

/// Evict replenished rate-limit buckets every `period` until cancelled.
async fn sweep_idle_buckets<C>(
    limiter: Arc<ClientRateLimiter<C>>,
    period: Duration,
    cancel: CancellationToken,
) -> AppResult<()>
where
    C: Clock + Clone,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = limiter.sweep_idle();
                if evicted > 0 {
                    debug!(evicted, tracked = limiter.tracked_keys(), "Evicted idle rate-limit buckets");
                }
            }
        }
    }

    Ok(())
}
