//! HTTP listener with bounded graceful shutdown.
//!
//! `axum::serve` can stop accepting and wait for connections, but it cannot
//! give up on them. This accept loop drives `hyper-util`'s auto (HTTP/1 +
//! HTTP/2) connection builder directly so that shutdown is time-bounded:
//!
//! 1. stop accepting new connections
//! 2. ask every open connection to finish its in-flight requests and close
//! 3. wait at most the grace period
//! 4. abort whatever is still open
//!
//! # Connection Limit
//!
//! At most `max_connections` connections are served at once. Connections
//! accepted beyond that are closed immediately.
//!
//! # Timeouts
//!
//! - HTTP/1 request headers must arrive within `read_header_timeout`
//! - a connection with no request in flight for `idle_timeout` is closed

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::ConnectInfo;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Maximum concurrently served connections
    pub max_connections: usize,
    /// Bound on draining in-flight requests at shutdown
    pub grace_period: Duration,
    /// Time allowed for a client to send HTTP/1 request headers
    pub read_header_timeout: Duration,
    /// Time a connection may sit with no request in flight
    pub idle_timeout: Duration,
}

impl ServeOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_connections: config.max_connections,
            grace_period: config.shutdown_grace_period,
            read_header_timeout: config.read_header_timeout,
            idle_timeout: config.idle_timeout,
        }
    }
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Accept errors that only affect one connection attempt.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Log a failed `accept` and decide whether the listener can continue.
///
/// Returns the fatal error, or `None` if only this attempt was affected.
fn accept_failure(err: io::Error) -> Option<AppError> {
    if is_transient(&err) {
        debug!(error = %err, "Transient accept error, continuing");
        return None;
    }
    error!(error = %err, "Listener failed");
    Some(AppError::Listener(err))
}

/// Serve `router` on `listener` until `shutdown` is cancelled.
///
/// Returns once every connection has closed or been aborted.
///
/// # Errors
///
/// Returns `AppError::Listener` if accepting fails for a reason other than a
/// transient per-connection error. Open connections are still drained.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    options: ServeOptions,
    shutdown: CancellationToken,
) -> AppResult<()> {
    let mut builder = ConnBuilder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(options.read_header_timeout);

    let limit = Arc::new(Semaphore::new(options.max_connections));
    // Connections watch a child token so a fatal accept error can drain them
    // without cancelling the caller's token
    let drain = shutdown.child_token();
    let mut connections: JoinSet<()> = JoinSet::new();

    if let Ok(addr) = listener.local_addr() {
        info!(%addr, max_connections = options.max_connections, "Server listening");
    }

    let result = loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => {
                debug!("Listener received cancellation signal");
                break Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => match accept_failure(e) {
                        None => continue,
                        Some(fatal) => break Err(fatal),
                    },
                };

                let Ok(permit) = limit.clone().try_acquire_owned() else {
                    warn!(
                        %peer,
                        max_connections = options.max_connections,
                        "Connection limit reached, closing connection"
                    );
                    drop(stream);
                    continue;
                };

                let builder = builder.clone();
                let router = router.clone();
                let drain = drain.clone();
                let idle_timeout = options.idle_timeout;
                connections.spawn(async move {
                    serve_connection(builder, stream, peer, router, idle_timeout, drain).await;
                    drop(permit);
                });
            }
            // Reap finished connections so the set does not grow unbounded
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined
                    && e.is_panic()
                {
                    error!(error = %e, "Connection task panicked");
                }
            }
        }
    };

    // Stop accepting before draining
    drop(listener);
    drain.cancel();

    let open = connections.len();
    if open > 0 {
        info!(
            open_connections = open,
            grace_period = ?options.grace_period,
            "Waiting for in-flight requests to finish"
        );
    }

    let drained =
        tokio::time::timeout(options.grace_period, join_all(&mut connections)).await;
    if drained.is_err() {
        warn!(
            open_connections = connections.len(),
            "Grace period elapsed, forcing remaining connections closed"
        );
        connections.abort_all();
        join_all(&mut connections).await;
    }

    info!("Listener stopped");
    result
}

async fn join_all(connections: &mut JoinSet<()>) {
    while connections.join_next().await.is_some() {}
}

/// Request activity on one connection, for the idle timeout.
#[derive(Debug)]
struct ConnectionActivity {
    in_flight: AtomicUsize,
    last_active: Mutex<Instant>,
}

impl ConnectionActivity {
    fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            last_active: Mutex::new(Instant::now()),
        }
    }

    fn enter(self: &Arc<Self>) -> ActiveRequest {
        self.touch();
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        ActiveRequest(Arc::clone(self))
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// When the connection counts as idle, or `None` while a request is in
    /// flight.
    fn idle_deadline(&self, idle_timeout: Duration) -> Option<Instant> {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            return None;
        }
        Some(*self.last_active.lock() + idle_timeout)
    }
}

struct ActiveRequest(Arc<ConnectionActivity>);

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        // Stamp before leaving so an idle check never sees a stale time
        self.0.touch();
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Serve one connection, switching to graceful close once `drain` fires or
/// the connection has been idle for `idle_timeout`.
async fn serve_connection(
    builder: ConnBuilder<TokioExecutor>,
    stream: TcpStream,
    peer: SocketAddr,
    router: Router,
    idle_timeout: Duration,
    drain: CancellationToken,
) {
    let activity = Arc::new(ConnectionActivity::new());

    let requests = activity.clone();
    let service = service_fn(move |mut req: hyper::Request<Incoming>| {
        req.extensions_mut().insert(ConnectInfo(peer));
        let active = requests.enter();
        let response = router.clone().oneshot(req);
        async move {
            let response = response.await;
            drop(active);
            response
        }
    });

    let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let mut closing = false;
    let result = loop {
        let idle_at = activity
            .idle_deadline(idle_timeout)
            .unwrap_or_else(|| Instant::now() + idle_timeout);

        tokio::select! {
            result = conn.as_mut() => break result,
            () = drain.cancelled(), if !closing => {
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
            () = tokio::time::sleep_until(idle_at), if !closing => {
                if activity
                    .idle_deadline(idle_timeout)
                    .is_some_and(|at| at <= Instant::now())
                {
                    debug!(%peer, ?idle_timeout, "Closing idle connection");
                    closing = true;
                    conn.as_mut().graceful_shutdown();
                }
            }
        }
    };

    if let Err(e) = result {
        debug!(%peer, error = %e, "Connection closed with error");
    }
}
