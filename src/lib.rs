//! # edgeguard
//!
//! Request-admission and lifecycle layer for an HTTP service:
//!
//! - **Admission**: per-client token-bucket rate limiting and a process-wide
//!   circuit breaker
//! - **Pipeline**: fault containment, metrics, access logs, security headers,
//!   cache policy, body-size ceiling, CORS
//! - **Lifecycle**: Starting → Running → Draining → Stopped, with one shared
//!   cancellation token and a grace-bounded shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Orchestrator (phases, background tasks, shutdown)          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Listener (hyper-util accept loop, connection cap, drain)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Pipeline (Fault → Observe → Log → Headers → Rate Limit     │
//! │            → Circuit → Cache → Body Limit → CORS)           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, not-found fallback)                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgeguard::{Config, Orchestrator, utils};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), edgeguard::AppError> {
//!     let config = Config::from_env()?;
//!     Orchestrator::new(config)?
//!         .bind_and_run(utils::shutdown_signal())
//!         .await
//! }
//! ```
//!
//! ## Rate Limiting
//!
//! ```bash
//! RATE_LIMIT_RPS=100 RATE_LIMIT_BURST=50 TRUSTED_PROXIES=10.0.0.0/8 cargo run
//! ```

pub mod admission;
pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod metrics;
pub mod middleware;
pub mod reporting;
pub mod routes;
pub mod server;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use config::{Config, LogFormat};
pub use error::{AppError, AppResult};
pub use lifecycle::{LifecyclePhase, Orchestrator};
pub use routes::{apply_pipeline, build_router};
pub use state::AppState;
