//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with defaults that
//! match a small public website. A `.env` file is honoured when present.
//!
//! # Admission Control
//!
//! - `RATE_LIMIT_RPS`: Steady-state requests per second per client (default: 5, 0 = off)
//! - `RATE_LIMIT_BURST`: Bucket capacity per client (default: 10)
//! - `CIRCUIT_BREAKER_MAX_FAILURES`: Server errors before tripping (default: 5)
//! - `CIRCUIT_BREAKER_COOLDOWN_SECS`: Time since last failure before reset (default: 30)
//! - `MAX_REQUEST_BODY_SIZE`: Declared body size ceiling in bytes (default: 1 MiB)
//!
//! # Lifecycle
//!
//! - `SHUTDOWN_GRACE_PERIOD_SECS`: In-flight drain bound (default: 10)
//! - `IDLE_TIMEOUT_SECS`: Keep-alive connection idle limit (default: 120)
//! - `METRICS_REPORT_INTERVAL_SECS`: Periodic metrics log line (default: 10)

use std::env;
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Log output formats understood by the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}' (expected text or json)")),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 8080)
    pub port: u16,

    /// Maximum number of concurrently open connections (default: 1000)
    pub max_connections: usize,

    /// Time allowed for a client to send request headers (default: 5s)
    pub read_header_timeout: Duration,

    /// Close connections with no request in flight after this long (default: 120s)
    pub idle_timeout: Duration,

    /// Bounded wait for in-flight requests during shutdown (default: 10s)
    pub shutdown_grace_period: Duration,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Requests per second per client key (default: 5)
    /// Set to 0 to disable rate limiting
    pub rate_limit_rps: u32,

    /// Burst capacity per client key (default: 10)
    pub rate_limit_burst: u32,

    /// How often fully replenished buckets are evicted (default: 60s, 0 = never)
    pub rate_limit_sweep_interval: Duration,

    /// Trusted proxy CIDR ranges. Forwarding headers are only honoured when the
    /// connection comes from one of these networks.
    ///
    /// Format: Comma-separated CIDR notation (e.g., "10.0.0.0/8,127.0.0.1")
    /// Default: "127.0.0.1"
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Circuit Breaker Configuration
    // =========================================================================
    /// Number of server-class failures before the circuit trips (default: 5)
    pub circuit_breaker_max_failures: u32,

    /// Time since the last failure before a tripped circuit resets (default: 30s)
    pub circuit_breaker_cooldown: Duration,

    // =========================================================================
    // Request Limits Configuration
    // =========================================================================
    /// Maximum declared request body size in bytes (default: 1 MiB)
    pub max_request_body_size: u64,

    /// Paths under this prefix get a long-lived cache directive (default: "/static/")
    pub static_path_prefix: String,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level filter (e.g., "info", "debug", "edgeguard=trace")
    pub log_level: String,

    /// Log output format (default: text)
    pub log_format: LogFormat,

    /// Interval of the periodic metrics log line (default: 10s)
    pub metrics_report_interval: Duration,

    /// Capacity of the internal error-reporting queue (default: 100)
    pub error_queue_capacity: usize,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any value fails to parse or the
    /// resulting configuration is inconsistent.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let defaults = Self::default();

        let config = Self {
            // Server
            host: env::var("HOST")
                .ok()
                .filter(|h| !h.trim().is_empty())
                .unwrap_or(defaults.host),
            port: Self::parse_env("PORT", defaults.port)?,
            max_connections: Self::parse_env("MAX_CONNECTIONS", defaults.max_connections)?,
            read_header_timeout: Duration::from_secs(Self::parse_env(
                "READ_HEADER_TIMEOUT_SECS",
                defaults.read_header_timeout.as_secs(),
            )?),
            idle_timeout: Duration::from_secs(Self::parse_env(
                "IDLE_TIMEOUT_SECS",
                defaults.idle_timeout.as_secs(),
            )?),
            shutdown_grace_period: Duration::from_secs(Self::parse_env(
                "SHUTDOWN_GRACE_PERIOD_SECS",
                defaults.shutdown_grace_period.as_secs(),
            )?),

            // Rate limiting
            rate_limit_rps: Self::parse_env("RATE_LIMIT_RPS", defaults.rate_limit_rps)?,
            rate_limit_burst: Self::parse_env("RATE_LIMIT_BURST", defaults.rate_limit_burst)?,
            rate_limit_sweep_interval: Duration::from_secs(Self::parse_env(
                "RATE_LIMIT_SWEEP_INTERVAL_SECS",
                defaults.rate_limit_sweep_interval.as_secs(),
            )?),
            trusted_proxies: Self::parse_list("TRUSTED_PROXIES").unwrap_or(defaults.trusted_proxies),

            // Circuit breaker
            circuit_breaker_max_failures: Self::parse_env(
                "CIRCUIT_BREAKER_MAX_FAILURES",
                defaults.circuit_breaker_max_failures,
            )?,
            circuit_breaker_cooldown: Duration::from_secs(Self::parse_env(
                "CIRCUIT_BREAKER_COOLDOWN_SECS",
                defaults.circuit_breaker_cooldown.as_secs(),
            )?),

            // Request limits
            max_request_body_size: Self::parse_env(
                "MAX_REQUEST_BODY_SIZE",
                defaults.max_request_body_size,
            )?,
            static_path_prefix: env::var("STATIC_PATH_PREFIX")
                .ok()
                .filter(|p| !p.is_empty())
                .unwrap_or(defaults.static_path_prefix),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: Self::parse_env("LOG_FORMAT", defaults.log_format)?,
            metrics_report_interval: Duration::from_secs(Self::parse_env(
                "METRICS_REPORT_INTERVAL_SECS",
                defaults.metrics_report_interval.as_secs(),
            )?),
            error_queue_capacity: Self::parse_env(
                "ERROR_QUEUE_CAPACITY",
                defaults.error_queue_capacity,
            )?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        if self.max_connections == 0 {
            return Err(AppError::ConfigError(
                "MAX_CONNECTIONS must be greater than 0".to_string(),
            ));
        }

        if self.idle_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "IDLE_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }

        if self.shutdown_grace_period.is_zero() {
            return Err(AppError::ConfigError(
                "SHUTDOWN_GRACE_PERIOD_SECS must be greater than 0".to_string(),
            ));
        }

        if self.rate_limiting_enabled() && self.rate_limit_burst == 0 {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_BURST must be greater than 0 when rate limiting is enabled"
                    .to_string(),
            ));
        }

        if self.circuit_breaker_max_failures == 0 {
            return Err(AppError::ConfigError(
                "CIRCUIT_BREAKER_MAX_FAILURES must be greater than 0".to_string(),
            ));
        }

        if self.max_request_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.metrics_report_interval.is_zero() {
            return Err(AppError::ConfigError(
                "METRICS_REPORT_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }

        if self.error_queue_capacity == 0 {
            return Err(AppError::ConfigError(
                "ERROR_QUEUE_CAPACITY must be greater than 0".to_string(),
            ));
        }

        if !self.static_path_prefix.starts_with('/') {
            return Err(AppError::ConfigError(format!(
                "STATIC_PATH_PREFIX must start with '/' (got {:?})",
                self.static_path_prefix
            )));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if rate limiting is enabled.
    pub fn rate_limiting_enabled(&self) -> bool {
        self.rate_limit_rps > 0
    }

    /// Check if idle bucket eviction is enabled.
    pub fn limiter_sweep_enabled(&self) -> bool {
        self.rate_limiting_enabled() && !self.rate_limit_sweep_interval.is_zero()
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            // An empty value counts as unset
            Ok(val) if !val.trim().is_empty() => val
                .trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            _ => Ok(default),
        }
    }

    /// Parse a comma-separated list. Returns `None` when the variable is unset
    /// so the caller can fall back to its default; an empty value yields an
    /// empty list.
    fn parse_list(name: &str) -> Option<Vec<String>> {
        env::var(name).ok().map(|s| {
            s.split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        })
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 1000,
            read_header_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(120),
            shutdown_grace_period: Duration::from_secs(10),
            // Rate limiting
            rate_limit_rps: 5,
            rate_limit_burst: 10,
            rate_limit_sweep_interval: Duration::from_secs(60),
            trusted_proxies: vec!["127.0.0.1".to_string()],
            // Circuit breaker
            circuit_breaker_max_failures: 5,
            circuit_breaker_cooldown: Duration::from_secs(30),
            // Request limits
            max_request_body_size: 1 << 20,
            static_path_prefix: "/static/".to_string(),
            // Observability
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            metrics_report_interval: Duration::from_secs(10),
            error_queue_capacity: 100,
        }
    }
}
