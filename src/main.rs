use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use edgeguard::{Config, LogFormat, Orchestrator, utils};

#[tokio::main]
async fn main() -> ExitCode {
    // Configuration decides the log format, so load it before logging starts
    let config = Config::from_env();

    let (level, format) = match &config {
        Ok(config) => (config.log_level.as_str(), config.log_format),
        Err(_) => ("info", LogFormat::Text),
    };
    init_tracing(level, format);

    info!("Starting edgeguard v{}", env!("CARGO_PKG_VERSION"));

    let result = match config {
        Ok(config) => run(config).await,
        Err(e) => {
            error!("Configuration error: {e}");
            Err(e.exit_code())
        }
    };

    match result {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// An unparsable filter falls back to `info`.
fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.with_thread_ids(true).init(),
    }
}

/// Run the application, returning an exit code on error.
async fn run(config: Config) -> Result<(), exitcode::ExitCode> {
    info!(
        addr = %config.server_addr(),
        rate_limit_rps = config.rate_limit_rps,
        rate_limit_burst = config.rate_limit_burst,
        circuit_breaker_max_failures = config.circuit_breaker_max_failures,
        shutdown_grace_period = ?config.shutdown_grace_period,
        "Configuration loaded"
    );

    let orchestrator = Orchestrator::new(config).map_err(|e| {
        error!("Failed to initialize: {e}");
        e.exit_code()
    })?;

    orchestrator
        .bind_and_run(utils::shutdown_signal())
        .await
        .map_err(|e| {
            error!("Server error: {e}");
            e.exit_code()
        })?;

    info!("Server shutdown complete");
    Ok(())
}
