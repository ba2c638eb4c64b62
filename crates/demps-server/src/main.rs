//! Server binary for live DEMPS runs.
//!
//! Wires configuration, logging and the HTTP API together and makes sure
//! no simulator outlives the server.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `demps-config.yaml` (or `DEMPS_CONFIG`)
//! 2. Initialize structured logging (tracing)
//! 3. Create the resource pool shared by every run
//! 4. Serve the HTTP API until Ctrl-C or SIGTERM
//! 5. Terminate the registered simulator and close every pooled resource

mod error;

use std::sync::Arc;

use demps_core::config::{LogFormat, LoggingConfig, ServiceConfig};
use demps_core::pool::{PROCESS_KEY, ResourcePool};
use demps_core::supervisor::ProcessSupervisor;
use demps_observer::{AppState, start_server};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::AppError;

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration, logging or the listener cannot be
/// set up, or if serving fails.
#[tokio::main]
async fn main() -> Result<(), AppError> {
    // 1. Load configuration.
    let config_path = ServiceConfig::default_path();
    let config = ServiceConfig::from_file(&config_path)?;

    // 2. Initialize structured logging.
    init_logging(&config.logging)?;
    info!("demps-server starting");
    info!(
        config = %config_path.display(),
        host = %config.server.host,
        port = config.server.port,
        directives = %config.simulator.directives.display(),
        executable = %config.simulator.executable.display(),
        kill_timeout_ms = config.simulator.kill_timeout_ms,
        use_polling = config.watcher.use_polling,
        "Configuration loaded"
    );

    // 3. Shared resource pool.
    let pool = Arc::new(ResourcePool::new());
    let state = Arc::new(AppState::with_pool(config.clone(), Arc::clone(&pool)));

    // 4. Serve until a shutdown signal; 5. tear the pool down before the
    //    server waits for open streams to end.
    let shutdown = {
        let pool = Arc::clone(&pool);
        async move {
            shutdown_signal().await;
            release_resources(&pool).await;
        }
    };
    start_server(&config.server, state, shutdown).await?;

    info!("demps-server stopped");
    Ok(())
}

fn init_logging(logging: &LoggingConfig) -> Result<(), AppError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .map_err(|e| AppError::Logging {
            message: format!("invalid log filter `{}`: {e}", logging.level),
        })?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let installed = match logging.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| AppError::Logging {
        message: e.to_string(),
    })
}

/// Kill the registered simulator, waiting for it to exit, then close
/// everything else in the pool.
async fn release_resources(pool: &ResourcePool) {
    if let Some(supervisor) = pool.pop::<ProcessSupervisor>(PROCESS_KEY) {
        info!(pid = ?supervisor.pid(), "Terminating simulator before shutdown");
        supervisor.kill().await;
    }
    let remaining = pool.keys();
    if !remaining.is_empty() {
        info!(resources = ?remaining, "Closing pooled resources");
    }
    pool.close_all();
}

/// Resolve on Ctrl-C, or on SIGTERM where available.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Ctrl-C received, shutting down"),
        () = terminate => info!("SIGTERM received, shutting down"),
    }
}
