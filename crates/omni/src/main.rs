//! Omni - database gateway process for the Omni Cloud backend.
//!
//! Loads named database configurations from the environment, checks each
//! one, then holds the pools and tunnels open until interrupted.

use omni_core::logging::{init_logging, LogConfig};
use omni_core::{EnvConfig, OmniState};

#[tokio::main]
async fn main() {
    // Logging first so configuration warnings are captured.
    let log_config = LogConfig::new(omni_core::logging::log_dir());
    let _logging_guard = init_logging(log_config);

    tracing::info!("Starting Omni");

    let config = EnvConfig::from_env();
    tracing::info!(
        registered = config.targets.len(),
        skipped = config.skipped.len(),
        "Configuration loaded"
    );

    let state = OmniState::from_env_config(&config);
    let results = state.check_all().await;
    let reachable = results.iter().filter(|(_, r)| r.is_ok()).count();
    tracing::info!(configs = results.len(), reachable, "Startup check complete");

    wait_for_shutdown().await;

    state.shutdown().await;
    tracing::info!("Omni stopped");
}

/// Resolve on Ctrl-C, or SIGTERM on Unix.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
