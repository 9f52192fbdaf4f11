//! Cadence server binary
//!
//! Loads configuration, restores state left by the previous run, starts the scheduler
//! and approval sweep loops and serves the HTTP API until interrupted.
//!
//! Usage:
//!   CADENCE_API_HOST=0.0.0.0 CADENCE_API_PORT=8001 ./cadence-server
//!
//! Environment variables:
//!   - CADENCE_CONFIG: YAML config file (default: <data root>/config.yaml if present)
//!   - CADENCE_DATA_ROOT: State directory (default: ~/.cadence)
//!   - CADENCE_API_HOST / CADENCE_API_PORT: Bind address (default: 127.0.0.1:8001)
//!   - CADENCE_LOG_FORMAT=json: JSON log lines on stderr
//!   - RUST_LOG: Log filter (default: info)

use std::process::ExitCode;

use cadence_lib::api;
use cadence_lib::config::ServerConfig;
use cadence_lib::services::Services;
use cadence_lib::utils::logging::{self, LogFormat};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init(LogFormat::from_env());

    let config = match ServerConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let services = match Services::init(config).await {
        Ok(services) => services,
        Err(e) => {
            error!(error = %e, "failed to initialize services");
            return ExitCode::FAILURE;
        }
    };
    services.spawn_background().await;

    let result = api::serve(services.clone(), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutdown requested");
    })
    .await;

    services.shutdown().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "HTTP server error");
            ExitCode::FAILURE
        }
    }
}
