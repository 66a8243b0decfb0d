//! Event Matrix worker binary.
//!
//! Usage:
//!     matrix-worker --config worker.yaml

use clap::Parser;
use matrix_protocol::WorkerServerConfig;
use matrix_worker::{WorkerArgs, WorkerServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = WorkerArgs::parse();

    matrix_logging::init_logging(matrix_logging::LogConfig {
        app_name: "matrix-worker",
        verbose: args.verbose,
    })?;

    let mut config = match &args.config {
        Some(path) => WorkerServerConfig::load(path)?,
        None => WorkerServerConfig::default(),
    };
    config.apply_defaults();
    if config.server_id.is_empty() {
        config.server_id = matrix_worker::env::get_env_or("MATRIX_SERVER_ID", "worker-1");
    }

    tracing::info!("Starting Event Matrix worker");
    tracing::info!("  Server id: {}", config.server_id);
    tracing::info!("  Intranet: {}", config.intranet_addr());
    tracing::info!("  Public: {}", config.public_addr());
    tracing::info!("  Gateway: {}", config.gateway_intranet_endpoint);

    let server = WorkerServer::start(config).await?;
    server.run_until_ctrl_c().await?;

    Ok(())
}
