//! hgs2hpc: a warm coordinate conversion server
//!
//! Local clients connect to a Unix socket and send
//! `<lat> <lon> <obstime>` lines; each is answered with the helioprojective
//! `<x>, <y>` pair, or a fixed sentinel when it cannot be converted.
//!
//! Features:
//! - One isolated session per connection, each with its own warm transformer
//! - Stale socket detection and removal of the socket file on exit
//! - Configuration via CLI arguments or TOML file

mod config;
mod endpoint;
mod protocol;
mod server;
mod session;
mod transformer;

use config::Config;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// How long in-flight sessions get to finish once the server stops.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        socket = %config.socket.display(),
        mode = %format!("{:#o}", config.mode),
        backlog = config.backlog,
        transformer = %config.transformer_command,
        workers = ?config.workers,
        "Starting hgs2hpc server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers.filter(|&n| n > 0) {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    let result = runtime.block_on(server::run(config));
    runtime.shutdown_timeout(SHUTDOWN_GRACE);

    result?;
    Ok(())
}
