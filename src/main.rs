//! edge-echo: a single-threaded TCP echo server.
//!
//! Features:
//! - Edge-triggered readiness (epoll on Linux, kqueue on macOS)
//! - Per-connection backlogs for clients that read slower than they write
//! - Optional backlog cap that resets runaway connections
//! - Configuration via CLI arguments or TOML file

use edge_echo::config::Config;
use edge_echo::runtime;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Fatal: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        port = config.port,
        max_events = config.max_events,
        buffer_size = config.buffer_size,
        "Starting edge-echo server"
    );

    match runtime::run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Reactor stopped");
            eprintln!("Fatal: {e}");
            ExitCode::FAILURE
        }
    }
}
