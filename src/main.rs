//! ready-echo: a single-threaded, readiness-driven TCP echo server
//!
//! Every byte a client sends is written back verbatim on the same
//! connection. One thread multiplexes all sockets through the OS readiness
//! facility (epoll on Linux, kqueue on macOS).
//!
//! Features:
//! - Per-connection echo buffers, so slow readers never corrupt each other
//! - Backpressure handling by switching a connection to write interest
//! - Configuration via CLI arguments or TOML file

mod config;
mod error;
mod runtime;

use config::Config;
use error::ServerError;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            let err = ServerError::from(e);
            eprintln!("{err}");
            return err.exit_code();
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
        addr = %config.socket_addr(),
        backlog = config.backlog,
        buffer_size = config.buffer_size,
        max_batch = config.max_batch,
        reads_per_event = config.reads_per_event,
        "Starting ready-echo server"
    );

    match runtime::run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server failed");
            e.exit_code()
        }
    }
}
