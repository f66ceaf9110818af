//! Server error types.
//!
//! Only startup failures and a fatal poll failure ever leave the event loop.
//! Per-connection failures are resolved by closing that connection.

use crate::config::ConfigError;
use std::io;
use std::net::SocketAddr;
use std::process::ExitCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to create readiness multiplexer: {0}")]
    Multiplexer(#[source] io::Error),
    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Failed to register listener: {0}")]
    Register(#[source] io::Error),
    #[error("Readiness poll failed: {0}")]
    Poll(#[source] io::Error),
}

impl ServerError {
    /// Process exit status for this failure.
    ///
    /// Startup failures are kept distinct from configuration mistakes and
    /// from the loop dying after it started serving.
    pub fn exit_status(&self) -> u8 {
        match self {
            ServerError::Config(_) => 2,
            ServerError::Multiplexer(_) | ServerError::Bind { .. } | ServerError::Register(_) => 1,
            ServerError::Poll(_) => 3,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.exit_status())
    }
}
