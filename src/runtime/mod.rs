//! Single-threaded readiness runtime for the echo server.
//!
//! - `reactor`: multiplexer wrapper and the event loop that dispatches
//!   accept, read and write handling
//! - `echo`: per-connection read/write state machine
//! - `connection`: connection records and the registry that owns them
//! - `buffer`: per-connection echo buffer
//! - `token`: connection id to multiplexer token mapping
//! - `socket`: listener creation

mod buffer;
mod connection;
mod echo;
mod reactor;
mod socket;
mod token;

pub use reactor::EventLoop;

use crate::config::Config;
use crate::error::ServerError;

/// Bind the listener and serve until a fatal error.
pub fn run(config: &Config) -> Result<(), ServerError> {
    let mut event_loop = EventLoop::bind(config)?;
    event_loop.run()
}
