//! Echo handler: the read and write paths of a connection.
//!
//! Both paths only touch the connection itself and report what the event
//! loop must do with the registration afterwards. That keeps the
//! backpressure state machine testable without a real socket:
//!
//! ```text
//!              read chunk, echo drained
//!                  ┌──────────┐
//!                  ▼          │
//!          ┌────────────────┐ │  echo blocked   ┌─────────────────┐
//!  accept ─▶ ReadInterested ├─┴────────────────▶ WriteInterested │◀─┐
//!          └───────┬────────┘                   └───┬─────────┬───┘  │ still blocked
//!                  ▲          echo drained          │         └──────┘
//!                  └────────────────────────────────┘
//! ```
//!
//! Peer close, read errors and fatal write errors end in `Close` from
//! either state.

use crate::runtime::connection::{Connection, FlushState, InterestMode};
use std::io::{self, Read, Write};
use tracing::trace;

/// What the event loop must do after a handler ran.
#[derive(Debug)]
pub enum Outcome {
    /// Registration stays as it is.
    Keep,
    /// Switch the registration to writable.
    WantWrite,
    /// Switch the registration back to readable.
    Resume,
    /// Read budget used up; the socket may still hold data and must be
    /// served again without waiting for new readiness.
    Yield,
    /// Deregister and close the connection.
    Close(CloseReason),
}

/// Why a connection was closed.
#[derive(Debug)]
pub enum CloseReason {
    /// Orderly shutdown from the peer (read returned 0).
    PeerClosed,
    ReadFailed(io::Error),
    WriteFailed(io::Error),
    /// The multiplexer refused an interest change.
    InterestChangeFailed(io::Error),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::ReadFailed(e) => write!(f, "read failed: {e}"),
            CloseReason::WriteFailed(e) => write!(f, "write failed: {e}"),
            CloseReason::InterestChangeFailed(e) => write!(f, "interest change failed: {e}"),
        }
    }
}

/// Read path.
///
/// Reads chunks of at most the buffer capacity and echoes each one back
/// before reading the next, until the socket has nothing more to give or
/// `max_chunks` chunks have been echoed. A connection that is waiting to
/// finish a deferred echo is left alone.
pub fn on_readable<S: Read + Write>(conn: &mut Connection<S>, max_chunks: usize) -> Outcome {
    if conn.interest() != InterestMode::ReadInterested {
        return Outcome::Keep;
    }

    let mut chunks = 0;
    loop {
        if chunks == max_chunks {
            return Outcome::Yield;
        }
        match conn.fill() {
            Ok(0) => return Outcome::Close(CloseReason::PeerClosed),
            Ok(n) => {
                trace!(bytes = n, "read chunk");
                match conn.flush() {
                    Ok(FlushState::Drained) => {
                        conn.buffer_mut().clear();
                        chunks += 1;
                    }
                    Ok(FlushState::Blocked) => {
                        trace!(
                            pending = conn.buffer().pending().len(),
                            "echo blocked, waiting for writable"
                        );
                        conn.set_interest(InterestMode::WriteInterested);
                        return Outcome::WantWrite;
                    }
                    Err(e) => return Outcome::Close(CloseReason::WriteFailed(e)),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Outcome::Keep,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Outcome::Close(CloseReason::ReadFailed(e)),
        }
    }
}

/// Write path.
///
/// Retries the deferred echo. Once it drains the buffer is cleared and the
/// connection goes back to waiting for reads.
pub fn on_writable<S: Read + Write>(conn: &mut Connection<S>) -> Outcome {
    if conn.interest() != InterestMode::WriteInterested {
        return Outcome::Keep;
    }

    match conn.flush() {
        Ok(FlushState::Drained) => {
            conn.set_interest(InterestMode::ReadInterested);
            conn.buffer_mut().clear();
            Outcome::Resume
        }
        Ok(FlushState::Blocked) => Outcome::Keep,
        Err(e) => Outcome::Close(CloseReason::WriteFailed(e)),
    }
}
