//! Connection state machine for managing TCP connections.
//!
//! Each connection tracks which readiness it is waiting for and owns the
//! buffer holding the chunk currently being echoed.

use crate::runtime::buffer::EchoBuffer;
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

/// Readiness a connection is currently registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterestMode {
    /// Waiting for inbound bytes.
    ReadInterested,
    /// Holding an unfinished echo, waiting for send space.
    WriteInterested,
}

/// Result of trying to write back the pending chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    /// Every pending byte was written.
    Drained,
    /// The socket stopped accepting bytes; the rest stays buffered.
    Blocked,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    pub stream: S,
    pub peer: Option<SocketAddr>,
    interest: InterestMode,
    buffer: EchoBuffer,
}

impl<S> Connection<S> {
    /// Create a new connection in the read-interested state.
    pub fn new(stream: S, peer: Option<SocketAddr>, buffer_size: usize) -> Self {
        Self {
            stream,
            peer,
            interest: InterestMode::ReadInterested,
            buffer: EchoBuffer::new(buffer_size),
        }
    }

    pub fn interest(&self) -> InterestMode {
        self.interest
    }

    pub fn set_interest(&mut self, interest: InterestMode) {
        self.interest = interest;
    }

    pub fn buffer(&self) -> &EchoBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut EchoBuffer {
        &mut self.buffer
    }
}

impl<S: Read + Write> Connection<S> {
    /// Read one chunk (at most the buffer capacity) into the connection buffer.
    pub fn fill(&mut self) -> io::Result<usize> {
        let n = self.stream.read(self.buffer.read_target())?;
        self.buffer.commit(n);
        Ok(n)
    }

    /// Write as much of the pending chunk as the socket accepts.
    ///
    /// Would-block and interrupted writes are backpressure. A write that
    /// accepts zero bytes is reported as `WriteZero`.
    pub fn flush(&mut self) -> io::Result<FlushState> {
        while self.buffer.has_pending() {
            match self.stream.write(self.buffer.pending()) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.buffer.advance(n),
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    return Ok(FlushState::Blocked);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(FlushState::Drained)
    }
}

/// Registry of active connections using slab allocation.
///
/// The slot index is the connection id. Slots are only reused after the
/// previous occupant has been removed, which happens after it is
/// deregistered from the multiplexer.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
}

impl<S> ConnectionRegistry<S> {
    pub fn new() -> Self {
        Self {
            connections: Slab::new(),
        }
    }

    /// Id the next inserted connection will receive.
    pub fn next_id(&self) -> usize {
        self.connections.vacant_key()
    }

    /// Insert a new connection into the registry, returning its id.
    pub fn insert(&mut self, conn: Connection<S>) -> usize {
        self.connections.insert(conn)
    }

    #[cfg(test)]
    pub fn get(&self, id: usize) -> Option<&Connection<S>> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        self.connections.try_remove(id)
    }

    #[cfg(test)]
    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Connection<S>)> {
        self.connections.iter()
    }
}

impl<S> Default for ConnectionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
