//! Readiness multiplexer over `mio::Poll`.
//!
//! Owns the OS notification context (epoll on Linux, kqueue on macOS) and
//! the fixed-capacity event storage. Each poll copies ready events into a
//! caller-owned batch so the caller can mutate its own state while walking
//! the batch.

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::time::Duration;

/// One entry of a poll batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub token: Token,
    /// Readable, read-closed or error.
    pub readable: bool,
    /// Writable, write-closed or error.
    pub writable: bool,
}

impl ReadyEvent {
    fn from_mio(event: &mio::event::Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable() || event.is_write_closed() || event.is_error(),
        }
    }
}

pub struct Multiplexer {
    poll: Poll,
    events: Events,
}

impl Multiplexer {
    /// Allocate the notification context.
    ///
    /// At most `max_batch` events are returned per poll; anything beyond
    /// that stays ready and is reported by a later poll.
    pub fn new(max_batch: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(max_batch),
        })
    }

    pub fn capacity(&self) -> usize {
        self.events.capacity()
    }

    /// Start watching `source`. Each source is registered exactly once.
    pub fn register<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().register(source, token, interest)
    }

    /// Replace the interest of an already registered source.
    pub fn modify<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().reregister(source, token, interest)
    }

    /// Stop watching `source`. Must happen before the socket is closed.
    pub fn deregister<S>(&self, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().deregister(source)
    }

    /// Wait for readiness and copy the ready events into `batch`.
    ///
    /// `None` blocks until something is ready. An interrupted wait is
    /// reported as zero events.
    pub fn poll(
        &mut self,
        batch: &mut Vec<ReadyEvent>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        batch.clear();

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        batch.extend(self.events.iter().map(ReadyEvent::from_mio));
        Ok(batch.len())
    }
}
