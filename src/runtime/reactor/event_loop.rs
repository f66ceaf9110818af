//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Everything runs on one thread. The poll is the only place the loop
//! blocks; every handler runs to completion before the next event of the
//! batch is looked at.
//!
//! mio registers sockets edge-triggered, so a handler that stops early
//! would never hear about the remaining readiness. The listener is drained
//! one accept at a time until it would block. The read path echoes at most
//! `reads_per_event` chunks; a connection that used up its budget, and a
//! listener whose accept failed, are remembered and served again by the
//! next `poll_once`, which then polls without blocking.

use super::multiplexer::{Multiplexer, ReadyEvent};
use crate::config::Config;
use crate::error::ServerError;
use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::echo::{self, CloseReason, Outcome};
use crate::runtime::socket;
use crate::runtime::token::{self, Source, LISTENER_TOKEN};
use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// The dispatcher: listener, multiplexer and every live connection.
pub struct EventLoop {
    multiplexer: Multiplexer,
    listener: TcpListener,
    connections: ConnectionRegistry<TcpStream>,
    batch: Vec<ReadyEvent>,
    /// Connections that hit the read budget with data possibly left.
    still_readable: Vec<usize>,
    /// Listener whose last accept failed with connections possibly queued.
    accept_retry: bool,
    buffer_size: usize,
    reads_per_event: usize,
}

impl EventLoop {
    /// Create the multiplexer, bind the listener and start watching it.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        let multiplexer = Multiplexer::new(config.max_batch).map_err(ServerError::Multiplexer)?;

        let addr = config.socket_addr();
        let listener = socket::create_listener(addr, config.backlog)
            .map_err(|source| ServerError::Bind { addr, source })?;
        let mut listener = TcpListener::from_std(listener);
        multiplexer
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(ServerError::Register)?;

        Ok(Self {
            multiplexer,
            listener,
            connections: ConnectionRegistry::new(),
            batch: Vec::with_capacity(config.max_batch),
            still_readable: Vec::new(),
            accept_retry: false,
            buffer_size: config.buffer_size,
            reads_per_event: config.reads_per_event,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[cfg(test)]
    pub fn connections(&self) -> &ConnectionRegistry<TcpStream> {
        &self.connections
    }

    /// Serve forever. Only a failing poll ends the loop.
    pub fn run(&mut self) -> Result<(), ServerError> {
        info!(
            addr = ?self.local_addr().ok(),
            max_batch = self.multiplexer.capacity(),
            buffer_size = self.buffer_size,
            reads_per_event = self.reads_per_event,
            "Event loop started"
        );

        loop {
            self.poll_once(None).map_err(ServerError::Poll)?;
        }
    }

    /// Run one poll and dispatch the resulting batch in delivery order,
    /// then serve whatever the previous round left unfinished.
    ///
    /// Returns the number of events taken from the multiplexer.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let still_readable = std::mem::take(&mut self.still_readable);
        let accept_retry = std::mem::replace(&mut self.accept_retry, false);
        let timeout = if still_readable.is_empty() && !accept_retry {
            timeout
        } else {
            Some(Duration::ZERO)
        };

        let count = self.multiplexer.poll(&mut self.batch, timeout)?;

        for i in 0..count {
            let event = self.batch[i];
            self.dispatch(event);
        }

        if accept_retry {
            self.accept_pending();
        }
        // A slot closed and refilled meanwhile just sees a would-block read
        for conn_id in still_readable {
            self.dispatch(ReadyEvent {
                token: token::conn_token(conn_id),
                readable: true,
                writable: false,
            });
        }

        Ok(count)
    }

    fn dispatch(&mut self, event: ReadyEvent) {
        let conn_id = match token::source(event.token) {
            Source::Listener => {
                self.accept_pending();
                return;
            }
            Source::Connection(conn_id) => conn_id,
        };

        // Read first, then write. Each outcome is applied before the next
        // handler runs.
        if event.readable {
            let Some(conn) = self.connections.get_mut(conn_id) else {
                return;
            };
            let outcome = echo::on_readable(conn, self.reads_per_event);
            self.apply(conn_id, outcome);
        }

        if event.writable {
            let Some(conn) = self.connections.get_mut(conn_id) else {
                return;
            };
            let outcome = echo::on_writable(conn);
            self.apply(conn_id, outcome);
        }
    }

    fn accept_pending(&mut self) {
        loop {
            match self.accept_one() {
                Ok(true) => {}
                Ok(false) => break,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    debug!(error = %e, "Transient accept failure");
                }
                Err(e) => {
                    self.accept_failed(e);
                    break;
                }
            }
        }
    }

    /// The listener stays registered and untouched; the backlog is retried
    /// on the next round since its readiness edge is already consumed.
    fn accept_failed(&mut self, error: io::Error) {
        warn!(error = %error, "Accept error");
        self.accept_retry = true;
    }

    /// Accept one pending connection and register it for reads.
    ///
    /// Returns `false` once nothing is left to accept.
    fn accept_one(&mut self) -> io::Result<bool> {
        // mio hands out accepted streams already in non-blocking mode
        let (mut stream, peer) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(e),
        };

        let conn_id = self.connections.next_id();
        if let Err(e) =
            self.multiplexer
                .register(&mut stream, token::conn_token(conn_id), Interest::READABLE)
        {
            warn!(peer = %peer, error = %e, "Failed to register connection");
            return Ok(true);
        }

        let inserted = self
            .connections
            .insert(Connection::new(stream, Some(peer), self.buffer_size));
        debug_assert_eq!(inserted, conn_id);

        debug!(conn_id, peer = %peer, "Accepted connection");
        Ok(true)
    }

    fn apply(&mut self, conn_id: usize, outcome: Outcome) {
        let interest = match outcome {
            Outcome::Keep => return,
            Outcome::WantWrite => Interest::WRITABLE,
            Outcome::Resume => Interest::READABLE,
            Outcome::Yield => {
                if !self.still_readable.contains(&conn_id) {
                    self.still_readable.push(conn_id);
                }
                return;
            }
            Outcome::Close(reason) => {
                self.close_connection(conn_id, reason);
                return;
            }
        };

        let Some(conn) = self.connections.get_mut(conn_id) else {
            return;
        };
        let result = self
            .multiplexer
            .modify(&mut conn.stream, token::conn_token(conn_id), interest);

        match result {
            Ok(()) => trace!(conn_id, ?interest, "Interest changed"),
            Err(e) => self.close_connection(conn_id, CloseReason::InterestChangeFailed(e)),
        }
    }

    /// Deregister, then drop (and so close) the connection.
    fn close_connection(&mut self, conn_id: usize, reason: CloseReason) {
        if let Some(mut conn) = self.connections.remove(conn_id) {
            if let Err(e) = self.multiplexer.deregister(&mut conn.stream) {
                debug!(conn_id, error = %e, "Deregister failed");
            }
            debug!(conn_id, peer = ?conn.peer, reason = %reason, "Connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::connection::InterestMode;
    use std::io::{Read, Write};
    use std::net::{IpAddr, Shutdown};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    const TICK: Duration = Duration::from_millis(5);

    fn test_loop(max_batch: usize, buffer_size: usize) -> EventLoop {
        budget_loop(max_batch, buffer_size, Config::default().reads_per_event)
    }

    fn budget_loop(max_batch: usize, buffer_size: usize, reads_per_event: usize) -> EventLoop {
        let config = Config {
            host: IpAddr::from([127, 0, 0, 1]),
            port: 0,
            max_batch,
            buffer_size,
            reads_per_event,
            ..Default::default()
        };
        EventLoop::bind(&config).unwrap()
    }

    fn connect(el: &EventLoop) -> std::net::TcpStream {
        std::net::TcpStream::connect(el.local_addr().unwrap()).unwrap()
    }

    fn pump_until(el: &mut EventLoop, cond: impl Fn(&EventLoop) -> bool) -> bool {
        for _ in 0..1000 {
            if cond(el) {
                return true;
            }
            el.poll_once(Some(TICK)).unwrap();
        }
        cond(el)
    }

    /// Drive the loop while collecting up to `expected` echoed bytes.
    fn collect_echo(
        el: &mut EventLoop,
        client: &mut std::net::TcpStream,
        expected: usize,
    ) -> Vec<u8> {
        client.set_nonblocking(true).unwrap();
        let mut received = Vec::new();
        let mut chunk = [0u8; 4096];

        for _ in 0..1000 {
            el.poll_once(Some(TICK)).unwrap();
            loop {
                match client.read(&mut chunk) {
                    Ok(0) => return received,
                    Ok(n) => received.extend_from_slice(&chunk[..n]),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => panic!("client read failed: {e}"),
                }
            }
            if received.len() >= expected {
                break;
            }
        }
        received
    }

    fn only_id(el: &EventLoop) -> usize {
        let mut iter = el.connections().iter();
        let (conn_id, _) = iter.next().expect("no connection");
        assert!(iter.next().is_none());
        conn_id
    }

    fn only_connection(el: &EventLoop) -> &Connection<TcpStream> {
        let mut iter = el.connections().iter();
        let (_, conn) = iter.next().expect("no connection");
        assert!(iter.next().is_none());
        conn
    }

    #[test]
    fn test_echo_ping() {
        let mut el = test_loop(1024, 1024);
        let mut client = connect(&el);

        client.write_all(b"ping").unwrap();
        assert_eq!(collect_echo(&mut el, &mut client, 4), b"ping");

        let conn = only_connection(&el);
        assert_eq!(conn.interest(), InterestMode::ReadInterested);
        assert!(conn.buffer().is_empty());
        assert!(conn.buffer().as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_payload_larger_than_buffer() {
        let mut el = test_loop(1024, 1024);
        let mut client = connect(&el);
        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();

        client.write_all(b"ping").unwrap();
        assert_eq!(collect_echo(&mut el, &mut client, 4), b"ping");

        client.write_all(&payload).unwrap();
        assert_eq!(collect_echo(&mut el, &mut client, payload.len()), payload);
    }

    #[test]
    fn test_orderly_close() {
        let mut el = test_loop(1024, 1024);
        let mut client = connect(&el);
        assert!(pump_until(&mut el, |el| el.connections().len() == 1));

        client.shutdown(Shutdown::Write).unwrap();
        assert!(pump_until(&mut el, |el| el.connections().is_empty()));

        // Server side is gone, so the client sees EOF
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_dropped_client_is_removed() {
        let mut el = test_loop(1024, 1024);
        let client = connect(&el);
        assert!(pump_until(&mut el, |el| el.connections().len() == 1));

        drop(client);
        assert!(pump_until(&mut el, |el| el.connections().is_empty()));

        // The freed slot serves the next client
        let mut next = connect(&el);
        next.write_all(b"again").unwrap();
        assert_eq!(collect_echo(&mut el, &mut next, 5), b"again");
    }

    #[test]
    fn test_multiple_connections() {
        let mut el = test_loop(1024, 1024);
        let mut clients: Vec<_> = (0..8).map(|_| connect(&el)).collect();

        for (i, client) in clients.iter_mut().enumerate() {
            client.write_all(format!("client-{i}").as_bytes()).unwrap();
        }

        for (i, client) in clients.iter_mut().enumerate() {
            let expected = format!("client-{i}").into_bytes();
            assert_eq!(collect_echo(&mut el, client, expected.len()), expected);
        }
        assert_eq!(el.connections().len(), 8);
    }

    #[test]
    fn test_accept_under_load() {
        let mut el = test_loop(1, 1024);
        let _clients: Vec<_> = (0..20).map(|_| connect(&el)).collect();

        assert!(pump_until(&mut el, |el| el.connections().len() == 20));
    }

    #[test]
    fn test_small_batch_serves_everyone() {
        let mut el = test_loop(1, 1024);
        let mut clients: Vec<_> = (0..5).map(|_| connect(&el)).collect();
        for client in clients.iter_mut() {
            client.write_all(b"hello").unwrap();
        }

        for client in clients.iter_mut() {
            assert_eq!(collect_echo(&mut el, client, 5), b"hello");
        }

        // A batch never exceeds its capacity
        for _ in 0..10 {
            assert!(el.poll_once(Some(Duration::ZERO)).unwrap() <= 1);
        }
    }

    #[test]
    fn test_backpressure_resumption() {
        let mut el = test_loop(1024, 1024);
        let mut client = connect(&el);
        assert!(pump_until(&mut el, |el| el.connections().len() == 1));
        client.set_nonblocking(true).unwrap();

        // block[k] == k % 251, so block[sent % 251..] continues the stream
        let block: Vec<u8> = (0..251 * 256).map(|i| (i % 251) as u8).collect();

        // Write without ever reading until the server can no longer echo
        let mut sent = 0usize;
        let mut saw_backpressure = false;
        for _ in 0..100_000 {
            match client.write(&block[sent % 251..]) {
                Ok(n) => sent += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("client write failed: {e}"),
            }
            el.poll_once(Some(Duration::ZERO)).unwrap();
            if only_connection(&el).interest() == InterestMode::WriteInterested {
                saw_backpressure = true;
                break;
            }
        }
        assert!(saw_backpressure);
        assert!(only_connection(&el).buffer().has_pending());

        // Drain everything; the deferred echo resumes and reading restarts
        let mut received = 0usize;
        let mut buf = vec![0u8; 64 * 1024];
        for _ in 0..100_000 {
            loop {
                match client.read(&mut buf) {
                    Ok(0) => panic!("server closed the connection"),
                    Ok(n) => {
                        for (j, &b) in buf[..n].iter().enumerate() {
                            assert_eq!(b, ((received + j) % 251) as u8);
                        }
                        received += n;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => panic!("client read failed: {e}"),
                }
            }
            if received == sent {
                break;
            }
            el.poll_once(Some(Duration::from_millis(1))).unwrap();
        }

        assert_eq!(received, sent);
        let conn = only_connection(&el);
        assert_eq!(conn.interest(), InterestMode::ReadInterested);
        assert!(conn.buffer().is_empty());
    }

    #[test]
    fn test_bind_conflict_is_startup_error() {
        let el = test_loop(16, 1024);
        let config = Config {
            host: IpAddr::from([127, 0, 0, 1]),
            port: el.local_addr().unwrap().port(),
            ..Default::default()
        };

        assert!(matches!(
            EventLoop::bind(&config),
            Err(ServerError::Bind { .. })
        ));
    }

    #[test]
    fn test_read_budget_defers_remaining_chunks() {
        let mut el = budget_loop(1024, 4, 1);
        let mut client = connect(&el);
        assert!(pump_until(&mut el, |el| el.connections().len() == 1));
        let conn_id = only_id(&el);

        client.write_all(b"abcdefghijkl").unwrap();
        thread::sleep(Duration::from_millis(50));

        // One chunk per event, the rest waits for the following rounds
        el.poll_once(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(el.still_readable, vec![conn_id]);

        assert_eq!(collect_echo(&mut el, &mut client, 12), b"abcdefghijkl");
        assert!(el.still_readable.is_empty());
    }

    #[test]
    fn test_streaming_client_does_not_starve_others() {
        let mut el = budget_loop(1024, 1024, 4);
        let flood = connect(&el);
        assert!(pump_until(&mut el, |el| el.connections().len() == 1));

        let stop = Arc::new(AtomicBool::new(false));
        let mut writer = flood.try_clone().unwrap();
        let mut reader = flood.try_clone().unwrap();
        let writer_stop = Arc::clone(&stop);
        thread::spawn(move || {
            let block = [0x5au8; 64 * 1024];
            while !writer_stop.load(Ordering::Relaxed) {
                if writer.write_all(&block).is_err() {
                    break;
                }
            }
        });
        thread::spawn(move || {
            let mut sink = vec![0u8; 64 * 1024];
            while matches!(reader.read(&mut sink), Ok(n) if n > 0) {}
        });

        // Let the flood get going before the quiet client shows up
        for _ in 0..20 {
            el.poll_once(Some(TICK)).unwrap();
        }

        let mut quiet = connect(&el);
        quiet.write_all(b"ping").unwrap();
        assert_eq!(collect_echo(&mut el, &mut quiet, 4), b"ping");

        stop.store(true, Ordering::Relaxed);
        let _ = flood.shutdown(Shutdown::Both);
    }

    #[test]
    fn test_accept_failure_retries_backlog() {
        let mut el = test_loop(1024, 1024);
        let _clients: Vec<_> = (0..3).map(|_| connect(&el)).collect();

        // Take the listener's readiness edge without accepting anything
        let mut seen = false;
        for _ in 0..100 {
            let count = el.multiplexer.poll(&mut el.batch, Some(TICK)).unwrap();
            if el.batch[..count].iter().any(|e| e.token == LISTENER_TOKEN) {
                seen = true;
                break;
            }
        }
        assert!(seen);

        el.accept_failed(io::Error::other("accept refused"));
        assert!(el.connections().is_empty());

        // No new connection arrives, yet the queued ones are still accepted
        assert!(pump_until(&mut el, |el| el.connections().len() == 3));
    }

    #[test]
    fn test_read_and_write_bits_in_one_event() {
        let mut el = test_loop(1024, 1024);
        let mut client = connect(&el);
        assert!(pump_until(&mut el, |el| el.connections().len() == 1));
        let conn_id = only_id(&el);

        // Put the connection in the middle of a deferred echo
        let conn = el.connections.get_mut(conn_id).unwrap();
        conn.buffer_mut().read_target()[..4].copy_from_slice(b"tail");
        conn.buffer_mut().commit(4);
        conn.set_interest(InterestMode::WriteInterested);
        el.multiplexer
            .modify(&mut conn.stream, token::conn_token(conn_id), Interest::WRITABLE)
            .unwrap();

        client.write_all(b"new").unwrap();
        thread::sleep(Duration::from_millis(50));

        el.dispatch(ReadyEvent {
            token: token::conn_token(conn_id),
            readable: true,
            writable: true,
        });

        // The read half leaves the pending echo alone, the write half drains it
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut tail = [0u8; 4];
        client.read_exact(&mut tail).unwrap();
        assert_eq!(&tail, b"tail");

        let conn = only_connection(&el);
        assert_eq!(conn.interest(), InterestMode::ReadInterested);
        assert!(conn.buffer().is_empty());

        client.set_read_timeout(None).unwrap();
        assert_eq!(collect_echo(&mut el, &mut client, 3), b"new");
    }

    #[test]
    fn test_failed_interest_change_closes() {
        let mut el = test_loop(1024, 1024);
        let mut client = connect(&el);
        assert!(pump_until(&mut el, |el| el.connections().len() == 1));
        let conn_id = only_id(&el);

        // A stream the multiplexer no longer knows cannot be modified
        let conn = el.connections.get_mut(conn_id).unwrap();
        el.multiplexer.deregister(&mut conn.stream).unwrap();

        el.apply(conn_id, Outcome::WantWrite);
        assert!(el.connections().is_empty());

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
