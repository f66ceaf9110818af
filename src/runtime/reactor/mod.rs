//! mio-based reactor.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS) driven
//! by a single thread.

mod event_loop;
mod multiplexer;

pub use event_loop::EventLoop;
