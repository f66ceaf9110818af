//! Multiplexer token assignment.
//!
//! Connections are identified by their registry slot. The slot index doubles
//! as the mio token, and the listener sits at the top of the token space
//! where no slab slot can ever reach.

use mio::Token;

/// Token reserved for the listening socket.
pub const LISTENER_TOKEN: Token = Token(usize::MAX);

/// What a ready token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Listener,
    Connection(usize),
}

/// Token for a connection id.
pub fn conn_token(conn_id: usize) -> Token {
    debug_assert_ne!(conn_id, LISTENER_TOKEN.0);
    Token(conn_id)
}

/// Resolve a ready token back to its source.
pub fn source(token: Token) -> Source {
    if token == LISTENER_TOKEN {
        Source::Listener
    } else {
        Source::Connection(token.0)
    }
}
