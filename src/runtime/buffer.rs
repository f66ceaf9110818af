//! Per-connection echo buffer.
//!
//! Each connection owns one fixed-capacity buffer. A read fills it, the
//! echo drains it (possibly across several writable events), and once the
//! whole chunk has been written back the buffer is zeroed for the next read.
//! Because nothing is shared between connections, a connection stuck in
//! backpressure can never have its pending bytes overwritten by another.

/// Fixed-capacity byte buffer with a write cursor.
#[derive(Debug)]
pub struct EchoBuffer {
    data: Box<[u8]>,
    /// Bytes received by the last read.
    filled: usize,
    /// Bytes of `filled` already written back.
    written: usize,
}

impl EchoBuffer {
    /// Create a zeroed buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            filled: 0,
            written: 0,
        }
    }

    /// Size of the buffer in bytes.
    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Whole buffer as a read target.
    ///
    /// Only valid once the previous chunk has been fully echoed.
    pub fn read_target(&mut self) -> &mut [u8] {
        debug_assert!(self.is_empty(), "read into buffer with pending echo");
        &mut self.data
    }

    /// Record that `n` bytes were read into the buffer.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.data.len());
        self.filled = n;
        self.written = 0;
    }

    /// Bytes still waiting to be written back.
    pub fn pending(&self) -> &[u8] {
        &self.data[self.written..self.filled]
    }

    /// Advance the write cursor after `n` bytes were sent.
    pub fn advance(&mut self, n: usize) {
        self.written = (self.written + n).min(self.filled);
    }

    pub fn has_pending(&self) -> bool {
        self.written < self.filled
    }

    /// True when no chunk is held.
    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Zero the buffer and reset both cursors.
    pub fn clear(&mut self) {
        self.data.fill(0);
        self.filled = 0;
        self.written = 0;
    }

    /// Raw contents, including bytes past the current chunk.
    #[cfg(test)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}
