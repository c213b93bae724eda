//! Connection I/O Buffers
//!
//! `IoBuffer` is the inbound or outbound byte queue of one transport. It is a
//! thin layer over `BytesMut` that adds the operations the connection needs:
//! consuming a parsed frame, splitting a frame off so it can be retained for
//! audit logging, and compacting the backing storage once most of it has
//! been consumed.

use bytes::{Buf, Bytes, BytesMut};
use std::ops::Deref;

/// Initial capacity of a fresh buffer
const INITIAL_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Default)]
pub struct IoBuffer {
    data: BytesMut,
}

impl IoBuffer {
    pub fn new() -> Self {
        Self {
            data: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
        }
    }

    /// Number of buffered bytes not yet consumed.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Drops the first `n` bytes.
    pub fn consume(&mut self, n: usize) {
        self.data.advance(n);
    }

    /// Removes the first `n` bytes and returns them without copying.
    pub fn split_frame(&mut self, n: usize) -> Bytes {
        self.data.split_to(n).freeze()
    }

    /// Discards everything.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    /// Copies the remaining bytes into storage sized to fit them, releasing
    /// the space already consumed. Costs one copy of the retained bytes.
    pub fn compact(&mut self) {
        if self.data.capacity() <= self.data.len() {
            return;
        }
        let mut fresh = BytesMut::with_capacity(self.data.len());
        fresh.extend_from_slice(&self.data);
        self.data = fresh;
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Direct access for codecs and socket reads.
    pub fn inner_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }
}

impl Deref for IoBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}
