//! In-Process Transport
//!
//! `MemoryTransport` has no socket behind it. Input is injected with
//! `feed()`, output stays in the outbound buffer until `drain()` moves it to
//! the probe's wire log. It is what the connection state machine is driven
//! with when there is no event loop, e.g. when replaying captured traffic or
//! exercising flow control deterministically.
//!
//! The [`TransportProbe`] is shared, so its counters remain readable after
//! the connection has released the transport.

use crate::transport::{IoBuffer, Transport};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Observable side of a [`MemoryTransport`].
#[derive(Debug, Default)]
pub struct TransportProbe {
    /// Calls to `start_flush()`
    pub flushes: AtomicUsize,
    /// Calls to `close()`
    pub closes: AtomicUsize,
    /// Last read-ahead set by the connection
    pub read_ahead: AtomicUsize,
    /// Set once the transport has been dropped
    pub released: AtomicBool,
    wire: Mutex<Vec<u8>>,
}

impl TransportProbe {
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::Relaxed)
    }

    pub fn read_ahead(&self) -> usize {
        self.read_ahead.load(Ordering::Relaxed)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Relaxed)
    }

    /// Everything drained to the "wire" so far.
    pub fn wire(&self) -> Vec<u8> {
        self.wire.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// Takes everything drained so far, leaving the wire empty.
    pub fn take_wire(&self) -> Vec<u8> {
        self.wire
            .lock()
            .map(|mut w| std::mem::take(&mut *w))
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct MemoryTransport {
    peer: String,
    in_buf: IoBuffer,
    out_buf: IoBuffer,
    max_read_ahead: usize,
    inactivity_timeout: Option<Duration>,
    good: bool,
    flushing: bool,
    flush_blocked: bool,
    probe: Arc<TransportProbe>,
}

impl MemoryTransport {
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            in_buf: IoBuffer::new(),
            out_buf: IoBuffer::new(),
            max_read_ahead: 0,
            inactivity_timeout: None,
            good: true,
            flushing: false,
            flush_blocked: false,
            probe: Arc::new(TransportProbe::default()),
        }
    }

    pub fn probe(&self) -> Arc<TransportProbe> {
        Arc::clone(&self.probe)
    }

    /// Appends bytes as if they had been read from the peer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.in_buf.extend_from_slice(bytes);
    }

    /// Moves up to `n` bytes of output to the wire, as a socket write would.
    pub fn drain(&mut self, n: usize) -> usize {
        let n = n.min(self.out_buf.len());
        let bytes = self.out_buf.split_frame(n);
        if let Ok(mut wire) = self.probe.wire.lock() {
            wire.extend_from_slice(&bytes);
        }
        if self.out_buf.is_empty() {
            self.flushing = false;
        }
        n
    }

    /// Marks the stream as failed, as an I/O error would.
    pub fn fail(&mut self) {
        self.good = false;
    }

    /// While blocked, `can_start_flush()` reports false.
    pub fn block_flush(&mut self, blocked: bool) {
        self.flush_blocked = blocked;
    }

    pub fn inactivity_timeout(&self) -> Option<Duration> {
        self.inactivity_timeout
    }

    pub fn max_read_ahead(&self) -> usize {
        self.max_read_ahead
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.probe.released.store(true, Ordering::Relaxed);
    }
}

impl Transport for MemoryTransport {
    fn in_buffer(&mut self) -> &mut IoBuffer {
        &mut self.in_buf
    }

    fn out_buffer(&mut self) -> &mut IoBuffer {
        &mut self.out_buf
    }

    fn set_max_read_ahead(&mut self, n: usize) {
        self.max_read_ahead = n;
        self.probe.read_ahead.store(n, Ordering::Relaxed);
    }

    fn set_inactivity_timeout(&mut self, timeout: Option<Duration>) {
        self.inactivity_timeout = timeout;
    }

    fn start_flush(&mut self) {
        self.probe.flushes.fetch_add(1, Ordering::Relaxed);
        if !self.out_buf.is_empty() {
            self.flushing = true;
        }
    }

    fn can_start_flush(&self) -> bool {
        self.good && !self.flushing && !self.flush_blocked && !self.out_buf.is_empty()
    }

    fn is_good(&self) -> bool {
        self.good
    }

    fn is_read_ready(&self) -> bool {
        self.good && self.max_read_ahead > 0
    }

    fn is_write_ready(&self) -> bool {
        !self.out_buf.is_empty()
    }

    fn bytes_to_read(&self) -> usize {
        self.in_buf.len()
    }

    fn bytes_to_write(&self) -> usize {
        self.out_buf.len()
    }

    fn close(&mut self) {
        self.probe.closes.fetch_add(1, Ordering::Relaxed);
        self.good = false;
        self.flushing = false;
        self.out_buf.clear();
    }

    fn peer_name(&self) -> &str {
        &self.peer
    }
}
