//! Transport Module
//!
//! A transport is the buffered, event-driven duplex byte stream a connection
//! sits on. The connection never performs I/O itself; it manipulates the
//! transport's buffers and knobs, and the transport turns socket activity
//! into events (`Readable`, `Wrote`, `Error`, `InactivityTimeout`).
//!
//! ## Contract
//!
//! ```text
//!               ┌──────────────────────────────┐
//!   socket ───> │ in buffer   (read-ahead cap) │ ───> connection parses
//!               │                              │
//!   socket <─── │ out buffer  (start_flush)    │ <─── connection encodes
//!               └──────────────────────────────┘
//! ```
//!
//! - Read-ahead is the number of bytes a single read may add to the inbound
//!   buffer. Zero suppresses reading entirely.
//! - `start_flush()` asks the transport to write out everything buffered.
//! - `close()` is immediate: unsent output is discarded.
//!
//! ## Implementations
//!
//! - [`StreamTransport`]: any tokio `AsyncRead + AsyncWrite` stream
//! - [`MemoryTransport`]: in-process, driven by hand

pub mod buffer;
pub mod memory;
pub mod stream;

pub use buffer::IoBuffer;
pub use memory::{MemoryTransport, TransportProbe};
pub use stream::StreamTransport;

use std::time::Duration;

/// The duplex byte stream owned by one connection.
pub trait Transport {
    fn in_buffer(&mut self) -> &mut IoBuffer;

    fn out_buffer(&mut self) -> &mut IoBuffer;

    /// Sets the per-read byte budget; 0 stops reading.
    fn set_max_read_ahead(&mut self, n: usize);

    /// Sets the idle period after which an inactivity timeout fires.
    fn set_inactivity_timeout(&mut self, timeout: Option<Duration>);

    /// Starts writing out the outbound buffer.
    fn start_flush(&mut self);

    /// True when a flush would make progress right now.
    fn can_start_flush(&self) -> bool;

    /// True while the stream is open and has not failed.
    fn is_good(&self) -> bool;

    /// True while reading is enabled.
    fn is_read_ready(&self) -> bool;

    /// True while output is waiting to be written.
    fn is_write_ready(&self) -> bool;

    fn bytes_to_read(&self) -> usize;

    fn bytes_to_write(&self) -> usize;

    /// Closes the stream, discarding unsent output.
    fn close(&mut self);

    /// Peer address as `ip:port`.
    fn peer_name(&self) -> &str;
}

/// Extracts the address part of an `ip:port` peer name.
pub fn peer_ip(peer: &str) -> &str {
    match peer.rfind(':') {
        Some(pos) => peer[..pos].trim_start_matches('[').trim_end_matches(']'),
        None => peer,
    }
}
