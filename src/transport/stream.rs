//! Stream Transport
//!
//! `StreamTransport` adapts any tokio byte stream (normally a `TcpStream`) to
//! the [`Transport`] contract. The connection only flips flags and edits
//! buffers; the actual reads and writes happen in [`StreamTransport::next_event`],
//! which the per-connection driver awaits between turns.
//!
//! ## Event Sources
//!
//! ```text
//!   read  n > 0      ──> Readable
//!   read  EOF        ──> Error     (peer half-closed; reads stop)
//!   write n > 0      ──> Wrote
//!   read/write error ──> Error     (stream marked bad)
//!   idle deadline    ──> InactivityTimeout
//! ```

use crate::connection::Event;
use crate::transport::{IoBuffer, Transport};
use bytes::BufMut;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::Instant;
use tracing::trace;

/// Upper bound on how much buffer space is reserved ahead of one read
const READ_CHUNK: usize = 64 * 1024;

pub struct StreamTransport<S> {
    reader: Option<ReadHalf<S>>,
    writer: Option<WriteHalf<S>>,
    peer: String,
    in_buf: IoBuffer,
    out_buf: IoBuffer,
    max_read_ahead: usize,
    inactivity_timeout: Option<Duration>,
    last_activity: Instant,
    good: bool,
    read_eof: bool,
    flushing: bool,
    bytes_read: usize,
    bytes_written: usize,
}

enum Io {
    Read(io::Result<usize>),
    Wrote(io::Result<usize>),
    Idle,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Some(reader),
            writer: Some(writer),
            peer: peer.into(),
            in_buf: IoBuffer::new(),
            out_buf: IoBuffer::new(),
            max_read_ahead: 0,
            inactivity_timeout: None,
            last_activity: Instant::now(),
            good: true,
            read_eof: false,
            flushing: false,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// Returns and resets the byte counters accumulated since the last call.
    pub fn take_io_counts(&mut self) -> (usize, usize) {
        let counts = (self.bytes_read, self.bytes_written);
        self.bytes_read = 0;
        self.bytes_written = 0;
        counts
    }

    /// Waits for the next socket event.
    ///
    /// Cancel safe: a read or write that did not complete has not touched the
    /// buffers. Never resolves while nothing is enabled.
    pub async fn next_event(&mut self) -> Event {
        let read_budget = if self.good && !self.read_eof {
            self.max_read_ahead
        } else {
            0
        };
        let write_pending = self.good && self.flushing && !self.out_buf.is_empty();
        let deadline = self.inactivity_timeout.map(|t| self.last_activity + t);

        let (Some(reader), Some(writer)) = (self.reader.as_mut(), self.writer.as_mut()) else {
            return std::future::pending().await;
        };
        if read_budget > 0 {
            self.in_buf.reserve(read_budget.min(READ_CHUNK));
        }
        let in_buf = &mut self.in_buf;
        let out_buf = &self.out_buf;

        let reading = async {
            let mut limited = in_buf.inner_mut().limit(read_budget);
            reader.read_buf(&mut limited).await
        };
        let writing = async { writer.write(out_buf).await };
        let idle = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        let io = tokio::select! {
            res = reading, if read_budget > 0 => Io::Read(res),
            res = writing, if write_pending => Io::Wrote(res),
            _ = idle => Io::Idle,
        };

        match io {
            Io::Read(Ok(0)) => {
                trace!(client = %self.peer, "Peer closed its side");
                self.read_eof = true;
                Event::Error
            }
            Io::Read(Ok(n)) => {
                self.last_activity = Instant::now();
                self.bytes_read += n;
                trace!(client = %self.peer, bytes = n, "Read data");
                Event::Readable
            }
            Io::Wrote(Ok(0)) => {
                self.good = false;
                Event::Error
            }
            Io::Wrote(Ok(n)) => {
                self.last_activity = Instant::now();
                self.bytes_written += n;
                self.out_buf.consume(n);
                if self.out_buf.is_empty() {
                    self.flushing = false;
                }
                trace!(client = %self.peer, bytes = n, "Wrote data");
                Event::Wrote
            }
            Io::Read(Err(e)) | Io::Wrote(Err(e)) => {
                trace!(client = %self.peer, error = %e, "Stream error");
                self.good = false;
                Event::Error
            }
            Io::Idle => {
                self.last_activity = Instant::now();
                Event::InactivityTimeout
            }
        }
    }
}

impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite,
{
    fn in_buffer(&mut self) -> &mut IoBuffer {
        &mut self.in_buf
    }

    fn out_buffer(&mut self) -> &mut IoBuffer {
        &mut self.out_buf
    }

    fn set_max_read_ahead(&mut self, n: usize) {
        self.max_read_ahead = n;
    }

    fn set_inactivity_timeout(&mut self, timeout: Option<Duration>) {
        self.inactivity_timeout = timeout;
        self.last_activity = Instant::now();
    }

    fn start_flush(&mut self) {
        if self.good && !self.out_buf.is_empty() {
            self.flushing = true;
        }
    }

    fn can_start_flush(&self) -> bool {
        self.good && !self.flushing && !self.out_buf.is_empty()
    }

    fn is_good(&self) -> bool {
        self.good && self.reader.is_some()
    }

    fn is_read_ready(&self) -> bool {
        self.is_good() && !self.read_eof && self.max_read_ahead > 0
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
        self.good = false;
        self.flushing = false;
        self.out_buf.clear();
        self.reader = None;
        self.writer = None;
    }

    fn peer_name(&self) -> &str {
        &self.peer
    }
}
