//! Connection State Machine
//!
//! One `Connection` per client session. It owns the session's transport,
//! cuts requests out of the inbound buffer, submits them to the workers,
//! writes their responses back in completion order, and decides when the
//! session is over.
//!
//! ## Turns
//!
//! Everything happens inside [`Connection::handle_event`]. An event may
//! cause follow-up events (a completion re-issues `Readable` to pick up
//! input that was held back; a protocol violation raises `Error`). These are
//! queued and processed within the same call, so one call is one logical
//! turn:
//!
//! ```text
//!   handle_event(ev)
//!        │
//!        ▼
//!   ┌─────────────┐  follow-up events
//!   │ event queue │◄───────────────┐
//!   └──────┬──────┘                │
//!          ▼                       │
//!   Readable / Completed / Wrote / Error / InactivityTimeout
//!          │ (queue drained)
//!          ▼
//!   end of turn: flush, half-close, compaction, read suppression
//!          │
//!          ▼
//!   Disposition::{Continue, Detached, Terminate}
//! ```
//!
//! Side effects that must happen once per turn (starting a flush, closing
//! the transport, giving up the transport) are taken at most once per call.
//!
//! ## Flow Control
//!
//! Reads are suppressed (read-ahead 0) while any soft ceiling is exceeded:
//! requests in flight, unflushed output, or unparsed input. Nothing is ever
//! dropped; framing resumes once the backlog drains. Only the header size
//! ceiling is hard: a client that sends more than that without completing a
//! request is disconnected.
//!
//! ## Lifetime
//!
//! A connection must outlive every request it submitted, because workers
//! route completions back to it by id. When the transport fails while
//! requests are outstanding, the connection drops the transport at once and
//! reports `Detached`; it terminates when the last completion arrives.

use crate::audit::AuditLog;
use crate::config::{Policy, SharedPolicy};
use crate::connection::registry::{ConnectionId, Mailbox, Registry};
use crate::dispatch::WorkerDispatch;
use crate::protocol::{Request, RequestCodec, CLIENT_PROTO_VERS};
use crate::transport::{peer_ip, Transport};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Lines of an invalid request echoed to the log
const MAX_INVALID_REQUEST_LINES: usize = 16;

/// Longest invalid request line echoed to the log
const MAX_INVALID_REQUEST_LINE_LEN: usize = 127;

/// Something that happened to a connection.
#[derive(Debug)]
pub enum Event {
    /// New input is buffered
    Readable,
    /// Output was written; also used to retry a held submission
    Wrote,
    /// A submitted request finished executing
    Completed(Box<Request>),
    /// The peer closed its side, the stream failed, or shutdown was asked
    Error,
    /// The connection was idle for too long
    InactivityTimeout,
}

/// What the owner of a connection should do after a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep driving the transport
    Continue,
    /// The transport is gone; deliver only completions from now on
    Detached,
    /// Nothing left to do; drop the connection
    Terminate,
}

/// Collaborators shared by every connection.
#[derive(Clone)]
pub struct WorkerContext {
    pub registry: Arc<Registry>,
    pub dispatch: Arc<dyn WorkerDispatch>,
    pub codec: Arc<dyn RequestCodec>,
    pub audit: Arc<dyn AuditLog>,
    pub policy: SharedPolicy,
}

/// Errors that can occur while setting up or driving a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The transport was already closed or failed
    #[error("transport is not open")]
    TransportClosed,
}

/// Once-per-turn side effects already taken.
#[derive(Debug, Default)]
struct Turn {
    flushed: bool,
    closed: bool,
}

pub struct Connection<T: Transport> {
    id: ConnectionId,
    /// `None` once the transport has been given up
    transport: Option<T>,
    peer: String,
    client_ip: String,
    /// Requests framed and not yet completed. A held request counts too, so
    /// this can exceed what the workers accepted minus what they completed;
    /// it is what keeps the connection alive while the request is retried.
    pending_ops: usize,
    /// Close as soon as outstanding work and output have drained
    disconnect: bool,
    /// Lowest protocol version seen from this client
    client_proto_vers: i32,
    /// Unparsed bytes left by the last parse pass
    last_read_left: usize,
    /// A request the workers refused; offered again on a later pass
    held: Option<Box<Request>>,
    queue: VecDeque<Event>,
    turn: Turn,
    policy: Arc<Policy>,
    ctx: WorkerContext,
    terminated: bool,
}

impl<T: Transport> Connection<T> {
    /// Takes ownership of an open transport and registers the connection.
    pub fn new(
        mut transport: T,
        ctx: WorkerContext,
        mailbox: Mailbox,
    ) -> Result<Self, ConnectionError> {
        if !transport.is_good() {
            return Err(ConnectionError::TransportClosed);
        }
        let peer = transport.peer_name().to_string();
        let client_ip = peer_ip(&peer).to_string();
        let id = ctx.registry.register(peer.clone(), mailbox);
        let policy = ctx.policy.load_full();

        transport.set_inactivity_timeout(policy.inactivity_timeout);
        transport.set_max_read_ahead(policy.max_read_ahead);

        Ok(Self {
            id,
            transport: Some(transport),
            peer,
            client_ip,
            pending_ops: 0,
            disconnect: false,
            client_proto_vers: CLIENT_PROTO_VERS,
            last_read_left: 0,
            held: None,
            queue: VecDeque::new(),
            turn: Turn::default(),
            policy,
            ctx,
            terminated: false,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn pending_ops(&self) -> usize {
        self.pending_ops
    }

    pub fn is_disconnect_pending(&self) -> bool {
        self.disconnect
    }

    pub fn client_proto_vers(&self) -> i32 {
        self.client_proto_vers
    }

    /// True while a rejected submission waits to be offered again.
    pub fn has_held(&self) -> bool {
        self.held.is_some()
    }

    pub fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> Option<&mut T> {
        self.transport.as_mut()
    }

    /// Runs one turn.
    ///
    /// # Panics
    ///
    /// On a broken collaborator contract: an event after `Terminate`, an I/O
    /// event after the transport was given up, or a completion with nothing
    /// outstanding.
    pub fn handle_event(&mut self, event: Event) -> Disposition {
        assert!(
            !self.terminated,
            "event {:?} delivered to terminated connection {}",
            event, self.id
        );
        assert!(
            self.transport.is_some() || matches!(event, Event::Completed(_) | Event::Wrote),
            "event {:?} delivered to connection {} without transport",
            event,
            self.id
        );

        self.policy = self.ctx.policy.load_full();
        self.turn = Turn::default();
        self.queue.push_back(event);

        while let Some(event) = self.queue.pop_front() {
            match event {
                Event::Readable => self.on_readable(),
                Event::Completed(request) => {
                    self.on_completed(request);
                    self.on_wrote(true);
                }
                Event::Wrote => self.on_wrote(false),
                Event::Error => self.on_error(),
                Event::InactivityTimeout => self.close_and_discard(),
            }
        }

        self.finish_turn()
    }

    fn is_over_pending_ops_limit(&self) -> bool {
        self.pending_ops >= self.policy.max_pending_ops
    }

    fn is_over_write_behind(&self) -> bool {
        self.transport
            .as_ref()
            .is_some_and(|t| t.bytes_to_write() >= self.policy.max_write_behind)
    }

    fn is_good(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_good())
    }

    fn flush(&mut self) {
        if self.turn.flushed {
            return;
        }
        if let Some(t) = self.transport.as_mut() {
            if t.can_start_flush() {
                t.start_flush();
                self.turn.flushed = true;
            }
        }
    }

    fn close_transport(&mut self) {
        if self.turn.closed {
            return;
        }
        if let Some(t) = self.transport.as_mut() {
            t.close();
            self.turn.closed = true;
        }
    }

    fn close_and_discard(&mut self) {
        debug!(client = %self.peer, pending = self.pending_ops, "Closing connection");
        self.close_transport();
        if let Some(t) = self.transport.as_mut() {
            t.in_buffer().clear();
        }
    }

    fn on_readable(&mut self) {
        self.last_read_left = 0;
        let Some(t) = self.transport.as_mut() else {
            return;
        };
        if !t.is_good() {
            return;
        }
        if self.disconnect {
            t.in_buffer().clear();
        }
        self.offer_held();

        // Do not start new requests while responses are not being taken off
        // the connection by the client.
        let codec = Arc::clone(&self.ctx.codec);
        let mut over_write_behind;
        loop {
            over_write_behind = self.is_over_write_behind();
            if over_write_behind && !self.turn.flushed {
                self.flush();
                over_write_behind = self.is_over_write_behind();
            }
            if over_write_behind || self.is_over_pending_ops_limit() || self.held.is_some() {
                break;
            }
            let frame_len = match self.transport.as_mut() {
                Some(t) if t.is_good() => codec.frame_len(t.in_buffer()),
                _ => None,
            };
            let Some(len) = frame_len else {
                break;
            };
            if !self.handle_frame(codec.as_ref(), len) {
                return;
            }
        }

        if over_write_behind
            || self.held.is_some()
            || self.is_over_pending_ops_limit()
            || self.disconnect
        {
            return;
        }

        let max_header_len = codec.max_header_len();
        let max_read_ahead = self.policy.max_read_ahead;
        let Some(t) = self.transport.as_mut() else {
            return;
        };
        let left = t.bytes_to_read();
        if left <= max_header_len {
            self.last_read_left = left;
            t.set_max_read_ahead(max_read_ahead);
            return;
        }
        error!(
            client = %self.peer,
            buffered = left,
            max = max_header_len,
            "Exceeded max request header size, closing connection"
        );
        t.in_buffer().clear();
        self.ctx.registry.stats().protocol_error();
        self.close_transport();
        self.queue.push_back(Event::Error);
    }

    /// Parses and submits the first `len` buffered bytes. Returns false if
    /// the request was invalid and the connection is being closed.
    fn handle_frame(&mut self, codec: &dyn RequestCodec, len: usize) -> bool {
        let audit_logging = self.policy.audit_logging;
        let Some(t) = self.transport.as_mut() else {
            return false;
        };

        let mut request = match codec.parse(&t.in_buffer()[..len]) {
            Ok(request) => request,
            Err(e) => {
                error!(client = %self.peer, error = %e, "Invalid request");
                let frame = &t.in_buffer()[..len];
                for line in frame
                    .split(|&b| b == b'\n')
                    .filter(|line| !line.is_empty())
                    .take(MAX_INVALID_REQUEST_LINES)
                {
                    let line = &line[..line.len().min(MAX_INVALID_REQUEST_LINE_LEN)];
                    error!(
                        client = %self.peer,
                        line = %String::from_utf8_lossy(line).trim_end(),
                        "Invalid request"
                    );
                }
                t.in_buffer().clear();
                self.ctx.registry.stats().protocol_error();
                self.close_transport();
                self.queue.push_back(Event::Error);
                return false;
            }
        };

        if request.client_proto_vers < self.client_proto_vers {
            self.client_proto_vers = request.client_proto_vers;
            warn!(
                client = %self.peer,
                version = request.client_proto_vers,
                request = %request,
                "Request with old protocol version"
            );
        }

        if audit_logging {
            request.raw_header = Some(t.in_buffer().split_frame(len));
        } else {
            t.in_buffer().consume(len);
        }
        debug!(
            client = %self.peer,
            seq = request.seq,
            request = %request,
            pending_rd = t.bytes_to_read(),
            pending_wr = t.bytes_to_write(),
            "+seq"
        );

        request.client_ip = self.client_ip.clone();
        request.from_client = true;
        request.conn = Some(self.id);
        self.pending_ops += 1;
        self.submit(Box::new(request));
        true
    }

    fn submit(&mut self, request: Box<Request>) {
        match self.ctx.dispatch.submit(request) {
            Ok(()) => self.ctx.registry.stats().request_submitted(),
            Err(request) => {
                self.ctx.registry.stats().submission_rejected();
                debug!(client = %self.peer, seq = request.seq, "Workers busy, holding request");
                self.held = Some(request);
            }
        }
    }

    /// Offers the held request again. Returns true if it was accepted now.
    fn offer_held(&mut self) -> bool {
        match self.held.take() {
            Some(request) => {
                self.submit(request);
                self.held.is_none()
            }
            None => false,
        }
    }

    fn on_completed(&mut self, request: Box<Request>) {
        assert!(
            self.pending_ops > 0,
            "completion of seq {} on connection {} with no pending requests",
            request.seq,
            self.id
        );
        self.pending_ops -= 1;
        self.ctx.registry.stats().request_completed();

        if self.policy.audit_logging && request.raw_header.is_some() {
            self.ctx.audit.log(&request);
        }
        self.send_response(&request);
        drop(request);

        if self.transport.is_none() {
            return;
        }
        if self.pending_ops == 0 || !self.ctx.dispatch.flush(self.id) {
            self.flush();
        }
    }

    fn send_response(&mut self, request: &Request) {
        if request.should_log_response() {
            info!(
                client = %self.peer,
                seq = request.seq,
                status = request.status,
                msg = %request.status_msg,
                request = %request,
                "-seq"
            );
        } else {
            debug!(
                client = %self.peer,
                seq = request.seq,
                status = request.status,
                msg = %request.status_msg,
                "-seq"
            );
        }
        let Some(t) = self.transport.as_mut() else {
            return;
        };
        if request.is_disconnect() {
            self.disconnect = true;
        }
        self.ctx.codec.encode(request, t.out_buffer().inner_mut());
    }

    fn on_wrote(&mut self, completed: bool) {
        let resubmitted = self.offer_held();
        if self.is_over_pending_ops_limit() || self.held.is_some() {
            return;
        }
        let max_write_behind = self.policy.max_write_behind;
        let max_read_ahead = self.policy.max_read_ahead;
        let Some(t) = self.transport.as_mut() else {
            return;
        };
        if !t.is_good() {
            return;
        }
        if (completed || resubmitted || !t.is_read_ready()) && t.bytes_to_write() < max_write_behind
        {
            if t.bytes_to_read() > self.last_read_left || self.disconnect || resubmitted {
                self.queue.push_back(Event::Readable);
            } else if !t.is_read_ready() {
                t.set_max_read_ahead(max_read_ahead);
            }
        }
    }

    fn on_error(&mut self) {
        if let Some(t) = self.transport.as_ref() {
            if t.is_good() && (self.pending_ops > 0 || t.is_write_ready()) {
                // The peer is done sending; finish what it asked for first.
                debug!(
                    client = %self.peer,
                    pending = self.pending_ops,
                    unsent = t.bytes_to_write(),
                    "Draining before close"
                );
                self.disconnect = true;
                return;
            }
        }
        self.close_and_discard();
    }

    fn finish_turn(&mut self) -> Disposition {
        let mut good = self.is_good();
        if good && (self.pending_ops == 0 || !self.ctx.dispatch.flush(self.id)) {
            self.flush();
            good = self.is_good();
        }

        if good && self.disconnect {
            let drained = self.pending_ops == 0
                && self.held.is_none()
                && self.transport.as_ref().is_some_and(|t| !t.is_write_ready());
            if drained {
                self.close_transport();
                good = false;
            } else if let Some(t) = self.transport.as_mut() {
                t.set_max_read_ahead(0);
            }
        }

        if good {
            let over_pending = self.is_over_pending_ops_limit();
            let policy = Arc::clone(&self.policy);
            if let Some(t) = self.transport.as_mut() {
                let unread = t.bytes_to_read();
                if unread > 0 && unread <= policy.buf_compaction_threshold {
                    t.in_buffer().compact();
                }
                let unsent = t.bytes_to_write();
                if unsent > 0 && unsent <= policy.out_buf_compaction_threshold {
                    t.out_buffer().compact();
                }
                if t.is_read_ready()
                    && (over_pending
                        || t.bytes_to_write() >= policy.max_write_behind
                        || t.bytes_to_read() >= policy.max_pending_bytes)
                {
                    self.last_read_left = 0;
                    t.set_max_read_ahead(0);
                }
            }
            return Disposition::Continue;
        }

        if self.pending_ops > 0 {
            if self.transport.take().is_some() {
                debug!(
                    client = %self.peer,
                    pending = self.pending_ops,
                    "Transport released, waiting for outstanding requests"
                );
            }
            return Disposition::Detached;
        }

        self.transport = None;
        self.terminated = true;
        Disposition::Terminate
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        if self.pending_ops > 0 {
            warn!(
                client = %self.peer,
                pending = self.pending_ops,
                "Connection dropped with outstanding requests"
            );
        }
        self.ctx.registry.deregister(self.id);
    }
}
