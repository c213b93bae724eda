//! Connection Registry
//!
//! Process-wide bookkeeping of live connections. A connection registers
//! itself when it is constructed and deregisters when it is dropped; in
//! between, its entry is how completions find their way back to it and how
//! broadcast operations (shutdown, client listings) reach every session.
//!
//! Requests refer to their connection by [`ConnectionId`] only. The
//! connection outlives every request it submitted, so an id carried by an
//! outstanding request always resolves.

use crate::protocol::Request;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Handle of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Messages delivered to a connection from outside its own event loop.
#[derive(Debug)]
pub enum Mail {
    /// A submitted request finished executing
    Completed(Box<Request>),
    /// The server is going down; drain and close
    Shutdown,
}

pub type Mailbox = mpsc::UnboundedSender<Mail>;

#[derive(Debug)]
struct Entry {
    peer: String,
    mailbox: Mailbox,
    opened_at: Instant,
}

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently registered connections
    pub active_connections: AtomicU64,
    /// Requests handed to the workers
    pub requests_submitted: AtomicU64,
    /// Requests whose response was written
    pub requests_completed: AtomicU64,
    /// Submissions refused because a worker queue was full
    pub submissions_rejected: AtomicU64,
    /// Connections closed for a protocol violation
    pub protocol_errors: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn request_submitted(&self) {
        self.requests_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn submission_rejected(&self) {
        self.submissions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Live connections keyed by id.
#[derive(Debug, Default)]
pub struct Registry {
    entries: DashMap<ConnectionId, Entry>,
    next_id: AtomicU64,
    stats: ConnectionStats,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection and returns its id.
    pub fn register(&self, peer: String, mailbox: Mailbox) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.entries.insert(
            id,
            Entry {
                peer,
                mailbox,
                opened_at: Instant::now(),
            },
        );
        self.stats.connection_opened();
        id
    }

    /// Removes a connection. Returns false if it was not registered.
    pub fn deregister(&self, id: ConnectionId) -> bool {
        match self.entries.remove(&id) {
            Some((_, entry)) => {
                self.stats.connection_closed();
                debug!(
                    conn = %id,
                    client = %entry.peer,
                    lifetime_ms = entry.opened_at.elapsed().as_millis() as u64,
                    "Connection deregistered"
                );
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Routes a completed request to its connection's mailbox.
    pub fn complete(&self, request: Box<Request>) {
        let Some(id) = request.conn else {
            error!(seq = request.seq, op = %request.op, "Completed request has no connection");
            return;
        };
        // Clone the sender so the shard lock is not held across the send.
        let mailbox = self.entries.get(&id).map(|entry| entry.mailbox.clone());
        match mailbox {
            Some(mailbox) => {
                if let Err(mpsc::error::SendError(Mail::Completed(request))) =
                    mailbox.send(Mail::Completed(request))
                {
                    error!(conn = %id, seq = request.seq, "Connection mailbox closed");
                }
            }
            None => {
                error!(conn = %id, seq = request.seq, "Completion for unknown connection");
            }
        }
    }

    /// Asks every connection to drain and close. Returns how many were told.
    pub fn shutdown_all(&self) -> usize {
        let mailboxes: Vec<Mailbox> = self
            .entries
            .iter()
            .map(|entry| entry.mailbox.clone())
            .collect();
        mailboxes
            .into_iter()
            .filter(|mailbox| mailbox.send(Mail::Shutdown).is_ok())
            .count()
    }

    /// Snapshot of `(id, peer)` for every live connection, ordered by id.
    pub fn peers(&self) -> Vec<(ConnectionId, String)> {
        let mut peers: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (*entry.key(), entry.peer.clone()))
            .collect();
        peers.sort();
        peers
    }
}
