//! Client Request Type
//!
//! A `Request` is one framed and parsed client RPC. The connection layer only
//! cares about a handful of its fields: the sequence number, the originating
//! connection handle, the status, the client protocol version and, when audit
//! logging is on, the raw header bytes it was parsed from. Everything else is
//! carried through to the request handler and back into the response.
//!
//! ## Lifecycle
//!
//! ```text
//! framed ──> parsed ──> stamped (client ip, connection id) ──> submitted
//!                                                                  │
//!            released <── encoded into response <── completed <───┘
//! ```

use crate::connection::ConnectionId;
use bytes::Bytes;
use std::fmt;

/// Protocol version spoken by current clients.
pub const CLIENT_PROTO_VERS: i32 = 114;

/// Operation name that asks the server to close the connection once the
/// response has been sent.
pub const OP_DISCONNECT: &str = "DISCONNECT";

/// Chunk allocation; its responses are logged when they fail.
pub const OP_ALLOCATE: &str = "ALLOCATE";

/// A single client request together with its (eventual) response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Client assigned sequence number (`Cseq`)
    pub seq: i64,

    /// Upper-case operation name
    pub op: String,

    /// Protocol version the client declared
    pub client_proto_vers: i32,

    /// Request header fields other than the ones above, in arrival order
    pub fields: Vec<(String, String)>,

    /// Handle of the originating connection.
    ///
    /// This is an index into the connection registry, never a reference.
    /// The connection stays registered while this request is outstanding.
    pub conn: Option<ConnectionId>,

    /// Client address without the port
    pub client_ip: String,

    /// Set when the request arrived through a client connection
    pub from_client: bool,

    /// Completion status, 0 on success, negative errno otherwise
    pub status: i32,

    /// Optional human readable status
    pub status_msg: String,

    /// Fields appended to the response header
    pub response_fields: Vec<(String, String)>,

    /// Raw request header, only retained when audit logging is enabled
    pub raw_header: Option<Bytes>,
}

impl Request {
    /// Creates a request with the given sequence number and operation.
    pub fn new(seq: i64, op: impl Into<String>) -> Self {
        Self {
            seq,
            op: op.into(),
            client_proto_vers: CLIENT_PROTO_VERS,
            fields: Vec::new(),
            conn: None,
            client_ip: String::new(),
            from_client: false,
            status: 0,
            status_msg: String::new(),
            response_fields: Vec::new(),
            raw_header: None,
        }
    }

    /// Returns the value of a request header field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Appends a field to the response header.
    pub fn respond_with(&mut self, name: impl Into<String>, value: impl ToString) {
        self.response_fields.push((name.into(), value.to_string()));
    }

    /// Marks the request as failed.
    pub fn fail(&mut self, status: i32, msg: impl Into<String>) {
        self.status = status;
        self.status_msg = msg.into();
    }

    pub fn is_disconnect(&self) -> bool {
        self.op == OP_DISCONNECT
    }

    /// Failed allocations are always worth a log line; the placement is
    /// needed when chasing chunk problems later.
    pub fn should_log_response(&self) -> bool {
        self.op == OP_ALLOCATE && self.status < 0
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} seq: {}", self.op, self.seq)?;
        for (k, v) in &self.fields {
            write!(f, " {}: {}", k, v)?;
        }
        Ok(())
    }
}
