//! Request Framing, Parsing and Response Encoding
//!
//! The connection layer treats the wire format as opaque and talks to it
//! through the [`RequestCodec`] trait:
//!
//! 1. `frame_len()` looks for one complete, self-delimited request at the
//!    front of the inbound buffer and reports its length.
//! 2. `parse()` turns exactly that many bytes into a [`Request`].
//! 3. `encode()` appends the response for a completed request to the
//!    outbound buffer.
//!
//! ## Header Format
//!
//! [`HeaderCodec`] implements the line oriented header protocol:
//!
//! ```text
//! LOOKUP\r\n
//! Cseq: 12\r\n
//! Client-Protocol-Version: 114\r\n
//! Parent File-handle: 2\r\n
//! Filename: etc\r\n
//! \r\n
//! ```
//!
//! and answers with
//!
//! ```text
//! OK\r\n
//! Cseq: 12\r\n
//! Status: 0\r\n
//! File-handle: 17\r\n
//! \r\n
//! ```

use crate::protocol::request::Request;
use bytes::BytesMut;
use std::num::ParseIntError;
use thiserror::Error;

/// Hard ceiling on the size of a single request header. Buffered input that
/// grows past this without containing a complete frame is a protocol error.
pub const MAX_RPC_HEADER_LEN: usize = 16 << 10;

/// Errors that can occur while parsing a framed request.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// The frame holds no request line
    #[error("empty request")]
    EmptyRequest,

    /// The request line is not a valid operation name
    #[error("invalid operation: {0:?}")]
    InvalidOp(String),

    /// A header line without a `:` separator
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    /// A numeric header that does not parse
    #[error("invalid {field}: {reason}")]
    InvalidInteger { field: &'static str, reason: String },

    /// The frame is not valid UTF-8
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// The mandatory `Cseq` header is absent
    #[error("missing Cseq")]
    MissingSeq,
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Frame detection, parsing and response encoding for one wire protocol.
pub trait RequestCodec: Send + Sync {
    /// Returns the length of the first complete frame in `buf`, if any.
    fn frame_len(&self, buf: &[u8]) -> Option<usize>;

    /// Parses exactly one frame previously reported by `frame_len()`.
    fn parse(&self, frame: &[u8]) -> ParseResult<Request>;

    /// Appends the response for `request` to `out`.
    fn encode(&self, request: &Request, out: &mut BytesMut);

    /// Largest header the codec will wait for before giving up on a client.
    fn max_header_len(&self) -> usize {
        MAX_RPC_HEADER_LEN
    }
}

/// Codec for the `Name: value` header protocol.
#[derive(Debug, Clone)]
pub struct HeaderCodec {
    max_header_len: usize,
}

impl Default for HeaderCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderCodec {
    pub fn new() -> Self {
        Self {
            max_header_len: MAX_RPC_HEADER_LEN,
        }
    }

    /// Creates a codec with a different header size ceiling.
    pub fn with_max_header_len(max_header_len: usize) -> Self {
        Self { max_header_len }
    }
}

impl RequestCodec for HeaderCodec {
    fn frame_len(&self, buf: &[u8]) -> Option<usize> {
        find_header_end(buf)
    }

    fn parse(&self, frame: &[u8]) -> ParseResult<Request> {
        let text =
            std::str::from_utf8(frame).map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
        let mut lines = text.lines();

        let op = lines.next().map(str::trim).unwrap_or_default();
        if op.is_empty() {
            return Err(ParseError::EmptyRequest);
        }
        if !op
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
        {
            return Err(ParseError::InvalidOp(op.to_string()));
        }

        let mut seq = None;
        let mut request = Request::new(0, op);

        for line in lines {
            if line.trim().is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ParseError::MalformedHeader(line.to_string()))?;
            let (name, value) = (name.trim(), value.trim());
            if name.eq_ignore_ascii_case("Cseq") {
                seq = Some(parse_int::<i64>("Cseq", value)?);
            } else if name.eq_ignore_ascii_case("Client-Protocol-Version") {
                request.client_proto_vers = parse_int("Client-Protocol-Version", value)?;
            } else {
                request.fields.push((name.to_string(), value.to_string()));
            }
        }

        request.seq = seq.ok_or(ParseError::MissingSeq)?;
        Ok(request)
    }

    fn encode(&self, request: &Request, out: &mut BytesMut) {
        out.extend_from_slice(b"OK\r\n");
        put_field(out, "Cseq", &request.seq.to_string());
        put_field(out, "Status", &request.status.to_string());
        if !request.status_msg.is_empty() {
            put_field(out, "Status-message", &request.status_msg);
        }
        for (name, value) in &request.response_fields {
            put_field(out, name, value);
        }
        out.extend_from_slice(b"\r\n");
    }

    fn max_header_len(&self) -> usize {
        self.max_header_len
    }
}

fn parse_int<T>(field: &'static str, value: &str) -> ParseResult<T>
where
    T: std::str::FromStr<Err = ParseIntError>,
{
    value
        .parse()
        .map_err(|e: ParseIntError| ParseError::InvalidInteger {
            field,
            reason: e.to_string(),
        })
}

/// Header values must stay on one line.
fn put_field(out: &mut BytesMut, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    if value.contains(['\r', '\n']) {
        out.extend_from_slice(value.replace(['\r', '\n'], " ").as_bytes());
    } else {
        out.extend_from_slice(value.as_bytes());
    }
    out.extend_from_slice(b"\r\n");
}

/// Finds the end of the header block: the first `\r\n\r\n` or `\n\n`.
///
/// Returns the frame length including the terminator.
#[inline]
fn find_header_end(buf: &[u8]) -> Option<usize> {
    for i in 0..buf.len() {
        if buf[i] != b'\n' {
            continue;
        }
        if i >= 1 && buf[i - 1] == b'\n' {
            return Some(i + 1);
        }
        if i >= 3 && &buf[i - 3..i] == b"\r\n\r" {
            return Some(i + 1);
        }
    }
    None
}
