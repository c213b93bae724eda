//! Client Protocol
//!
//! This module holds the request type that flows between a connection and
//! the workers, and the codec contract the connection uses to cut requests
//! out of the inbound byte stream and write responses back.
//!
//! ## Modules
//!
//! - `request`: The `Request` type (identity, status, response fields)
//! - `codec`: The `RequestCodec` trait and the `HeaderCodec` implementation
//!
//! ## Example
//!
//! ```
//! use metaconn::protocol::{HeaderCodec, RequestCodec};
//! use bytes::BytesMut;
//!
//! let codec = HeaderCodec::new();
//! let data = b"PING\r\nCseq: 1\r\n\r\n";
//! let len = codec.frame_len(data).unwrap();
//! let request = codec.parse(&data[..len]).unwrap();
//!
//! let mut out = BytesMut::new();
//! codec.encode(&request, &mut out);
//! assert_eq!(&out[..], b"OK\r\nCseq: 1\r\nStatus: 0\r\n\r\n");
//! ```

pub mod codec;
pub mod request;

// Re-export commonly used types for convenience
pub use codec::{HeaderCodec, ParseError, ParseResult, RequestCodec, MAX_RPC_HEADER_LEN};
pub use request::{Request, CLIENT_PROTO_VERS, OP_ALLOCATE, OP_DISCONNECT};
