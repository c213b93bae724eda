//! Audit Logging
//!
//! When `metaServer.clientSM.auditLogging` is on, every request keeps the
//! raw header it was parsed from and, once completed, is handed to an
//! [`AuditLog`]. Logging is fire-and-forget: it cannot fail the request.

use crate::protocol::Request;
use tracing::info;

/// Sink for completed requests.
pub trait AuditLog: Send + Sync {
    fn log(&self, request: &Request);
}

/// Writes one `info` event per request on the `audit` target.
///
/// Route it to its own file with a target filter such as
/// `RUST_LOG=info,audit=info`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLog;

impl AuditLog for TracingAuditLog {
    fn log(&self, request: &Request) {
        let header = request
            .raw_header
            .as_deref()
            .map(escape_header)
            .unwrap_or_default();
        info!(
            target: "audit",
            client = %request.client_ip,
            seq = request.seq,
            op = %request.op,
            status = request.status,
            header = %header,
        );
    }
}

/// Renders header bytes on one line.
pub fn escape_header(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    for &b in raw {
        match b {
            b'\r' => {}
            b'\n' => out.push('|'),
            b'|' | b'\\' => {
                out.push('\\');
                out.push(b as char);
            }
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out
}
