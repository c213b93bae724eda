//! Per-Connection Driver
//!
//! The async task that owns one `Connection` over a real stream. It waits on
//! three sources and feeds each wake-up to the state machine as one turn:
//!
//! - socket activity from [`StreamTransport::next_event`]
//! - mail from the workers and the server (completions, shutdown)
//! - a retry tick while a rejected submission is being held
//!
//! The task ends when the connection reports `Terminate`.

use crate::connection::handler::{Connection, Disposition, Event, WorkerContext};
use crate::connection::registry::Mail;
use crate::transport::StreamTransport;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Runs a client session to completion.
pub async fn serve_connection<S>(
    stream: S,
    peer: String,
    ctx: WorkerContext,
    resubmit_interval: Duration,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let registry = ctx.registry.clone();
    let transport = StreamTransport::new(stream, peer.clone());
    let mut conn = match Connection::new(transport, ctx, tx) {
        Ok(conn) => conn,
        Err(e) => {
            warn!(client = %peer, error = %e, "Rejecting connection");
            return;
        }
    };
    info!(client = %peer, conn = %conn.id(), "Client connected");

    loop {
        let held = conn.has_held();
        let event = match conn.transport_mut() {
            Some(transport) => tokio::select! {
                mail = rx.recv() => match mail {
                    Some(Mail::Completed(request)) => Event::Completed(request),
                    Some(Mail::Shutdown) => {
                        debug!(client = %peer, "Shutdown requested");
                        Event::Error
                    }
                    None => break,
                },
                event = transport.next_event() => event,
                _ = tokio::time::sleep(resubmit_interval), if held => Event::Wrote,
            },
            // Detached: only completions matter now.
            None => tokio::select! {
                mail = rx.recv() => match mail {
                    Some(Mail::Completed(request)) => Event::Completed(request),
                    Some(Mail::Shutdown) => continue,
                    None => break,
                },
                _ = tokio::time::sleep(resubmit_interval), if held => Event::Wrote,
            },
        };

        if let Some(transport) = conn.transport_mut() {
            let (read, written) = transport.take_io_counts();
            registry.stats().bytes_read(read);
            registry.stats().bytes_written(written);
        }

        if conn.handle_event(event) == Disposition::Terminate {
            break;
        }
    }

    info!(client = %peer, "Client disconnected");
}
