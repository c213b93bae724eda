//! Client Listener
//!
//! Accepts client connections and spawns one [`serve_connection`] task per
//! client. On shutdown the accept loop stops, every live connection is asked
//! to drain and close, and the server waits a bounded time for them to go.

use crate::audit::TracingAuditLog;
use crate::config::{ServerConfig, SharedPolicy};
use crate::connection::{serve_connection, Registry, WorkerContext};
use crate::dispatch::WorkerPool;
use crate::ops::BasicHandler;
use crate::protocol::HeaderCodec;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// How long shutdown waits for connections to finish
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while draining
const DRAIN_POLL: Duration = Duration::from_millis(10);

pub struct Server {
    config: ServerConfig,
    ctx: WorkerContext,
}

impl Server {
    /// Creates a server with the default request handler and codec.
    ///
    /// Starts the worker pool, so it must be called within a tokio runtime.
    pub fn new(config: ServerConfig, policy: SharedPolicy) -> Self {
        let registry = Arc::new(Registry::new());
        let handler = Arc::new(BasicHandler::new(Arc::clone(&registry)));
        let pool = WorkerPool::start(
            config.client_threads,
            config.queue_depth,
            handler,
            Arc::clone(&registry),
        );
        let ctx = WorkerContext {
            registry,
            dispatch: Arc::new(pool),
            codec: Arc::new(HeaderCodec::new()),
            audit: Arc::new(TracingAuditLog),
            policy,
        };
        Self { config, ctx }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.ctx.registry
    }

    /// Binds the configured client address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(self.config.bind_address()).await
    }

    /// Serves clients until `shutdown` resolves, then drains.
    pub async fn run<F>(&self, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "Accepting client connections");
        }

        tokio::select! {
            _ = accept_loop(listener, self.ctx.clone(), self.config.resubmit_interval) => {}
            _ = shutdown => {}
        }

        self.drain().await;
    }

    async fn drain(&self) {
        let registry = &self.ctx.registry;
        let notified = registry.shutdown_all();
        info!(connections = notified, "Draining client connections");

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while !registry.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        if !registry.is_empty() {
            warn!(remaining = registry.len(), "Connections still open after drain timeout");
        }
    }
}

/// Main loop that accepts incoming connections
async fn accept_loop(listener: TcpListener, ctx: WorkerContext, resubmit_interval: Duration) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
                }
                tokio::spawn(serve_connection(
                    stream,
                    addr.to_string(),
                    ctx.clone(),
                    resubmit_interval,
                ));
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{shared_policy, Policy};
    use std::net::SocketAddr;
    use std::sync::atomic::Ordering;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    struct TestServer {
        addr: SocketAddr,
        registry: Arc<Registry>,
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<()>,
    }

    async fn create_test_server(policy: Policy) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ServerConfig {
            client_threads: 2,
            ..ServerConfig::default()
        };
        let server = Server::new(config, shared_policy(policy));
        let registry = Arc::clone(server.registry());
        let (shutdown, rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            server
                .run(listener, async {
                    let _ = rx.await;
                })
                .await;
        });

        TestServer {
            addr,
            registry,
            shutdown,
            task,
        }
    }

    /// Reads until `count` complete responses have arrived.
    async fn read_responses(client: &mut TcpStream, count: usize) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        let deadline = Instant::now() + Duration::from_secs(2);
        while String::from_utf8_lossy(&out).matches("\r\n\r\n").count() < count {
            assert!(Instant::now() < deadline, "timed out waiting for responses");
            match tokio::time::timeout(Duration::from_millis(100), client.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
                Ok(Err(e)) => panic!("read failed: {}", e),
                Err(_) => continue,
            }
        }
        String::from_utf8(out).unwrap()
    }

    async fn read_eof(client: &mut TcpStream) -> bool {
        let mut buf = [0u8; 256];
        loop {
            match tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }

    async fn wait_until_empty(registry: &Registry) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !registry.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_ping() {
        let server = create_test_server(Policy::default()).await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        client.write_all(b"PING\r\nCseq: 1\r\n\r\n").await.unwrap();
        let response = read_responses(&mut client, 1).await;

        assert!(response.starts_with("OK\r\nCseq: 1\r\nStatus: 0\r\n"));
        assert!(response.contains("System-Info: metaconn/"));
    }

    #[tokio::test]
    async fn test_pipelined_requests_answered_in_order() {
        let policy = Policy {
            max_pending_ops: 4,
            ..Policy::default()
        };
        let server = create_test_server(policy).await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        // All requests in one write (pipelining)
        let batch: String = (1..=10)
            .map(|seq| format!("PING\r\nCseq: {}\r\n\r\n", seq))
            .collect();
        client.write_all(batch.as_bytes()).await.unwrap();

        let response = read_responses(&mut client, 10).await;
        let seqs: Vec<i64> = response
            .lines()
            .filter_map(|line| line.strip_prefix("Cseq: "))
            .map(|seq| seq.parse().unwrap())
            .collect();
        assert_eq!(seqs, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_unknown_op_gets_error_status() {
        let server = create_test_server(Policy::default()).await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        client.write_all(b"NO_SUCH_OP\r\nCseq: 5\r\n\r\n").await.unwrap();
        let response = read_responses(&mut client, 1).await;
        assert!(response.contains("Status: -22\r\n"));
    }

    #[tokio::test]
    async fn test_malformed_request_closes_connection() {
        let server = create_test_server(Policy::default()).await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        client.write_all(b"this is not a request\r\n\r\n").await.unwrap();
        assert!(read_eof(&mut client).await);

        wait_until_empty(&server.registry).await;
        assert!(server.registry.is_empty());
        assert_eq!(
            server.registry.stats().protocol_errors.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_disconnect_request() {
        let server = create_test_server(Policy::default()).await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        client.write_all(b"DISCONNECT\r\nCseq: 2\r\n\r\n").await.unwrap();
        let response = read_responses(&mut client, 1).await;
        assert!(response.starts_with("OK\r\nCseq: 2\r\nStatus: 0\r\n"));
        assert!(read_eof(&mut client).await);
    }

    #[tokio::test]
    async fn test_connection_stats() {
        let server = create_test_server(Policy::default()).await;
        let stats = server.registry.stats();

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);

        let mut client = TcpStream::connect(server.addr).await.unwrap();

        // Give the server time to accept the connection
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 1);

        client.write_all(b"CLIENT_COUNT\r\nCseq: 1\r\n\r\n").await.unwrap();
        let response = read_responses(&mut client, 1).await;
        assert!(response.contains("Num-Clients: 1\r\n"));

        drop(client);
        wait_until_empty(&server.registry).await;

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
        assert_eq!(stats.requests_completed.load(Ordering::Relaxed), 1);
        assert!(stats.bytes_read.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let server = create_test_server(Policy::default()).await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        client.write_all(b"PING\r\nCseq: 1\r\n\r\n").await.unwrap();
        read_responses(&mut client, 1).await;

        server.shutdown.send(()).unwrap();
        server.task.await.unwrap();

        assert!(server.registry.is_empty());
        assert!(read_eof(&mut client).await);
    }
}
