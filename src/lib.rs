//! # metaconn - Client Connection Layer of a Metadata Server
//!
//! metaconn is the per-client session layer of a distributed file system
//! metadata server. It reads pipelined text requests from each client,
//! hands them to a pool of workers, and writes the responses back in order,
//! while keeping every connection within configurable resource ceilings.
//!
//! ## Features
//!
//! - **Pipelining**: Many requests in flight per client, answered in order
//! - **Flow Control**: Reads pause while requests, output, or input back up
//! - **Graceful Close**: Outstanding requests are answered before closing
//! - **Live Reconfiguration**: Ceilings can be changed while serving
//! - **Audit Logging**: Optional per-request log of the raw header
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              metaconn                                   │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ TCP Server  │───>│ Connection  │───>│ WorkerPool  │                  │
//! │  │ (Listener)  │    │ (per client)│    │  (lanes)    │                  │
//! │  └─────────────┘    └──────▲──────┘    └──────┬──────┘                  │
//! │                            │                  │ execute                 │
//! │                            │                  ▼                         │
//! │  ┌─────────────┐    ┌──────┴──────┐    ┌─────────────┐                  │
//! │  │ HeaderCodec │    │  Registry   │<───│  Request    │                  │
//! │  │             │    │ (mailboxes) │    │  Handler    │                  │
//! │  └─────────────┘    └─────────────┘    └─────────────┘                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use metaconn::config::{shared_policy, Policy, ServerConfig};
//! use metaconn::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Server::new(ServerConfig::default(), shared_policy(Policy::default()));
//!     let listener = server.bind().await?;
//!     server.run(listener, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     }).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Wire Format
//!
//! A request is a header block: an op line, then `Name: value` lines, then a
//! blank line.
//!
//! ```text
//! PING\r\n
//! Cseq: 1\r\n
//! Client-Protocol-Version: 114\r\n
//! \r\n
//! ```
//!
//! A response echoes the sequence number and carries a status:
//!
//! ```text
//! OK\r\n
//! Cseq: 1\r\n
//! Status: 0\r\n
//! System-Info: metaconn/0.1.0\r\n
//! \r\n
//! ```
//!
//! ## Module Overview
//!
//! - [`connection`]: Per-client state machine, driver task, and registry
//! - [`transport`]: Buffered byte streams the state machine works against
//! - [`protocol`]: Request type and the header codec
//! - [`dispatch`]: Worker submission and the worker pool
//! - [`ops`]: Request execution
//! - [`audit`]: Audit logging of completed requests
//! - [`config`]: Properties, flow-control policy, and server settings
//! - [`server`]: TCP listener and graceful shutdown
//!
//! ## Design Highlights
//!
//! ### Connections Outlive Their Requests
//!
//! Workers route completions back by [`connection::ConnectionId`]. A
//! connection whose socket fails stays registered until the last
//! outstanding request has completed, so a completion always finds its
//! connection.
//!
//! ### Order Without Locks
//!
//! Each connection is pinned to one worker lane. Requests from one client
//! therefore execute in arrival order and responses are written in that
//! order, without any per-connection locking.

pub mod audit;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod ops;
pub mod protocol;
pub mod server;
pub mod transport;

// Re-export commonly used types for convenience
pub use config::{Policy, Properties, ServerConfig, SharedPolicy};
pub use connection::{serve_connection, Connection, ConnectionId, Disposition, Event, Registry};
pub use protocol::{HeaderCodec, ParseError, Request, RequestCodec};
pub use server::Server;

/// The default client port
pub const DEFAULT_PORT: u16 = 20000;

/// The default host the client listener binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of metaconn
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
