//! Connection Module
//!
//! This module manages client sessions of the metadata server. Each accepted
//! client gets a [`Connection`] state machine, driven by its own async task
//! ([`serve_connection`]) and registered in the process-wide [`Registry`].
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TCP Listener                            │
//! │                    (server.rs)                              │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ accept(), spawn serve_connection
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Connection (per client)                     │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │ Read bytes  │───>│ Frame/parse │───>│ Submit      │──┐   │
//! │  └─────────────┘    └─────────────┘    └─────────────┘  │   │
//! │                                                         │   │
//! │  ┌─────────────┐    ┌─────────────┐                     │   │
//! │  │ Flush       │<───│ Encode resp │<── Completed ──┐    │   │
//! │  └─────────────┘    └─────────────┘                │    │   │
//! └────────────────────────────────────────────────────┼────┼───┘
//!                                                      │    ▼
//!                            Registry mailbox <── WorkerPool
//! ```
//!
//! ## Features
//!
//! - **Pipelining**: Many requests may be in flight; responses keep order
//! - **Flow Control**: Reads pause while requests, output, or input back up
//! - **Graceful Close**: A closing client still gets its outstanding answers
//! - **Statistics**: Tracks connection, request, and byte counts

pub mod driver;
pub mod handler;
pub mod registry;

// Re-export commonly used types
pub use driver::serve_connection;
pub use handler::{Connection, ConnectionError, Disposition, Event, WorkerContext};
pub use registry::{ConnectionId, ConnectionStats, Mail, Mailbox, Registry};
