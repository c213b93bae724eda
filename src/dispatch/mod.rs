//! Worker Dispatch
//!
//! Connections parse requests but never execute them. A parsed request is
//! submitted to a [`WorkerDispatch`], executed asynchronously, and its
//! completion comes back to the originating connection as a `Completed`
//! event, routed through the connection registry.
//!
//! ```text
//!   Connection ──submit──> WorkerDispatch ──> RequestHandler::execute
//!        ▲                                          │
//!        └──── Registry::complete (mailbox) <───────┘
//! ```
//!
//! ## Ordering
//!
//! Completions for one connection must arrive in submission order, since
//! responses are written in completion order. [`WorkerPool`] guarantees this
//! by pinning each connection to a single worker lane.
//!
//! ## Rejection
//!
//! `submit()` may refuse a request when the lane queue is full. The request
//! is handed back; the connection holds it and offers it again later. A
//! rejection is flow control, not an error.

pub mod pool;

pub use pool::WorkerPool;

use crate::connection::ConnectionId;
use crate::protocol::Request;

pub trait WorkerDispatch: Send + Sync {
    /// Queues a request for execution, or hands it back when the queue is
    /// full.
    fn submit(&self, request: Box<Request>) -> Result<(), Box<Request>>;

    /// Gives the dispatcher a chance to flush the connection's output as
    /// part of a batch. Returns true when it took care of the flush.
    fn flush(&self, _conn: ConnectionId) -> bool {
        false
    }
}
