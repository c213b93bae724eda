//! Request Execution
//!
//! The worker pool runs every request through a [`RequestHandler`]. The
//! namespace itself lives elsewhere; [`BasicHandler`] answers the requests
//! that concern the client session and the server process:
//!
//! ```text
//! ┌─────────────────┐
//! │  WorkerPool     │  (dispatch module)
//! └────────┬────────┘
//!          │ execute(&mut Request)
//!          ▼
//! ┌─────────────────┐
//! │ RequestHandler  │  (this module)
//! │                 │
//! │  - Dispatch     │
//! │  - Validate     │
//! │  - Set status   │
//! └─────────────────┘
//! ```
//!
//! ## Supported Requests
//!
//! - `PING` - liveness check; reports server version and uptime
//! - `CLIENT_COUNT` - number of connected clients
//! - `CLIENT_LIST` - peers of connected clients
//! - `DISCONNECT` - close the session once the response is sent

pub mod handler;

pub use handler::{BasicHandler, RequestHandler};
