//! Request Handler
//!
//! Executes a parsed request in place: the handler sets `status`,
//! `status_msg` and response fields, and the worker hands the request back
//! to its connection for encoding.

use crate::connection::Registry;
use crate::protocol::Request;
use std::sync::Arc;
use std::time::Instant;

/// `EINVAL`
const EINVAL: i32 = 22;

/// Executes requests on a worker lane.
pub trait RequestHandler: Send + Sync {
    fn execute(&self, request: &mut Request);
}

/// Handles session and server requests.
#[derive(Clone)]
pub struct BasicHandler {
    /// Connection registry, for client queries
    registry: Arc<Registry>,
    /// Server start time for PING
    start_time: Instant,
}

impl BasicHandler {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            start_time: Instant::now(),
        }
    }

    /// PING
    fn op_ping(&self, request: &mut Request) {
        request.respond_with("System-Info", format!("metaconn/{}", crate::VERSION));
        request.respond_with("Uptime", self.start_time.elapsed().as_secs());
    }

    /// CLIENT_COUNT
    fn op_client_count(&self, request: &mut Request) {
        request.respond_with("Num-Clients", self.registry.len());
    }

    /// CLIENT_LIST
    fn op_client_list(&self, request: &mut Request) {
        let peers = self.registry.peers();
        let list = peers
            .iter()
            .map(|(_, peer)| peer.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        request.respond_with("Num-Clients", peers.len());
        request.respond_with("Clients", list);
    }
}

impl RequestHandler for BasicHandler {
    fn execute(&self, request: &mut Request) {
        match request.op.as_str() {
            "PING" => self.op_ping(request),
            "CLIENT_COUNT" => self.op_client_count(request),
            "CLIENT_LIST" => self.op_client_list(request),
            // The connection closes after sending the response.
            "DISCONNECT" => {}
            _ => {
                let msg = format!("unsupported request {}", request.op);
                request.fail(-EINVAL, msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn handler() -> (BasicHandler, Arc<Registry>) {
        let registry = Arc::new(Registry::new());
        (BasicHandler::new(Arc::clone(&registry)), registry)
    }

    #[test]
    fn test_ping() {
        let (handler, _) = handler();
        let mut req = Request::new(1, "PING");
        handler.execute(&mut req);
        assert_eq!(req.status, 0);
        assert!(req
            .response_fields
            .iter()
            .any(|(k, v)| k == "System-Info" && v.starts_with("metaconn/")));
    }

    #[test]
    fn test_client_count_and_list() {
        let (handler, registry) = handler();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register("10.0.0.1:5000".into(), tx.clone());
        registry.register("10.0.0.2:5001".into(), tx);

        let mut req = Request::new(2, "CLIENT_COUNT");
        handler.execute(&mut req);
        assert_eq!(
            req.response_fields,
            vec![("Num-Clients".to_string(), "2".to_string())]
        );

        let mut req = Request::new(3, "CLIENT_LIST");
        handler.execute(&mut req);
        let clients = &req.response_fields[1].1;
        assert!(clients.contains("10.0.0.1:5000"));
        assert!(clients.contains("10.0.0.2:5001"));
    }

    #[test]
    fn test_disconnect_succeeds() {
        let (handler, _) = handler();
        let mut req = Request::new(4, "DISCONNECT");
        handler.execute(&mut req);
        assert_eq!(req.status, 0);
        assert!(req.response_fields.is_empty());
    }

    #[test]
    fn test_unknown_request_fails() {
        let (handler, _) = handler();
        let mut req = Request::new(5, "MKDIR");
        handler.execute(&mut req);
        assert_eq!(req.status, -22);
        assert_eq!(req.status_msg, "unsupported request MKDIR");
    }
}
