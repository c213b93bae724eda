//! Worker Pool
//!
//! A fixed set of worker lanes, each a tokio task draining its own bounded
//! queue. A connection is pinned to lane `id % lanes`, so all of its requests
//! execute one at a time and complete in the order they were submitted.

use crate::connection::{ConnectionId, Registry};
use crate::dispatch::WorkerDispatch;
use crate::ops::RequestHandler;
use crate::protocol::Request;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct WorkerPool {
    lanes: Vec<mpsc::Sender<Box<Request>>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `lanes` workers, each accepting up to `queue_depth` queued
    /// requests. Must be called from within a tokio runtime.
    pub fn start(
        lanes: usize,
        queue_depth: usize,
        handler: Arc<dyn RequestHandler>,
        registry: Arc<Registry>,
    ) -> Self {
        let lanes = lanes.max(1);
        let mut senders = Vec::with_capacity(lanes);
        let mut workers = Vec::with_capacity(lanes);

        for lane in 0..lanes {
            let (tx, rx) = mpsc::channel(queue_depth.max(1));
            senders.push(tx);
            workers.push(tokio::spawn(worker_loop(
                lane,
                rx,
                Arc::clone(&handler),
                Arc::clone(&registry),
            )));
        }

        info!(lanes = lanes, queue_depth = queue_depth, "Worker pool started");
        Self {
            lanes: senders,
            workers,
        }
    }

    fn lane_for(&self, conn: Option<ConnectionId>) -> usize {
        conn.map_or(0, |id| (id.as_u64() % self.lanes.len() as u64) as usize)
    }
}

impl WorkerDispatch for WorkerPool {
    fn submit(&self, request: Box<Request>) -> Result<(), Box<Request>> {
        let lane = self.lane_for(request.conn);
        match self.lanes[lane].try_send(request) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(request)) => {
                debug!(lane = lane, seq = request.seq, "Worker queue full");
                Err(request)
            }
            Err(TrySendError::Closed(request)) => {
                warn!(lane = lane, seq = request.seq, "Worker lane stopped");
                Err(request)
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

async fn worker_loop(
    lane: usize,
    mut rx: mpsc::Receiver<Box<Request>>,
    handler: Arc<dyn RequestHandler>,
    registry: Arc<Registry>,
) {
    while let Some(mut request) = rx.recv().await {
        handler.execute(&mut request);
        registry.complete(request);
    }
    debug!(lane = lane, "Worker lane stopped");
}
