//! Throughput Benchmark for metaconn
//!
//! This benchmark measures request framing, parsing and response encoding,
//! and full connection turns over an in-memory transport.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use metaconn::audit::TracingAuditLog;
use metaconn::config::{shared_policy, Policy};
use metaconn::connection::{Connection, ConnectionId, Event, Registry, WorkerContext};
use metaconn::dispatch::WorkerDispatch;
use metaconn::protocol::{HeaderCodec, Request, RequestCodec};
use metaconn::transport::MemoryTransport;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const REQUEST: &[u8] = b"PING\r\nCseq: 12345\r\nClient-Protocol-Version: 114\r\nPath: /a/b/c\r\n\r\n";

/// Benchmark framing and parsing one request header
fn bench_parse(c: &mut Criterion) {
    let codec = HeaderCodec::new();

    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Bytes(REQUEST.len() as u64));

    group.bench_function("frame_len", |b| {
        b.iter(|| codec.frame_len(black_box(REQUEST)));
    });

    group.bench_function("parse", |b| {
        b.iter(|| codec.parse(black_box(REQUEST)).unwrap());
    });

    group.finish();
}

/// Benchmark encoding responses
fn bench_encode(c: &mut Criterion) {
    let codec = HeaderCodec::new();
    let mut request = Request::new(12345, "PING");
    request.respond_with("System-Info", "metaconn/bench");
    request.respond_with("Uptime", 42);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));

    group.bench_function("encode_response", |b| {
        let mut out = BytesMut::with_capacity(4096);
        b.iter(|| {
            out.clear();
            codec.encode(black_box(&request), &mut out);
        });
    });

    group.finish();
}

/// Accepts every submission and keeps it for the benchmark to complete.
#[derive(Default)]
struct Inline {
    queued: Mutex<Vec<Box<Request>>>,
}

impl WorkerDispatch for Inline {
    fn submit(&self, request: Box<Request>) -> Result<(), Box<Request>> {
        self.queued.lock().unwrap().push(request);
        Ok(())
    }

    fn flush(&self, _conn: ConnectionId) -> bool {
        false
    }
}

/// Benchmark a pipelined batch through the connection state machine
fn bench_connection(c: &mut Criterion) {
    const BATCH: usize = 64;

    let dispatch = Arc::new(Inline::default());
    let ctx = WorkerContext {
        registry: Arc::new(Registry::new()),
        dispatch: dispatch.clone(),
        codec: Arc::new(HeaderCodec::new()),
        audit: Arc::new(TracingAuditLog),
        policy: shared_policy(Policy {
            max_pending_ops: BATCH,
            max_pending_bytes: 1 << 20,
            max_read_ahead: 1 << 20,
            max_write_behind: 1 << 20,
            ..Policy::default()
        }),
    };
    let (tx, _rx) = mpsc::unbounded_channel();
    let transport = MemoryTransport::new("127.0.0.1:1");
    let probe = transport.probe();
    let mut conn = Connection::new(transport, ctx, tx).unwrap();
    let batch: Vec<u8> = REQUEST.repeat(BATCH);

    let mut group = c.benchmark_group("connection");
    group.throughput(Throughput::Elements(BATCH as u64));

    group.bench_function("pipelined_batch", |b| {
        b.iter(|| {
            conn.transport_mut().unwrap().feed(&batch);
            conn.handle_event(Event::Readable);
            let completed: Vec<_> = dispatch.queued.lock().unwrap().drain(..).collect();
            for request in completed {
                conn.handle_event(Event::Completed(request));
            }
            conn.transport_mut().unwrap().drain(usize::MAX);
            conn.handle_event(Event::Wrote);
            black_box(probe.take_wire());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_parse, bench_encode, bench_connection);
criterion_main!(benches);
