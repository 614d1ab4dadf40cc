// crates/aircast-media/src/egress.rs
//
// Socket egress: the only place bytes leave the process. Each viewer gets a
// byte-bounded queue (bounded in bytes, not chunks — a chunk bound lies when
// chunk sizes vary) drained by a dedicated writer thread. The muxer-facing
// side never blocks and always reports the chunk as consumed: EPIPE, closed
// fds and queue overflow all collapse into a local detach. A detached viewer
// behaves as a null sink; the session never notices.

use std::collections::VecDeque;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use uuid::Uuid;

/// Anything that accepts a run of TS bytes. Implementations must be
/// non-blocking and must report the full chunk as consumed.
pub trait ByteSink: Send {
    fn write_bytes(&mut self, chunk: &[u8]) -> usize;
    fn is_detached(&self) -> bool;
}

/// Absorbs everything. A detached viewer's stand-in.
pub struct NullSink;

impl ByteSink for NullSink {
    fn write_bytes(&mut self, chunk: &[u8]) -> usize {
        chunk.len()
    }

    fn is_detached(&self) -> bool {
        true
    }
}

// ── Socket egress ─────────────────────────────────────────────────────────────

struct ByteQueue {
    chunks:   VecDeque<Vec<u8>>,
    bytes:    usize,
    cap:      usize,
    closed:   bool,
    detached: bool,
}

struct EgressShared {
    q:     Mutex<ByteQueue>,
    ready: Condvar,
}

/// One viewer's connection: bounded byte queue + writer thread.
pub struct SocketEgress {
    shared: Arc<EgressShared>,
    writer: Option<JoinHandle<()>>,
}

impl SocketEgress {
    pub fn start(mut stream: TcpStream, queue_bytes: usize) -> Self {
        let shared = Arc::new(EgressShared {
            q: Mutex::new(ByteQueue {
                chunks:   VecDeque::new(),
                bytes:    0,
                cap:      queue_bytes,
                closed:   false,
                detached: false,
            }),
            ready: Condvar::new(),
        });

        let writer_shared = Arc::clone(&shared);
        let writer = thread::Builder::new()
            .name("aircast-egress".into())
            .spawn(move || loop {
                let chunk = {
                    let mut q = writer_shared.q.lock().unwrap();
                    while q.chunks.is_empty() && !q.closed && !q.detached {
                        q = writer_shared.ready.wait(q).unwrap();
                    }
                    if q.detached || (q.closed && q.chunks.is_empty()) {
                        return;
                    }
                    let chunk = q.chunks.pop_front().unwrap();
                    q.bytes -= chunk.len();
                    chunk
                };
                // the only blocking send in the whole path — invisible upstream
                if let Err(e) = stream.write_all(&chunk) {
                    log::info!("egress socket write failed ({e}); detaching viewer");
                    let mut q = writer_shared.q.lock().unwrap();
                    q.detached = true;
                    q.chunks.clear();
                    q.bytes = 0;
                    return;
                }
            })
            .expect("spawn egress writer");

        Self { shared, writer: Some(writer) }
    }

    /// Detach this viewer: stop the writer, drop queued bytes.
    pub fn detach(&self) {
        let mut q = self.shared.q.lock().unwrap();
        q.detached = true;
        q.chunks.clear();
        q.bytes = 0;
        drop(q);
        self.shared.ready.notify_all();
    }

    fn close(&mut self) {
        {
            let mut q = self.shared.q.lock().unwrap();
            q.closed = true;
        }
        self.shared.ready.notify_all();
        if let Some(w) = self.writer.take() {
            let _ = w.join();
        }
    }
}

impl ByteSink for SocketEgress {
    /// Non-blocking enqueue. Overflow means the consumer is slower than the
    /// channel's real-time rate: detach, never stall. Always returns
    /// `chunk.len()` — the muxer is not allowed to see partial writes.
    fn write_bytes(&mut self, chunk: &[u8]) -> usize {
        let mut q = self.shared.q.lock().unwrap();
        if q.detached {
            return chunk.len();
        }
        if q.bytes + chunk.len() > q.cap {
            log::warn!(
                "egress queue overflow ({} + {} > {} bytes); slow-consumer detach",
                q.bytes,
                chunk.len(),
                q.cap
            );
            q.detached = true;
            q.chunks.clear();
            q.bytes = 0;
            drop(q);
            self.shared.ready.notify_all();
            return chunk.len();
        }
        q.bytes += chunk.len();
        q.chunks.push_back(chunk.to_vec());
        drop(q);
        self.shared.ready.notify_one();
        chunk.len()
    }

    fn is_detached(&self) -> bool {
        self.shared.q.lock().unwrap().detached
    }
}

impl Drop for SocketEgress {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Viewer registry ───────────────────────────────────────────────────────────

/// The sink's fan-out set. Attach is idempotent per viewer id; detached
/// viewers are swept out on the next broadcast.
pub struct EgressSet {
    viewers:  Mutex<Vec<(Uuid, Box<dyn ByteSink>)>>,
    detaches: AtomicU64,
}

impl EgressSet {
    pub fn new() -> Self {
        Self { viewers: Mutex::new(Vec::new()), detaches: AtomicU64::new(0) }
    }

    /// Returns false when the id is already attached (idempotent attach).
    pub fn attach(&self, id: Uuid, sink: Box<dyn ByteSink>) -> bool {
        let mut v = self.viewers.lock().unwrap();
        if v.iter().any(|(vid, _)| *vid == id) {
            return false;
        }
        v.push((id, sink));
        true
    }

    pub fn detach(&self, id: Uuid) -> bool {
        let mut v = self.viewers.lock().unwrap();
        let before = v.len();
        v.retain(|(vid, _)| *vid != id);
        before != v.len()
    }

    pub fn detach_all(&self) {
        let mut v = self.viewers.lock().unwrap();
        self.detaches.fetch_add(v.len() as u64, Ordering::Relaxed);
        v.clear();
    }

    /// Hand bytes to every attached viewer, sweeping out the detached ones.
    /// Returns how many viewers remain attached.
    pub fn broadcast(&self, chunk: &[u8]) -> usize {
        let mut v = self.viewers.lock().unwrap();
        for (_, sink) in v.iter_mut() {
            sink.write_bytes(chunk);
        }
        let before = v.len();
        v.retain(|(_, sink)| !sink.is_detached());
        let removed = before - v.len();
        if removed > 0 {
            self.detaches.fetch_add(removed as u64, Ordering::Relaxed);
        }
        v.len()
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.lock().unwrap().len()
    }

    pub fn detach_count(&self) -> u64 {
        self.detaches.load(Ordering::Relaxed)
    }
}

impl Default for EgressSet {
    fn default() -> Self {
        Self::new()
    }
}
