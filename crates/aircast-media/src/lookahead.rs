// crates/aircast-media/src/lookahead.rs
//
// Dual look-ahead buffers (video + audio) with slot-based gating, and the
// fill-thread lifecycle around them.
//
// Back-pressure contract: the fill side blocks on a condition variable while
// `depth >= target`; each consumer pop frees exactly one slot and wakes it.
// No hysteresis, no low-water drain — one pop, one slot. The consumer side
// never blocks and never fabricates: `try_pop` returns the frame or nothing,
// and the emit path upstream decides freeze-or-pad.
//
// Audio is a side-effect of the same demux loop that feeds video, so when the
// video gate blocks the producer, audio production stops with it — the A/V
// pair is gated symmetrically by construction. Audio pushes themselves never
// block and never drop: a backlog of decoded audio is legal, CT wins at emit
// time.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::frame::{HouseAudioFrame, HouseVideoFrame};

// ── Video queue ───────────────────────────────────────────────────────────────

struct VideoState {
    frames:       VecDeque<HouseVideoFrame>,
    target:       usize,
    cap:          usize,
    eof:          bool,
    stopped:      bool,
    fill_running: bool,
    /// High-water mark, for the depth-oscillation invariant.
    peak_depth:   usize,
}

struct VideoShared {
    state:     Mutex<VideoState>,
    slot_free: Condvar,
}

/// Bounded video look-ahead. Single producer (the fill thread), single
/// consumer (the tick thread).
pub struct FrameQueue {
    shared: Arc<VideoShared>,
}

impl FrameQueue {
    pub fn new(target: usize, cap: usize) -> Self {
        assert!(cap > target && target > 0, "lookahead cap must exceed target");
        Self {
            shared: Arc::new(VideoShared {
                state: Mutex::new(VideoState {
                    frames:       VecDeque::with_capacity(cap),
                    target,
                    cap,
                    eof:          false,
                    stopped:      false,
                    fill_running: false,
                    peak_depth:   0,
                }),
                slot_free: Condvar::new(),
            }),
        }
    }

    /// Pop one frame, or nothing. Wakes the fill thread by one slot either
    /// way — an empty pop still signals demand.
    pub fn try_pop(&self) -> Option<HouseVideoFrame> {
        let mut st = self.shared.state.lock().unwrap();
        let frame = st.frames.pop_front();
        drop(st);
        self.shared.slot_free.notify_one();
        frame
    }

    pub fn depth(&self) -> usize {
        self.shared.state.lock().unwrap().frames.len()
    }

    pub fn peak_depth(&self) -> usize {
        self.shared.state.lock().unwrap().peak_depth
    }

    pub fn is_eof(&self) -> bool {
        self.shared.state.lock().unwrap().eof
    }

    /// EOF signalled and every buffered frame consumed.
    pub fn eof_drained(&self) -> bool {
        let st = self.shared.state.lock().unwrap();
        st.eof && st.frames.is_empty()
    }

    fn endpoint(&self) -> FrameQueueEndpoint {
        FrameQueueEndpoint { shared: Arc::clone(&self.shared) }
    }
}

impl Drop for FrameQueue {
    fn drop(&mut self) {
        // Destroying a buffer under a live fill thread is a programmer error,
        // not a runtime condition — the thread would push into freed slots.
        let st = self.shared.state.lock().unwrap();
        if st.fill_running {
            panic!("FrameQueue dropped while its fill thread is running");
        }
    }
}

/// Producer-side handle held by the fill thread.
pub struct FrameQueueEndpoint {
    shared: Arc<VideoShared>,
}

impl FrameQueueEndpoint {
    /// Push one frame, blocking on the slot gate while `depth >= target`.
    /// Returns `false` once the queue has been stopped — the fill loop's exit
    /// signal. Frames are never dropped under back-pressure.
    pub fn push(&self, frame: HouseVideoFrame) -> bool {
        let mut st = self.shared.state.lock().unwrap();
        while st.frames.len() >= st.target && !st.stopped {
            st = self.shared.slot_free.wait(st).unwrap();
        }
        if st.stopped {
            return false;
        }
        debug_assert!(st.frames.len() < st.cap);
        st.frames.push_back(frame);
        let depth = st.frames.len();
        if depth > st.peak_depth {
            st.peak_depth = depth;
        }
        true
    }

    /// Signal end of content. Idempotent; the producer calls it exactly once.
    pub fn mark_eof(&self) {
        self.shared.state.lock().unwrap().eof = true;
    }

    pub fn stopped(&self) -> bool {
        self.shared.state.lock().unwrap().stopped
    }
}

// ── Audio queue ───────────────────────────────────────────────────────────────

/// Audio look-ahead: never blocks, never drops. Bounded in practice by the
/// video gate (the shared demux loop stops producing when video blocks).
pub struct SampleQueue {
    inner: Arc<Mutex<VecDeque<HouseAudioFrame>>>,
}

impl SampleQueue {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(VecDeque::new())) }
    }

    pub fn push(&self, frame: HouseAudioFrame) {
        if frame.samples() == 0 {
            return;
        }
        self.inner.lock().unwrap().push_back(frame);
    }

    pub fn try_pop(&self) -> Option<HouseAudioFrame> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn buffered_samples(&self) -> usize {
        self.inner.lock().unwrap().iter().map(|f| f.samples()).sum()
    }

    pub fn handle(&self) -> SampleQueue {
        SampleQueue { inner: Arc::clone(&self.inner) }
    }
}

impl Default for SampleQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ── Producer seam ─────────────────────────────────────────────────────────────

/// Push endpoints lent to a producer: the look-ahead stays owned by the
/// pipeline; producers only ever see the filling side.
pub struct FillQueues {
    pub video: FrameQueueEndpoint,
    pub audio: SampleQueue,
}

/// Capability seam: anything that can prime and then fill a block's buffers.
/// The file producer is the production implementation; tests substitute
/// synthetic sources.
pub trait FrameProducer: Send + 'static {
    /// Decode and buffer the first video frame and its audio. A latency
    /// optimisation only — fence timing never waits for priming.
    fn prime(&mut self, queues: &FillQueues) -> anyhow::Result<()>;

    /// Fill until EOF or until the queue is stopped. Must call
    /// `queues.video.mark_eof()` exactly once on content exhaustion.
    fn run(&mut self, queues: &FillQueues);
}

// ── Block buffers + fill lifecycle ────────────────────────────────────────────

/// The A/V look-ahead pair for one live segment, plus its fill thread.
pub struct BlockBuffers {
    pub video: FrameQueue,
    pub audio: SampleQueue,
    fill:      Option<FillHandle>,
}

struct FillHandle {
    handle: JoinHandle<()>,
}

impl BlockBuffers {
    pub fn new(target: usize, cap: usize) -> Self {
        Self {
            video: FrameQueue::new(target, cap),
            audio: SampleQueue::new(),
            fill:  None,
        }
    }

    pub fn fill_queues(&self) -> FillQueues {
        FillQueues {
            video: self.video.endpoint(),
            audio: self.audio.handle(),
        }
    }

    /// Exactly one StartFilling per buffer set. The thread owns the producer;
    /// the buffers stay here.
    pub fn start_filling(&mut self, mut producer: Box<dyn FrameProducer>) {
        assert!(self.fill.is_none(), "fill thread already started");
        let queues = self.fill_queues();
        {
            let mut st = self.video.shared.state.lock().unwrap();
            st.fill_running = true;
        }
        let shared = Arc::clone(&self.video.shared);
        let handle = thread::Builder::new()
            .name("aircast-fill".into())
            .spawn(move || {
                producer.run(&queues);
                shared.state.lock().unwrap().fill_running = false;
            })
            .expect("spawn fill thread");
        self.fill = Some(FillHandle { handle });
    }

    pub fn fill_running(&self) -> bool {
        self.video.shared.state.lock().unwrap().fill_running
    }

    fn request_stop(&self) {
        let mut st = self.video.shared.state.lock().unwrap();
        st.stopped = true;
        drop(st);
        self.shared_notify_all();
    }

    fn shared_notify_all(&self) {
        self.video.shared.slot_free.notify_all();
    }

    /// Synchronous StopFilling: unblock and join the fill thread. Matched
    /// one-to-one with `start_filling`.
    pub fn stop_filling(&mut self) {
        if let Some(fill) = self.fill.take() {
            self.request_stop();
            if fill.handle.join().is_err() {
                log::error!("fill thread panicked during stop");
            }
        }
    }

    /// Async StopFilling: unblock the thread and hand its join handle out for
    /// deferred reaping. The buffers must travel with the handle — a reaped
    /// thread may still touch them until the join completes.
    pub fn stop_filling_async(mut self) -> Retired {
        self.request_stop();
        let handle = self.fill.take().map(|f| f.handle);
        Retired { handle, buffers: Some(self) }
    }
}

/// A retired buffer set awaiting its deferred join.
pub struct Retired {
    handle:  Option<JoinHandle<()>>,
    // Kept alive until the join completes: the buffers must not become
    // unreachable while their fill thread can still run.
    buffers: Option<BlockBuffers>,
}

impl Retired {
    /// Join the detached fill thread and release the buffers.
    pub fn reap(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("fill thread panicked before reap");
            }
        }
        drop(self.buffers.take());
    }
}
