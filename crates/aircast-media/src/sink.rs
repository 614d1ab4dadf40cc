// crates/aircast-media/src/sink.rs
//
// The TS sink: a dedicated mux thread between the tick engine and the
// viewers. Three contracts live here:
//
//   * Clock-paced emission — the mux loop waits for wall clock ≥ the frame's
//     composition time before dequeuing. Never emission-on-availability: the
//     engine may run a frame ahead, the wire must not.
//   * Non-blocking ingress — `offer` is try_send; the tick thread cannot be
//     stalled by the sink. Ingress overflow detaches the viewers (they are
//     hopelessly behind a real-time source) and drops the frame.
//   * No implicit EOF — the thread runs until an explicit stop. Producer EOF,
//     empty queues, block boundaries: none of them reach this layer.
//
// Boot liveness: from attach until the first media frame is muxed, PSI plus
// null packets go out every poll interval, so a joiner's demuxer locks onto
// the stream structure well inside 500 ms.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::BytesMut;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use aircast_core::anchor::{Clock, SessionAnchor};

use crate::egress::EgressSet;
use crate::encoder::{EncodedPacket, StreamKind};
use crate::ts::mux::TsMuxer;

/// One tick's encoded output, stamped with its grid composition time.
pub struct SinkFrame {
    /// Grid time of this tick in µs since session epoch.
    pub ct_us:   u64,
    pub packets: Vec<EncodedPacket>,
}

enum SinkMsg {
    Frame(SinkFrame),
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkOffer {
    Accepted,
    /// Ingress full: frame dropped, viewers detached.
    Overflow,
    /// Sink already stopped.
    Stopped,
}

/// Boot-window poll period; also bounds PSI+null cadence before first media.
const BOOT_POLL: Duration = Duration::from_millis(100);

pub struct TsSink {
    tx:        Sender<SinkMsg>,
    handle:    Option<JoinHandle<()>>,
    overflows: Arc<AtomicU64>,
    egress:    Arc<EgressSet>,
}

impl TsSink {
    pub fn start(
        clock: Arc<dyn Clock>,
        anchor: SessionAnchor,
        egress: Arc<EgressSet>,
        queue_frames: usize,
    ) -> Self {
        let (tx, rx) = bounded::<SinkMsg>(queue_frames);
        let overflows = Arc::new(AtomicU64::new(0));
        let thread_egress = Arc::clone(&egress);
        let handle = thread::Builder::new()
            .name("aircast-sink".into())
            .spawn(move || mux_loop(rx, clock, anchor, thread_egress))
            .expect("spawn sink mux thread");
        Self { tx, handle: Some(handle), overflows, egress }
    }

    /// Non-blocking hand-off from the tick thread. Invoked exactly once per
    /// tick, unconditionally — there is no code path that skips it.
    pub fn offer(&self, frame: SinkFrame) -> SinkOffer {
        match self.tx.try_send(SinkMsg::Frame(frame)) {
            Ok(()) => SinkOffer::Accepted,
            Err(TrySendError::Full(_)) => {
                self.overflows.fetch_add(1, Ordering::Relaxed);
                log::warn!("sink ingress overflow; dropping frame and detaching viewers");
                self.egress.detach_all();
                SinkOffer::Overflow
            }
            Err(TrySendError::Disconnected(_)) => SinkOffer::Stopped,
        }
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Explicit stop — the only way emission ends besides process death.
    pub fn stop(mut self) {
        let _ = self.tx.send(SinkMsg::Stop);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn mux_loop(
    rx: Receiver<SinkMsg>,
    clock: Arc<dyn Clock>,
    anchor: SessionAnchor,
    egress: Arc<EgressSet>,
) {
    let mut muxer = TsMuxer::new(StreamKind::Video);
    let mut buf = BytesMut::with_capacity(64 * 1024);
    let mut media_seen = false;

    loop {
        match rx.recv_timeout(BOOT_POLL) {
            Ok(SinkMsg::Frame(frame)) => {
                // clock-paced: hold until the wall clock reaches the frame's CT
                clock.sleep_until_mono_ns(anchor.epoch_mono_ns + frame.ct_us * 1000);

                buf.clear();
                for pkt in &frame.packets {
                    muxer.write_access_unit(&mut buf, pkt);
                    media_seen = true;
                }
                if !buf.is_empty() {
                    egress.broadcast(&buf);
                }
            }
            Ok(SinkMsg::Stop) => return,
            Err(RecvTimeoutError::Timeout) => {
                if !media_seen {
                    // boot window: keep the wire decodable before media exists
                    buf.clear();
                    muxer.write_psi(&mut buf);
                    for _ in 0..4 {
                        muxer.write_null(&mut buf);
                    }
                    egress.broadcast(&buf);
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aircast_core::anchor::FakeClock;
    use std::sync::atomic::AtomicUsize;

    use crate::egress::ByteSink;

    struct CountingSink {
        bytes: Arc<AtomicUsize>,
    }

    impl ByteSink for CountingSink {
        fn write_bytes(&mut self, chunk: &[u8]) -> usize {
            self.bytes.fetch_add(chunk.len(), Ordering::Relaxed);
            chunk.len()
        }

        fn is_detached(&self) -> bool {
            false
        }
    }

    fn attach_counter(egress: &EgressSet) -> Arc<AtomicUsize> {
        let bytes = Arc::new(AtomicUsize::new(0));
        egress.attach(
            uuid::Uuid::new_v4(),
            Box::new(CountingSink { bytes: Arc::clone(&bytes) }),
        );
        bytes
    }

    #[test]
    fn boot_window_emits_psi_and_nulls_before_media() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(0));
        let anchor = SessionAnchor::at(0, 0);
        let egress = Arc::new(EgressSet::new());
        let bytes = attach_counter(&egress);

        let sink = TsSink::start(clock, anchor, Arc::clone(&egress), 8);
        // two boot polls are plenty to observe PSI+null fill
        std::thread::sleep(Duration::from_millis(350));
        sink.stop();

        let n = bytes.load(Ordering::Relaxed);
        assert!(n >= 188 * 6, "expected boot-window packets, got {n} bytes");
        assert_eq!(n % 188, 0);
    }

    /// Viewer whose writes stall, wedging the mux thread in broadcast.
    struct SlowSink;

    impl ByteSink for SlowSink {
        fn write_bytes(&mut self, chunk: &[u8]) -> usize {
            std::thread::sleep(Duration::from_millis(200));
            chunk.len()
        }

        fn is_detached(&self) -> bool {
            false
        }
    }

    fn media_frame(ct_us: u64) -> SinkFrame {
        SinkFrame {
            ct_us,
            packets: vec![EncodedPacket {
                kind:    StreamKind::Video,
                data:    vec![0u8; 256],
                pts_90k: 0,
                dts_90k: 0,
                key:     true,
            }],
        }
    }

    #[test]
    fn ingress_overflow_detaches_and_never_blocks() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(0));
        let anchor = SessionAnchor::at(0, 0);
        let egress = Arc::new(EgressSet::new());
        egress.attach(uuid::Uuid::new_v4(), Box::new(SlowSink));

        let sink = TsSink::start(Arc::clone(&clock), anchor, Arc::clone(&egress), 1);
        // first frame wedges the mux thread inside the slow broadcast; the
        // second fills the one-slot queue; the third must overflow
        let mut overflowed = false;
        for n in 0..16 {
            let offer = sink.offer(media_frame(n * 33_333));
            overflowed |= offer == SinkOffer::Overflow;
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(overflowed);
        assert!(sink.overflow_count() > 0);
        assert_eq!(egress.viewer_count(), 0, "viewers detached on overflow");
        sink.stop();
    }
}
