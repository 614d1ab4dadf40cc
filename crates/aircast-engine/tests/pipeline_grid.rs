// crates/aircast-engine/tests/pipeline_grid.rs
//
// Tick-grid semantics of the pipeline manager, driven deterministically:
// FakeClock for the deadline discipline, a recorder emit stage in place of
// the encoder chain, synthetic producers in place of ffmpeg. Each case
// asserts the engine-level properties: one frame per tick, the frame-budget
// identity, monotone PTS, attribution of fallback output.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use aircast_core::anchor::{FakeClock, SessionAnchor};
use aircast_core::attribution::{EmitKind, PadReason};
use aircast_core::block::{Block, Segment, SegmentKind};
use aircast_core::boundary::BoundaryState;
use aircast_core::clock::FrameRate;
use aircast_core::config::{AudioParams, ChannelConfig, LookaheadParams, VideoParams};
use aircast_core::store::ScheduleStore;
use aircast_engine::emit::EmitStage;
use aircast_engine::event::{EngineEvent, EventHub};
use aircast_engine::pipeline::PipelineManager;
use aircast_engine::preloader::ProducerFactory;
use aircast_engine::session::SharedState;
use aircast_media::frame::{HouseAudioFrame, HouseVideoFrame};
use aircast_media::lookahead::{FillQueues, FrameProducer};
use aircast_media::sink::SinkOffer;

const EPOCH_MS: i64 = 1_738_987_200_000;
const BLACK: u8 = 16;
/// Samples per tick at 44100 Hz / 30 fps.
const SPT: usize = 1470;

// ── Test rig ──────────────────────────────────────────────────────────────────

fn cfg() -> Arc<ChannelConfig> {
    Arc::new(ChannelConfig {
        video: VideoParams {
            width:    4,
            height:   2,
            rate:     FrameRate::new(30, 1).unwrap(),
            gop_size: 30,
            bitrate:  1_000_000,
        },
        audio: AudioParams { sample_rate: 44_100, channels: 2, bitrate: 128_000 },
        // wide gate so synthetic producers can prime a whole segment at once
        lookahead: LookaheadParams { target: 64, cap: 128 },
        grace_timeout_ms: 1_000,
        locked_window_ms: 2 * 60 * 60 * 1000,
        egress_queue_bytes: 4 * 1024 * 1024,
        sink_queue_frames: 64,
    })
}

#[derive(Clone, Copy, Debug)]
struct Rec {
    tick:    u64,
    pts:     i64,
    tag:     u8,
    videos:  u32,
    audio:   usize,
    silence: usize,
}

struct Recorder {
    out:            Arc<Mutex<Vec<Rec>>>,
    segments_begun: Arc<AtomicUsize>,
    pend_tag:     u8,
    pend_pts:     i64,
    pend_videos:  u32,
    pend_audio:   usize,
    pend_silence: usize,
}

impl Recorder {
    fn new() -> (Self, Arc<Mutex<Vec<Rec>>>, Arc<AtomicUsize>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let segs = Arc::new(AtomicUsize::new(0));
        (
            Self {
                out: Arc::clone(&out),
                segments_begun: Arc::clone(&segs),
                pend_tag: 0,
                pend_pts: 0,
                pend_videos: 0,
                pend_audio: 0,
                pend_silence: 0,
            },
            out,
            segs,
        )
    }
}

impl EmitStage for Recorder {
    fn begin_segment(&mut self) {
        self.segments_begun.fetch_add(1, Ordering::SeqCst);
    }

    fn video(&mut self, pts_90k: i64, yuv: &[u8]) -> anyhow::Result<()> {
        self.pend_tag = yuv[0];
        self.pend_pts = pts_90k;
        self.pend_videos += 1;
        Ok(())
    }

    fn audio(&mut self, frame: &HouseAudioFrame) {
        self.pend_audio += frame.samples();
    }

    fn silence(&mut self, samples: usize) {
        self.pend_silence += samples;
    }

    fn finish_tick(&mut self, tick: u64, _ct_us: u64) -> SinkOffer {
        self.out.lock().unwrap().push(Rec {
            tick,
            pts: self.pend_pts,
            tag: self.pend_tag,
            videos: self.pend_videos,
            audio: self.pend_audio,
            silence: self.pend_silence,
        });
        self.pend_videos = 0;
        self.pend_audio = 0;
        self.pend_silence = 0;
        SinkOffer::Accepted
    }

    fn finish(&mut self) {}
}

/// Synthetic source: `frames` video frames (tags `base..base+frames`) plus
/// one audio frame per video frame, all primed up front. `signal_eof` false
/// models a producer that stalls without ever finishing.
struct TestProducer {
    frames:     u64,
    base:       u8,
    signal_eof: bool,
}

impl FrameProducer for TestProducer {
    fn prime(&mut self, queues: &FillQueues) -> anyhow::Result<()> {
        for n in 0..self.frames {
            let frame = HouseVideoFrame {
                yuv: vec![self.base + n as u8; HouseVideoFrame::packed_len(4, 2)],
                media_ct_ms: n as i64 * 33,
            };
            queues.video.push(frame);
            queues.audio.push(HouseAudioFrame::silence(SPT, 44_100, n as i64 * 33));
        }
        if self.signal_eof {
            queues.video.mark_eof();
        }
        Ok(())
    }

    fn run(&mut self, queues: &FillQueues) {
        while !self.signal_eof && !queues.video.stopped() {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}

fn segment(kind: SegmentKind, frames: u64, uri: Option<&str>) -> Segment {
    Segment {
        segment_uuid: Uuid::new_v4(),
        kind,
        asset_uri: uri.map(str::to_owned),
        asset_uuid: uri.map(|_| Uuid::new_v4()),
        frame_count: frames,
        probed_duration_ms: None,
    }
}

fn block(start_off_ms: i64, end_off_ms: i64, segments: Vec<Segment>) -> Block {
    Block {
        block_id:     Uuid::new_v4(),
        start_utc_ms: EPOCH_MS + start_off_ms,
        end_utc_ms:   EPOCH_MS + end_off_ms,
        segments,
    }
}

struct Rig {
    pipeline:  PipelineManager,
    recs:      Arc<Mutex<Vec<Rec>>>,
    segs:      Arc<AtomicUsize>,
    shared:    Arc<SharedState>,
    clock:     Arc<FakeClock>,
    events_rx: crossbeam_channel::Receiver<EngineEvent>,
    frames_rx: crossbeam_channel::Receiver<aircast_core::attribution::FrameAttribution>,
}

fn rig(blocks: Vec<Block>, factory: ProducerFactory) -> Rig {
    let cfg = cfg();
    let clock = Arc::new(FakeClock::new(EPOCH_MS));
    let anchor = SessionAnchor::capture(clock.as_ref());
    let store = Arc::new(ScheduleStore::new(cfg.locked_window_ms));
    store.publish_extend(blocks, EPOCH_MS, true).unwrap();
    let shared = SharedState::new(cfg.grace_timeout_ms);
    let (recorder, recs, segs) = Recorder::new();
    let (events, events_rx, frames_rx) = EventHub::new();

    let pipeline = PipelineManager::new(
        cfg,
        clock.clone() as Arc<dyn aircast_core::anchor::Clock>,
        anchor,
        store,
        Arc::clone(&shared),
        Box::new(recorder),
        factory,
        events,
    );
    Rig { pipeline, recs, segs, shared, clock, events_rx, frames_rx }
}

fn producing_factory() -> ProducerFactory {
    Arc::new(|seg, _offset| {
        let uri = seg.asset_uri.clone().unwrap_or_default();
        match uri.as_str() {
            "missing" => Err(anyhow::anyhow!("asset not found")),
            "stall" => {
                Ok(Box::new(TestProducer { frames: 1, base: 100, signal_eof: false })
                    as Box<dyn FrameProducer>)
            }
            _ => {
                Ok(Box::new(TestProducer { frames: 30, base: 100, signal_eof: true })
                    as Box<dyn FrameProducer>)
            }
        }
    })
}

fn drain_events(rx: &crossbeam_channel::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    rx.try_iter().collect()
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[test]
fn pad_block_emits_one_frame_per_tick_with_monotone_pts() {
    // two ten-second pad blocks; fences at ticks 300 and 600
    let mut r = rig(
        vec![
            block(0, 10_000, vec![segment(SegmentKind::Pad, 300, None)]),
            block(10_000, 20_000, vec![segment(SegmentKind::Pad, 300, None)]),
        ],
        producing_factory(),
    );

    for _ in 0..=300 {
        assert!(r.pipeline.step());
    }

    let recs = r.recs.lock().unwrap().clone();
    assert_eq!(recs.len(), 301);
    for (i, rec) in recs.iter().enumerate() {
        assert_eq!(rec.tick, i as u64);
        assert_eq!(rec.videos, 1, "exactly one frame at tick {i}");
        assert_eq!(rec.tag, BLACK);
        assert_eq!(rec.pts, i as i64 * 3000, "grid PTS at tick {i}");
        assert_eq!(rec.audio + rec.silence, SPT, "sample clock at tick {i}");
    }

    // budget identity after the swap: index 301, fence 600
    let t = r.shared.tick_state();
    assert_eq!(t.session_frame_index, 301);
    assert_eq!(t.fence_tick, 600);
    assert_eq!(t.remaining_block_frames(), 299);

    // BlockStarted(A)@0, BlockCompleted(A)@300, BlockStarted(B)@300 — once each
    let events = drain_events(&r.events_rx);
    let starts: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::BlockStarted { tick, .. } => Some(*tick),
            _ => None,
        })
        .collect();
    assert_eq!(starts, vec![0, 300]);
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::BlockCompleted { tick: 300, .. })));

    // attribution: scheduled pad owns its identity
    let attr = r.frames_rx.try_iter().next().unwrap();
    assert!(attr.is_pad);
    assert_eq!(attr.segment_type, EmitKind::Pad);
    assert!(attr.segment_uuid.is_some());

    r.pipeline.shutdown();
}

#[test]
fn content_block_plays_real_frames_then_seams_to_pad() {
    // 2 s block: 30 content frames, then a scheduled pad segment
    let segs = vec![
        segment(SegmentKind::Content, 30, Some("asset-a")),
        segment(SegmentKind::Pad, 30, None),
    ];
    let mut r = rig(vec![block(0, 2_000, segs)], producing_factory());

    for _ in 0..60 {
        assert!(r.pipeline.step());
    }

    let recs = r.recs.lock().unwrap().clone();
    for n in 0..30 {
        assert_eq!(recs[n].tag, 100 + n as u8, "real frame order at tick {n}");
        assert_eq!(recs[n].audio, SPT, "content audio at tick {n}");
        assert_eq!(recs[n].silence, 0, "no silence under live content");
    }
    for n in 30..60 {
        assert_eq!(recs[n].tag, BLACK, "pad after the seam at tick {n}");
    }

    // IDR gate reset once at install, once at the seam
    assert_eq!(r.segs.load(Ordering::SeqCst), 2);

    let attrs: Vec<_> = r.frames_rx.try_iter().collect();
    assert!(!attrs[0].is_pad);
    assert_eq!(attrs[0].segment_type, EmitKind::Content);
    assert!(attrs[35].is_pad);
    assert_eq!(attrs[35].segment_type, EmitKind::Pad);

    r.pipeline.shutdown();
}

#[test]
fn content_exhaustion_fills_deficit_with_freeze_then_pad() {
    // segment budget 60, producer delivers only 30 then EOF
    let segs = vec![segment(SegmentKind::Content, 60, Some("asset-a"))];
    let mut r = rig(vec![block(0, 2_000, segs)], producing_factory());

    for _ in 0..60 {
        assert!(r.pipeline.step());
    }

    let recs = r.recs.lock().unwrap().clone();
    assert_eq!(recs[29].tag, 129, "last real frame");
    assert_eq!(recs[30].tag, 129, "single miss freezes the last committed frame");
    for n in 31..60 {
        assert_eq!(recs[n].tag, BLACK, "sustained deficit goes to black at tick {n}");
    }

    let attrs: Vec<_> = r.frames_rx.try_iter().collect();
    let deficit = &attrs[30];
    assert!(deficit.is_pad);
    assert_eq!(deficit.pad_reason, Some(PadReason::ContentDeficitFill));
    assert!(deficit.segment_uuid.is_some(), "deficit fill owned by the segment");

    r.pipeline.shutdown();
}

#[test]
fn seam_load_failure_freezes_producer_gated() {
    let segs = vec![
        segment(SegmentKind::Content, 30, Some("asset-a")),
        segment(SegmentKind::Content, 30, Some("missing")),
    ];
    let mut r = rig(vec![block(0, 2_000, segs)], producing_factory());

    for _ in 0..60 {
        assert!(r.pipeline.step());
    }

    let recs = r.recs.lock().unwrap().clone();
    for n in 30..60 {
        assert_eq!(recs[n].tag, 129, "freeze holds while the segment is gated at tick {n}");
    }
    let attrs: Vec<_> = r.frames_rx.try_iter().collect();
    let gated = &attrs[40];
    assert!(gated.is_pad);
    assert_eq!(gated.segment_type, EmitKind::Fallback);
    assert_eq!(gated.pad_reason, Some(PadReason::ProducerGated));
    assert_eq!(gated.segment_uuid, None, "fallback carries no segment identity");

    r.pipeline.shutdown();
}

#[test]
fn horizon_exhaustion_emits_sentinel_pad_and_continues() {
    let mut r = rig(
        vec![block(0, 1_000, vec![segment(SegmentKind::Pad, 30, None)])],
        producing_factory(),
    );

    for _ in 0..60 {
        assert!(r.pipeline.step());
    }

    let recs = r.recs.lock().unwrap().clone();
    assert_eq!(recs.len(), 60, "the grid never stops for an empty horizon");
    for n in 30..60 {
        assert_eq!(recs[n].tag, BLACK);
    }

    let attrs: Vec<_> = r.frames_rx.try_iter().collect();
    let sentinel = &attrs[45];
    assert_eq!(sentinel.block_id, Uuid::nil(), "sentinel next-block attribution");
    assert_eq!(sentinel.segment_type, EmitKind::Fallback);

    let faults = drain_events(&r.events_rx)
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::HorizonFault { .. }))
        .count();
    assert_eq!(faults, 1, "horizon fault raised once");

    r.pipeline.shutdown();
}

#[test]
fn underflow_on_stalled_producer_freezes_once_then_pads() {
    // producer primes one frame and then never delivers again
    let segs = vec![segment(SegmentKind::Content, 30, Some("stall"))];
    let mut r = rig(vec![block(0, 1_000, segs)], producing_factory());

    for _ in 0..10 {
        assert!(r.pipeline.step());
    }

    let recs = r.recs.lock().unwrap().clone();
    assert_eq!(recs[0].tag, 100, "primed frame airs");
    assert_eq!(recs[1].tag, 100, "first miss freezes");
    for n in 2..10 {
        assert_eq!(recs[n].tag, BLACK, "sustained underflow pads at tick {n}");
    }
    let attrs: Vec<_> = r.frames_rx.try_iter().collect();
    assert_eq!(attrs[1].pad_reason, Some(PadReason::BufferTrulyEmpty));

    r.pipeline.shutdown();
}

#[test]
fn zero_frame_segment_owns_its_pad_output() {
    // a content segment scheduled with frame_count 0: no producer is opened,
    // and the pad it yields carries the segment's own identity
    let seg = segment(SegmentKind::Content, 0, Some("asset-a"));
    let seg_uuid = seg.segment_uuid;
    let mut r = rig(vec![block(0, 1_000, vec![seg])], producing_factory());

    for _ in 0..5 {
        assert!(r.pipeline.step());
    }

    let recs = r.recs.lock().unwrap().clone();
    assert_eq!(recs[0].tag, BLACK);
    let attrs: Vec<_> = r.frames_rx.try_iter().collect();
    assert!(attrs[0].is_pad);
    assert_eq!(attrs[0].segment_uuid, Some(seg_uuid), "gate bypassed: pad owns the segment");
    assert_eq!(attrs[0].segment_type, EmitKind::Pad);

    r.pipeline.shutdown();
}

#[test]
fn rejoin_lands_mid_block_in_the_right_segment() {
    // the session joins 12 min 15 s into a 30-minute block:
    // 10 s of content, then pad for the rest
    let content = segment(SegmentKind::Content, 300, Some("asset-a"));
    let pad = segment(SegmentKind::Pad, 53_700, None);
    let pad_uuid = pad.segment_uuid;
    let mut r = rig(
        vec![block(-735_000, 1_065_000, vec![content, pad])],
        producing_factory(),
    );

    for _ in 0..5 {
        assert!(r.pipeline.step());
    }

    let attrs: Vec<_> = r.frames_rx.try_iter().collect();
    assert_eq!(attrs[0].segment_uuid, Some(pad_uuid), "rejoined past the content segment");
    let recs = r.recs.lock().unwrap().clone();
    assert_eq!(recs[0].tag, BLACK);

    r.pipeline.shutdown();
}

#[test]
fn stop_in_stable_state_ends_the_loop_immediately() {
    let mut r = rig(
        vec![block(0, 10_000, vec![segment(SegmentKind::Pad, 300, None)])],
        producing_factory(),
    );
    for _ in 0..10 {
        assert!(r.pipeline.step());
    }
    r.shared.request_stop(r.clock.as_ref());
    assert!(!r.pipeline.step(), "stable boundary tears down at once");
    r.pipeline.shutdown();
}

#[test]
fn stop_during_preload_defers_then_forces_terminal_at_grace() {
    // block B's asset never loads: the factory parks forever, so the
    // boundary sticks in PRELOAD_ISSUED
    let parked: ProducerFactory = Arc::new(|_, _| loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    });
    let mut r = rig(
        vec![
            block(0, 10_000, vec![segment(SegmentKind::Pad, 300, None)]),
            block(10_000, 20_000, vec![segment(SegmentKind::Content, 300, Some("asset-b"))]),
        ],
        parked,
    );

    // run until the preload for B has been issued (5 s lead → tick 150)
    for _ in 0..200 {
        assert!(r.pipeline.step());
    }
    assert_eq!(r.shared.boundary.lock().state(), BoundaryState::PreloadIssued);

    r.shared.request_stop(r.clock.as_ref());

    // grace is 1000 ms = 30 ticks; the loop defers, then forces terminal
    let mut steps = 0;
    while r.pipeline.step() {
        steps += 1;
        assert!(steps < 120, "teardown never converged");
    }
    assert!(steps >= 28, "teardown executed before the grace window");
    assert_eq!(r.shared.boundary.lock().state(), BoundaryState::FailedTerminal);
    let events = drain_events(&r.events_rx);
    assert!(events.iter().any(|e| matches!(e, EngineEvent::Terminal { .. })));
    // no shutdown: the parked preloader worker cannot be joined
}
