// crates/aircast-engine/src/pipeline.rs
//
// The pipeline manager: one master loop emitting exactly one frame per tick,
// forever, correctly attributed.
//
// Per-tick sequence (atomic with respect to other ticks; nothing skips the
// sink hand-off):
//   1. fence evaluation — swap to the next block before anything else
//   2. seam evaluation  — within-block segment transitions
//   3. frame retrieval  — real → freeze → black, with classification
//   4. commitment       — the emitted real frame becomes the freeze source
//   5. state update     — (session_frame_index, fence) published as a pair
//   6. PTS stamp + unconditional sink hand-off
//
// Deadline discipline: a late tick still runs the full sequence and emits
// via the fallback chain; the loop never emits twice in one period and never
// slips future deadlines — deadline N is always anchor + N·period.

use std::collections::VecDeque;
use std::sync::Arc;

use uuid::Uuid;

use aircast_core::anchor::{Clock, SessionAnchor};
use aircast_core::attribution::{EmitKind, FrameAttribution, PadReason};
use aircast_core::block::{ScheduledBlock, Segment, SegmentKind};
use aircast_core::boundary::BoundaryState;
use aircast_core::clock::FrameRate;
use aircast_core::config::ChannelConfig;
use aircast_core::error::{CoordinationError, PlanningError};
use aircast_core::store::ScheduleStore;
use aircast_media::lookahead::BlockBuffers;
use aircast_media::pad::PadSource;
use aircast_media::sink::SinkOffer;

use crate::emit::EmitStage;
use crate::event::{EngineEvent, EventHub};
use crate::preloader::{
    prime_segment, PreloadOutcome, PreloadPurpose, PreloadRequest, Preloader, PrimedSegment,
    ProducerFactory,
};
use crate::session::{SharedState, TeardownDecision};

/// Lead time for issuing the next block's preload, in seconds before the
/// fence. Short on purpose: the boundary machine is transient while a
/// preload is outstanding, and transient states defer teardown.
const PRELOAD_LEAD_SECS: u64 = 5;

/// Media-time disagreement (in output frame durations) beyond which a popped
/// frame is counted as a CT mismatch. Diagnostic only.
const CT_MISMATCH_FRAMES: i64 = 2;

/// Sentinel block id for output emitted with no block at all (horizon
/// exhaustion).
fn sentinel_block_id() -> Uuid {
    Uuid::nil()
}

/// Rejoin cursor for the first installed block of a session.
#[derive(Clone, Copy, Debug)]
pub struct RejoinCursor {
    pub block_id:      Uuid,
    pub seg_index:     usize,
    pub seg_offset_ms: i64,
}

/// The armed live source for the current segment.
struct LiveSegment {
    buffers: BlockBuffers,
}

struct ActiveBlock {
    sched:      ScheduledBlock,
    seg_cursor: usize,
    /// Armed A. `Some` for every segment kind — PAD segments carry buffers
    /// too, so the audio source always routes to a real queue.
    live: Option<LiveSegment>,
    /// Within-block preview of the upcoming segment.
    primed_seg: Option<PrimedSegment>,
    seg_frames_emitted:   u64,
    first_real_committed: bool,
    last_seam_tick: Option<u64>,
}

impl ActiveBlock {
    fn segment(&self) -> &Segment {
        &self.sched.block.segments[self.seg_cursor]
    }

    fn next_segment(&self) -> Option<&Segment> {
        self.sched.block.segments.get(self.seg_cursor + 1)
    }
}

/// What the retrieval step decided to show this tick.
enum Chosen {
    Real(Vec<u8>, i64), // packed yuv + media ct
    Freeze,
    Black,
}

pub struct PipelineManager {
    cfg:    Arc<ChannelConfig>,
    clock:  Arc<dyn Clock>,
    anchor: SessionAnchor,
    rate:   FrameRate,
    store:  Arc<ScheduleStore>,
    shared: Arc<SharedState>,

    emit:      Box<dyn EmitStage>,
    pad:       PadSource,
    preloader: Preloader,
    factory:   ProducerFactory,
    events:    EventHub,

    queue:  VecDeque<ScheduledBlock>,
    active: Option<ActiveBlock>,
    rejoin: Option<RejoinCursor>,

    /// Next block's primed first segment (`None` inner = pad-first block,
    /// ready without a producer).
    primed_next:     Option<(Uuid, Option<PrimedSegment>)>,
    inflight_block:  Option<Uuid>,
    inflight_seg:    Option<Uuid>,
    horizon_cursor_ms: i64,
    horizon_faulted: bool,

    last_committed:      Option<Vec<u8>>,
    consecutive_misses:  u32,
    samples_supplied:    u128,
    silence_streak:      u64,

    tick: u64,
}

impl PipelineManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<ChannelConfig>,
        clock: Arc<dyn Clock>,
        anchor: SessionAnchor,
        store: Arc<ScheduleStore>,
        shared: Arc<SharedState>,
        emit: Box<dyn EmitStage>,
        factory: ProducerFactory,
        events: EventHub,
    ) -> Self {
        let rate = cfg.video.rate;
        let pad = PadSource::new(&cfg.video, &cfg.audio);
        let preloader = Preloader::start(Arc::clone(&factory), cfg.lookahead, cfg.grace_timeout_ms);

        // Mid-block rejoin: locate the segment and offset the session starts
        // inside. The engine is stateless — this is the whole restart story.
        let rejoin = store.compute_position(anchor.epoch_utc_ms).map(|pos| {
            let snap = store.snapshot_all();
            let block = &snap.blocks[pos.block_index];
            let (seg_index, seg_offset_ms) = locate_segment(block.segments.as_slice(), pos.offset_ms, rate);
            log::info!(
                "rejoin: block {} segment {} at {} ms",
                block.block_id,
                seg_index,
                seg_offset_ms
            );
            RejoinCursor { block_id: block.block_id, seg_index, seg_offset_ms }
        });

        Self {
            horizon_cursor_ms: anchor.epoch_utc_ms,
            cfg,
            clock,
            anchor,
            rate,
            store,
            shared,
            emit,
            pad,
            preloader,
            factory,
            events,
            queue: VecDeque::new(),
            active: None,
            rejoin,
            primed_next: None,
            inflight_block: None,
            inflight_seg: None,
            horizon_faulted: false,
            last_committed: None,
            consecutive_misses: 0,
            samples_supplied: 0,
            silence_streak: 0,
            tick: 0,
        }
    }

    pub fn session_frame_index(&self) -> u64 {
        self.tick
    }

    /// Run until teardown completes. The master loop blocks only on its own
    /// deadline — never on buffers, sinks or sockets.
    pub fn run(mut self) {
        loop {
            if !self.step() {
                break;
            }
        }
        self.shutdown();
    }

    /// One tick: sleep to the deadline, then the atomic sequence. Returns
    /// false when teardown has been agreed.
    pub fn step(&mut self) -> bool {
        let deadline = self.anchor.deadline_ns(self.rate, self.tick);
        self.clock.sleep_until_mono_ns(deadline);
        let lateness_ms = (self.clock.mono_now_ns().saturating_sub(deadline)) as f64 / 1e6;

        match self.shared.teardown_decision(self.clock.as_ref()) {
            TeardownDecision::Continue => {}
            TeardownDecision::TearDown => return false,
            TeardownDecision::ForceTerminal => {
                self.shared.force_terminal();
                self.events.control(EngineEvent::Terminal {
                    reason: "teardown grace expired in transient boundary state".into(),
                });
                return false;
            }
        }

        self.plan_horizon();
        self.poll_preloader();
        self.issue_preloads();
        self.tick_once(lateness_ms);
        self.tick += 1;
        true
    }

    // ── Planning ──────────────────────────────────────────────────────────────

    /// Keep up to two blocks bound ahead of the grid. The fence is computed
    /// exactly once here, at bind time, and never again.
    fn plan_horizon(&mut self) {
        while self.active.is_some() as usize + self.queue.len() < 2 {
            let snap = self.store.snapshot(self.horizon_cursor_ms, i64::MAX);
            let Some(block) = snap
                .blocks
                .into_iter()
                .find(|b| b.end_utc_ms > self.horizon_cursor_ms)
            else {
                return; // horizon ends here; exhaustion surfaces at the fence
            };
            self.horizon_cursor_ms = block.end_utc_ms;
            let block_id = block.block_id;
            match ScheduledBlock::bind(block, &self.anchor, self.rate, self.tick) {
                Some(sched) => self.queue.push_back(sched),
                None => {
                    log::warn!("{}", PlanningError::StaleBlock {
                        block_id,
                        fence_tick: 0,
                        now_tick: self.tick,
                    });
                    self.events.control(EngineEvent::BlockSkipped {
                        block_id,
                        reason: "stale at bind".into(),
                    });
                }
            }
        }
    }

    fn poll_preloader(&mut self) {
        while let Some(outcome) = self.preloader.poll() {
            let PreloadOutcome::Segment { purpose, block_id, result } = outcome;
            match purpose {
                PreloadPurpose::NextBlock => {
                    self.inflight_block = None;
                    match result {
                        Ok(primed) => {
                            self.primed_next = Some((block_id, Some(primed)));
                            self.boundary_to(BoundaryState::SwitchScheduled);
                        }
                        Err(e) => {
                            // recoverable planning failure: the block will be
                            // skipped at its fence when it proves unloadable
                            log::warn!("next-block preload failed: {e}");
                            self.boundary_to(BoundaryState::None);
                        }
                    }
                }
                PreloadPurpose::NextSegment => {
                    self.inflight_seg = None;
                    match (result, self.active.as_mut()) {
                        (Ok(primed), Some(active)) if active.sched.block.block_id == block_id => {
                            active.primed_seg = Some(primed);
                        }
                        (Ok(primed), _) => {
                            // block already gone; retire the orphan
                            self.preloader.reap(primed.buffers.stop_filling_async());
                        }
                        (Err(e), _) => log::warn!("segment preload failed: {e}"),
                    }
                }
            }
        }
    }

    fn issue_preloads(&mut self) {
        // next block's first segment, shortly before the fence
        if self.primed_next.is_none() && self.inflight_block.is_none() {
            if let (Some(active), Some(head)) = (self.active.as_ref(), self.queue.front()) {
                let lead_ticks =
                    PRELOAD_LEAD_SECS * self.rate.num() as u64 / self.rate.den() as u64;
                if active.sched.fence_tick.saturating_sub(self.tick) <= lead_ticks {
                    let block_id = head.block.block_id;
                    match head.block.segments.first() {
                        Some(seg) if seg.kind != SegmentKind::Pad => {
                            let segment = seg.clone();
                            self.boundary_to(BoundaryState::None);
                            self.boundary_to(BoundaryState::Planned);
                            self.boundary_to(BoundaryState::PreloadIssued);
                            self.inflight_block = Some(block_id);
                            self.preloader.request(PreloadRequest::Segment {
                                purpose: PreloadPurpose::NextBlock,
                                block_id,
                                segment,
                                offset_ms: 0,
                            });
                        }
                        _ => {
                            // pad-first (or empty) block needs no producer
                            self.boundary_to(BoundaryState::None);
                            self.boundary_to(BoundaryState::Planned);
                            self.boundary_to(BoundaryState::PreloadIssued);
                            self.boundary_to(BoundaryState::SwitchScheduled);
                            self.primed_next = Some((block_id, None));
                        }
                    }
                }
            }
        }

        // upcoming segment inside the active block, a look-ahead before the seam
        if self.inflight_seg.is_none() {
            if let Some(active) = self.active.as_ref() {
                if active.primed_seg.is_none() {
                    if let Some(next) = active.next_segment() {
                        let cur = active.segment();
                        let remaining = cur.frame_count.saturating_sub(active.seg_frames_emitted);
                        let lead = 2 * self.cfg.lookahead.target as u64;
                        if next.kind != SegmentKind::Pad && remaining <= lead {
                            self.inflight_seg = Some(next.segment_uuid);
                            self.preloader.request(PreloadRequest::Segment {
                                purpose:   PreloadPurpose::NextSegment,
                                block_id:  active.sched.block.block_id,
                                segment:   next.clone(),
                                offset_ms: 0,
                            });
                        }
                    }
                }
            }
        }
    }

    fn boundary_to(&self, to: BoundaryState) {
        let mut b = self.shared.boundary.lock();
        if b.state() == to {
            return;
        }
        if let Err(e) = b.transition(to) {
            log::debug!("boundary bookkeeping: {e}");
        }
    }

    // ── The tick ──────────────────────────────────────────────────────────────

    fn tick_once(&mut self, lateness_ms: f64) {
        let tick = self.tick;

        // 1. fence evaluation, before anything else
        self.evaluate_fence(tick);

        // 2. segment seam, inside the active block
        self.evaluate_seam(tick);

        // 3-4. retrieval + commitment + attribution
        let pts_90k = self.rate.frame_index_to_pts_90k(tick);
        let (chosen, attr) = self.choose_frame(tick, pts_90k);

        // 5. state update: index and fence move as one pair
        let fence = self
            .active
            .as_ref()
            .map(|a| a.sched.fence_tick)
            .unwrap_or(u64::MAX);
        self.shared.publish_tick(tick + 1, fence);
        debug_assert_eq!(
            self.shared.tick_state().remaining_block_frames(),
            fence.saturating_sub(tick + 1),
            "budget identity"
        );

        // 6. emit: video, audio service, unconditional hand-off
        let emitted_real = matches!(chosen, Chosen::Real(..));
        match chosen {
            Chosen::Real(yuv, _ct) => {
                if let Err(e) = self.emit.video(pts_90k, &yuv) {
                    log::error!("video emit: {e}");
                }
                self.last_committed = Some(yuv);
            }
            Chosen::Freeze => {
                let frozen = self.last_committed.take().expect("freeze requires a committed frame");
                if let Err(e) = self.emit.video(pts_90k, &frozen) {
                    log::error!("video emit (freeze): {e}");
                }
                self.last_committed = Some(frozen);
                self.shared.stats.lock().freezes += 1;
            }
            Chosen::Black => {
                if let Err(e) = self.emit.video(pts_90k, self.pad.black_bytes()) {
                    log::error!("video emit (pad): {e}");
                }
            }
        }

        self.service_audio(tick, emitted_real, attr.is_pad);

        match self.emit.finish_tick(tick, self.rate.tick_time_us(tick)) {
            SinkOffer::Accepted | SinkOffer::Stopped => {}
            SinkOffer::Overflow => {
                self.shared.stats.lock().detaches += 1;
            }
        }

        self.events.frame(attr);
        if let Some(active) = self.active.as_mut() {
            active.seg_frames_emitted += 1;
        }
        self.shared.stats.lock().record_tick(lateness_ms);
    }

    // ── Fence swap ────────────────────────────────────────────────────────────

    fn evaluate_fence(&mut self, tick: u64) {
        loop {
            match self.active.as_ref() {
                Some(active) if tick >= active.sched.fence_tick => {
                    // budget mismatch check: at the fence the block owes zero
                    let leftover = active
                        .segment()
                        .frame_count
                        .saturating_sub(active.seg_frames_emitted);
                    if tick > active.sched.fence_tick {
                        log::error!(
                            "fence overshoot on block {}: tick {tick} > fence {}",
                            active.sched.block.block_id,
                            active.sched.fence_tick
                        );
                    } else if leftover > 0 && active.seg_cursor + 1 == active.sched.block.segments.len() {
                        log::debug!(
                            "block {} truncated {leftover} scheduled frames at fence",
                            active.sched.block.block_id
                        );
                    }
                    self.complete_active(tick);
                    self.install_next(tick);
                }
                Some(_) => return,
                None => {
                    self.install_next(tick);
                    return;
                }
            }
        }
    }

    fn complete_active(&mut self, tick: u64) {
        let Some(mut active) = self.active.take() else { return };
        self.events.control(EngineEvent::BlockCompleted {
            block_id: active.sched.block.block_id,
            tick,
        });
        if let Some(live) = active.live.take() {
            self.retire_buffers(live.buffers);
        }
        if let Some(primed) = active.primed_seg.take() {
            self.retire_buffers(primed.buffers);
        }
        self.inflight_seg = None;
    }

    fn retire_buffers(&self, buffers: BlockBuffers) {
        if buffers.fill_running() {
            self.preloader.reap(buffers.stop_filling_async());
        } else {
            // no fill thread was ever started (pad buffers) or it already
            // exited; synchronous stop is a cheap join
            let mut buffers = buffers;
            buffers.stop_filling();
        }
    }

    /// Install the next block as active. The fence is immutable: not-ready
    /// successors are installed anyway and emit fallback until real frames
    /// flow.
    fn install_next(&mut self, tick: u64) {
        loop {
            let Some(sched) = self.queue.pop_front() else {
                self.active = None;
                if !self.horizon_faulted {
                    self.horizon_faulted = true;
                    self.shared.stats.lock().horizon_faults += 1;
                    self.events.control(EngineEvent::HorizonFault { tick });
                    log::error!("{}", PlanningError::HorizonExhausted { tick });
                }
                return;
            };
            let block_id = sched.block.block_id;

            // stale block: fence at or behind the grid — skip, evaluate next
            if sched.fence_tick <= tick {
                log::warn!("{}", PlanningError::StaleBlock {
                    block_id,
                    fence_tick: sched.fence_tick,
                    now_tick: tick,
                });
                self.events.control(EngineEvent::BlockSkipped { block_id, reason: "stale".into() });
                self.boundary_to(BoundaryState::None);
                self.discard_primed_for(block_id);
                continue;
            }

            // cold start reaches the fence with no boundary planned; walk the
            // forward chain so SWITCH_ISSUED is always entered legally
            self.boundary_to(BoundaryState::Planned);
            self.boundary_to(BoundaryState::PreloadIssued);
            self.boundary_to(BoundaryState::SwitchScheduled);
            self.boundary_to(BoundaryState::SwitchIssued);
            self.events.control(EngineEvent::BlockStarted { block_id, tick });

            let (seg_index, seg_offset_ms) = match self.rejoin.take() {
                Some(r) if r.block_id == block_id => (r.seg_index, r.seg_offset_ms),
                Some(r) => {
                    self.rejoin = Some(r);
                    (0, 0)
                }
                None => (0, 0),
            };

            let Some(first_seg) = sched.block.segments.get(seg_index).cloned() else {
                log::warn!("block {block_id} has no segments; skipping");
                self.events.control(EngineEvent::BlockSkipped { block_id, reason: "empty".into() });
                self.boundary_to(BoundaryState::None);
                continue;
            };

            let live = match first_seg.kind {
                SegmentKind::Pad => Some(self.pad_live()),
                SegmentKind::Content | SegmentKind::Filler => {
                    match self.take_primed_for(block_id, &first_seg) {
                        Some(primed) => Some(LiveSegment { buffers: primed.buffers }),
                        None => {
                            // synchronous drain: load in-line; a slow load
                            // makes this tick late, and the late tick still
                            // emits fallback attributed to this block
                            match prime_segment(&self.factory, self.cfg.lookahead, &first_seg, seg_offset_ms)
                            {
                                Ok(primed) => Some(LiveSegment { buffers: primed.buffers }),
                                Err(e) => {
                                    log::warn!("synchronous load failed: {e}");
                                    self.events.control(EngineEvent::BlockSkipped {
                                        block_id,
                                        reason: format!("load failed: {e}"),
                                    });
                                    self.boundary_to(BoundaryState::None);
                                    continue;
                                }
                            }
                        }
                    }
                }
            };

            self.boundary_to(BoundaryState::Live);
            self.horizon_faulted = false;
            self.consecutive_misses = 0;
            self.emit.begin_segment();
            self.active = Some(ActiveBlock {
                sched,
                seg_cursor: seg_index,
                live,
                primed_seg: None,
                seg_frames_emitted: 0,
                first_real_committed: false,
                last_seam_tick: None,
            });
            return;
        }
    }

    fn pad_live(&self) -> LiveSegment {
        // Pad segments still own a real audio queue: the audio source must
        // never route to null, and the seam contract pre-seeds a tick of
        // silence before the switch.
        let buffers = BlockBuffers::new(self.cfg.lookahead.target, self.cfg.lookahead.cap);
        buffers.audio.push(self.pad.silence_tick());
        LiveSegment { buffers }
    }

    fn take_primed_for(&mut self, block_id: Uuid, seg: &Segment) -> Option<PrimedSegment> {
        let (id, primed_opt) = self.primed_next.take()?;
        if id == block_id {
            if let Some(primed) = primed_opt {
                if primed.segment.segment_uuid == seg.segment_uuid {
                    return Some(primed);
                }
                self.retire_buffers(primed.buffers);
            }
            // pad-first marker, or a primed segment the block no longer opens with
            None
        } else {
            // primed for a block that is not being installed; re-preload later
            if let Some(primed) = primed_opt {
                self.retire_buffers(primed.buffers);
            }
            None
        }
    }

    fn discard_primed_for(&mut self, block_id: Uuid) {
        if let Some((id, primed_opt)) = self.primed_next.take() {
            if id == block_id {
                if let Some(primed) = primed_opt {
                    self.retire_buffers(primed.buffers);
                }
            } else {
                self.primed_next = Some((id, primed_opt));
            }
        }
    }

    // ── Segment seam ──────────────────────────────────────────────────────────

    fn evaluate_seam(&mut self, tick: u64) {
        loop {
            let Some(active) = self.active.as_ref() else { return };
            let cur = active.segment();
            let exhausted = active.seg_frames_emitted >= cur.frame_count;
            let has_next = active.next_segment().is_some();
            if !exhausted || !has_next {
                return;
            }

            // one take per tick, guarded by the last-seam-tick (reset only on
            // block activation); a zero-frame successor waits for the next tick
            if active.last_seam_tick == Some(tick) {
                log::debug!("{}", CoordinationError::DoubleTake { tick, last: tick });
                return;
            }
            // seam requires an armed live A; refuse without mutating
            if active.live.is_none() {
                log::warn!("{}", CoordinationError::SeamWithoutArmedSource { tick });
                return;
            }

            self.seam_take(tick);
            // loop again: a zero-frame middle segment is consumed immediately
        }
    }

    fn seam_take(&mut self, tick: u64) {
        // stage 1: detach everything movable from the active block before any
        // &mut self helper runs
        let (next, outgoing, staged_primed) = {
            let active = self.active.as_mut().expect("seam guard checked");
            let next = active.sched.block.segments[active.seg_cursor + 1].clone();
            // step that moves the outgoing buffer is null-safe
            let outgoing = active.live.take();
            let staged = active.primed_seg.take();
            (next, outgoing, staged)
        };

        let mut primed = None;
        if let Some(p) = staged_primed {
            if p.segment.segment_uuid == next.segment_uuid {
                primed = Some(p);
            } else {
                self.retire_buffers(p.buffers);
            }
        }

        let live = match next.kind {
            SegmentKind::Pad => {
                if let Some(p) = primed.take() {
                    self.retire_buffers(p.buffers);
                }
                // CONTENT→PAD: silence lands in a real audio buffer before
                // the pad segment owns the tick
                self.pad_live()
            }
            SegmentKind::Content | SegmentKind::Filler => match primed {
                Some(p) => LiveSegment { buffers: p.buffers },
                None => match prime_segment(&self.factory, self.cfg.lookahead, &next, 0) {
                    Ok(p) => LiveSegment { buffers: p.buffers },
                    Err(e) => {
                        // producer-gated segment: an armed pad source keeps
                        // the seam machinery live while fallback frames air
                        log::warn!("seam load failed: {e}");
                        self.pad_live()
                    }
                },
            },
        };

        let active = self.active.as_mut().expect("active checked above");
        active.seg_cursor += 1;
        active.seg_frames_emitted = 0;
        active.first_real_committed = false;
        active.last_seam_tick = Some(tick);
        active.live = Some(live);
        self.consecutive_misses = 0;
        self.emit.begin_segment();

        if let Some(out) = outgoing {
            self.retire_buffers(out.buffers);
        }
    }

    // ── Retrieval + classification ────────────────────────────────────────────

    fn choose_frame(&mut self, tick: u64, pts_90k: i64) -> (Chosen, FrameAttribution) {
        let Some(active) = self.active.as_mut() else {
            // horizon exhausted: pad attributed to the sentinel next-block
            let chosen = self.fallback_visual(false);
            let attr = FrameAttribution::pad(
                tick,
                pts_90k,
                sentinel_block_id(),
                None,
                PadReason::ProducerGated,
            );
            self.shared.stats.lock().record_pad(PadReason::ProducerGated);
            return (chosen, attr);
        };

        let block_id = active.sched.block.block_id;
        let seg = active.segment().clone();

        match seg.kind {
            SegmentKind::Pad => {
                // scheduled pad: first-class output, attributed to itself
                let attr = FrameAttribution {
                    tick,
                    pts_90k,
                    block_id,
                    segment_uuid: Some(seg.segment_uuid),
                    asset_uuid: None,
                    segment_type: EmitKind::Pad,
                    is_pad: true,
                    pad_reason: None,
                };
                (Chosen::Black, attr)
            }
            SegmentKind::Content | SegmentKind::Filler => {
                let kind = if seg.kind == SegmentKind::Content {
                    EmitKind::Content
                } else {
                    EmitKind::Filler
                };

                // zero-frame segment: bypasses the content-before-pad gate
                // and owns its pad output (only reachable as the last
                // segment; earlier ones are consumed by the seam)
                if seg.frame_count == 0 {
                    let attr = FrameAttribution::pad(
                        tick,
                        pts_90k,
                        block_id,
                        Some(seg.segment_uuid),
                        PadReason::ContentDeficitFill,
                    );
                    self.shared.stats.lock().record_pad(PadReason::ContentDeficitFill);
                    return (Chosen::Black, attr);
                }

                let popped = active.live.as_ref().and_then(|l| l.buffers.video.try_pop());
                match popped {
                    Some(frame) => {
                        self.consecutive_misses = 0;
                        active.first_real_committed = true;

                        // media-time sanity: diagnostic only, frame still airs
                        let expected_ms = (active.seg_frames_emitted as i128 * 1000
                            * self.rate.den() as i128
                            / self.rate.num() as i128)
                            as i64;
                        let frame_ms = (1000 * self.rate.den() as i64 / self.rate.num() as i64).max(1);
                        if (frame.media_ct_ms - expected_ms).abs() > CT_MISMATCH_FRAMES * frame_ms {
                            self.shared.stats.lock().record_pad(PadReason::FrameCtMismatch);
                            log::debug!(
                                "frame CT mismatch in segment {}: media {} ms vs slot {} ms",
                                seg.segment_uuid,
                                frame.media_ct_ms,
                                expected_ms
                            );
                        }

                        let attr = FrameAttribution::content(
                            tick,
                            pts_90k,
                            block_id,
                            seg.segment_uuid,
                            seg.asset_uuid,
                            kind,
                        );
                        (Chosen::Real(frame.yuv, frame.media_ct_ms), attr)
                    }
                    None => {
                        let (depth, eof) = active
                            .live
                            .as_ref()
                            .map(|l| (l.buffers.video.depth(), l.buffers.video.is_eof()))
                            .unwrap_or((0, false));
                        let producer_gated = active.live.is_none() || !active.first_real_committed;

                        let (reason, seg_uuid) = if eof {
                            // content ran out before its budget: deficit fill
                            // owned by the segment
                            (PadReason::ContentDeficitFill, Some(seg.segment_uuid))
                        } else if producer_gated {
                            (PadReason::ProducerGated, None)
                        } else {
                            (PadReason::BufferTrulyEmpty, None)
                        };

                        {
                            let mut stats = self.shared.stats.lock();
                            stats.record_underflow(depth);
                            stats.record_pad(reason);
                        }
                        self.consecutive_misses += 1;
                        let indefinite_freeze = reason == PadReason::ProducerGated;
                        let chosen = self.fallback_visual(indefinite_freeze);
                        let attr = FrameAttribution::pad(tick, pts_90k, block_id, seg_uuid, reason);
                        (chosen, attr)
                    }
                }
            }
        }
    }

    /// Freeze-or-black policy: freeze covers a single miss (and holds
    /// indefinitely while a swapped-in block is still loading); sustained
    /// misses go to black.
    fn fallback_visual(&mut self, indefinite_freeze: bool) -> Chosen {
        let freeze_ok = self.last_committed.is_some()
            && (indefinite_freeze || self.consecutive_misses <= 1);
        if freeze_ok {
            Chosen::Freeze
        } else {
            Chosen::Black
        }
    }

    // ── Audio service ─────────────────────────────────────────────────────────

    /// Slave the audio clock to the tick grid: after tick N the emit stage
    /// has received exactly `samples_through(N+1)` samples (content first,
    /// silence top-up for the shortfall). Audio backlog beyond the due count
    /// stays queued — audio never runs ahead of video across a seam.
    fn service_audio(&mut self, tick: u64, emitted_real: bool, is_pad_tick: bool) {
        let due_total = (tick as u128 + 1)
            * self.cfg.audio.sample_rate as u128
            * self.rate.den() as u128
            / self.rate.num() as u128;
        let due = due_total.saturating_sub(self.samples_supplied) as usize;

        let mut supplied = 0usize;
        if let Some(active) = self.active.as_ref() {
            if let Some(live) = active.live.as_ref() {
                while supplied < due {
                    match live.buffers.audio.try_pop() {
                        Some(frame) => {
                            supplied += frame.samples();
                            self.emit.audio(&frame);
                        }
                        None => break,
                    }
                }
            }
        }

        if supplied < due {
            let missing = due - supplied;
            self.emit.silence(missing);
            supplied = due;

            // silence while real content is on air is a liveness violation
            // in the making; one tick is jitter, a streak is a bug
            if emitted_real && !is_pad_tick {
                self.silence_streak += 1;
                if self.silence_streak == self.rate.num() as u64 / self.rate.den() as u64 {
                    log::warn!(
                        "audio liveness: silence injected for a full second under live content"
                    );
                }
            } else {
                self.silence_streak = 0;
            }
        } else {
            self.silence_streak = 0;
        }
        self.samples_supplied += supplied as u128;
    }

    // ── Teardown ──────────────────────────────────────────────────────────────

    /// Retire every live buffer, flush the emit stage, stop the preloader.
    /// `run` calls this on exit; callers driving `step` directly call it when
    /// they are done.
    pub fn shutdown(mut self) {
        log::info!("pipeline teardown at tick {}", self.tick);
        if let Some(mut active) = self.active.take() {
            if let Some(live) = active.live.take() {
                self.retire_buffers(live.buffers);
            }
            if let Some(primed) = active.primed_seg.take() {
                self.retire_buffers(primed.buffers);
            }
        }
        if let Some((_, Some(primed))) = self.primed_next.take() {
            self.retire_buffers(primed.buffers);
        }
        self.emit.finish();
        self.preloader.shutdown();
    }
}

/// Walk a block's segments to find which one contains `offset_ms`, and the
/// remainder within it.
fn locate_segment(segments: &[Segment], offset_ms: i64, rate: FrameRate) -> (usize, i64) {
    let mut rem = offset_ms.max(0);
    for (i, seg) in segments.iter().enumerate() {
        let seg_ms =
            (seg.frame_count as i128 * 1000 * rate.den() as i128 / rate.num() as i128) as i64;
        if rem < seg_ms || i + 1 == segments.len() {
            return (i, rem);
        }
        rem -= seg_ms;
    }
    (0, 0)
}
