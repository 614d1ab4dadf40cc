// crates/aircast-core/src/block.rs
//
// Schedule data model: blocks, segments, and the fence arithmetic binding
// them to the tick grid. Plain serde data — no runtime handles, no ffmpeg.
// The execution plan arrives pre-resolved from the schedule authority; this
// engine never decides WHAT to play, only WHEN.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::anchor::SessionAnchor;
use crate::clock::FrameRate;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentKind {
    /// Real scheduled asset.
    Content,
    /// Interstitial material.
    Filler,
    /// Deterministic black + silence; carries no asset.
    Pad,
}

/// One playable unit inside a block.
///
/// `segment_uuid` is execution identity, assigned by the schedule authority at
/// feed time — never positional, so re-feeds and overrides stay attributable.
/// `frame_count` is authoritative; wall durations are derived from it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Segment {
    pub segment_uuid: Uuid,
    pub kind:         SegmentKind,
    /// Resolved asset location. `None` for PAD segments.
    pub asset_uri:    Option<String>,
    pub asset_uuid:   Option<Uuid>,
    pub frame_count:  u64,
    /// Container-probed duration, for media-time exhaustion diagnostics.
    #[serde(default)]
    pub probed_duration_ms: Option<i64>,
}

impl Segment {
    pub fn pad(segment_uuid: Uuid, frame_count: u64) -> Self {
        Self {
            segment_uuid,
            kind: SegmentKind::Pad,
            asset_uri: None,
            asset_uuid: None,
            frame_count,
            probed_duration_ms: None,
        }
    }
}

/// A scheduled unit: contiguous UTC range plus the ordered segments filling it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub block_id:     Uuid,
    pub start_utc_ms: i64,
    pub end_utc_ms:   i64,
    pub segments:     Vec<Segment>,
}

impl Block {
    pub fn duration_ms(&self) -> i64 {
        self.end_utc_ms - self.start_utc_ms
    }
}

/// A block bound to the session's tick grid.
///
/// The fence tick is computed exactly once, when the block is fed, and never
/// changes afterwards — not for decode latency, not for buffer state. The
/// fence is the first tick OWNED by this block (inclusive lower bound of its
/// successor's wait).
#[derive(Clone, Debug)]
pub struct ScheduledBlock {
    pub block:      Block,
    pub start_tick: u64,
    pub fence_tick: u64,
}

impl ScheduledBlock {
    /// Bind `block` to the grid. Returns `None` for a stale block — one whose
    /// fence is already at or behind `now_tick` (policy at the call site is
    /// skip-and-log, so staleness is represented in the type, not an error).
    pub fn bind(
        block: Block,
        anchor: &SessionAnchor,
        rate: FrameRate,
        now_tick: u64,
    ) -> Option<Self> {
        let fence_tick = anchor.fence_tick(rate, block.end_utc_ms);
        if fence_tick <= now_tick {
            return None;
        }
        let start_tick = anchor.tick_at_utc_ms(rate, block.start_utc_ms).max(now_tick);
        Some(Self { block, start_tick, fence_tick })
    }

    /// Frames this block owes the grid from `start_tick` to its fence.
    pub fn frame_budget(&self) -> u64 {
        self.fence_tick - self.start_tick
    }

    /// Budget still owed at session frame index `t`. Identity the pipeline
    /// asserts every tick: `remaining(t) == fence_tick − t`.
    pub fn remaining_at(&self, session_frame_index: u64) -> u64 {
        self.fence_tick.saturating_sub(session_frame_index)
    }
}
