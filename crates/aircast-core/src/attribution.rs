// crates/aircast-core/src/attribution.rs
//
// Per-frame attribution: every emitted frame says whose tick it consumed and
// why, so downstream accounting can audit pad output. Pad is a designed,
// classified first-class output — never an anonymous failure.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmitKind {
    Content,
    Filler,
    Pad,
    /// Engine-substituted output (freeze or black) standing in for content
    /// that could not be supplied for this tick.
    Fallback,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PadReason {
    /// Look-ahead had no frame although the producer was filling.
    BufferTrulyEmpty,
    /// Producer not yet delivering (priming, late load, cold start).
    ProducerGated,
    /// Primed frame was one tick away; the slot was padded rather than stalled.
    CtSlotSkipped,
    /// Popped frame's media time disagreed with the slot beyond tolerance.
    FrameCtMismatch,
    /// Segment exhausted before its fence; remaining budget filled.
    ContentDeficitFill,
    Unknown,
}

/// Attribution record attached to every emitted frame on the event stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameAttribution {
    pub tick:         u64,
    pub pts_90k:      i64,
    pub block_id:     Uuid,
    /// `None` for fallback output — fallback frames belong to a block, never
    /// to a segment.
    pub segment_uuid: Option<Uuid>,
    /// `None` for PAD and fallback.
    pub asset_uuid:   Option<Uuid>,
    pub segment_type: EmitKind,
    pub is_pad:       bool,
    pub pad_reason:   Option<PadReason>,
}

impl FrameAttribution {
    pub fn content(tick: u64, pts_90k: i64, block_id: Uuid, segment_uuid: Uuid, asset_uuid: Option<Uuid>, kind: EmitKind) -> Self {
        Self {
            tick,
            pts_90k,
            block_id,
            segment_uuid: Some(segment_uuid),
            asset_uuid,
            segment_type: kind,
            is_pad: false,
            pad_reason: None,
        }
    }

    /// Pad attributed to a segment's own identity (scheduled PAD segments and
    /// deficit fill inside a known segment).
    pub fn pad(tick: u64, pts_90k: i64, block_id: Uuid, segment_uuid: Option<Uuid>, reason: PadReason) -> Self {
        Self {
            tick,
            pts_90k,
            block_id,
            segment_uuid,
            asset_uuid: None,
            segment_type: if segment_uuid.is_some() { EmitKind::Pad } else { EmitKind::Fallback },
            is_pad: true,
            pad_reason: Some(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_has_no_segment_identity() {
        let a = FrameAttribution::pad(7, 21_000, Uuid::new_v4(), None, PadReason::ProducerGated);
        assert!(a.is_pad);
        assert_eq!(a.segment_type, EmitKind::Fallback);
        assert_eq!(a.segment_uuid, None);
        assert_eq!(a.asset_uuid, None);
    }

    #[test]
    fn scheduled_pad_owns_its_identity() {
        let seg = Uuid::new_v4();
        let a = FrameAttribution::pad(0, 0, Uuid::new_v4(), Some(seg), PadReason::ContentDeficitFill);
        assert_eq!(a.segment_type, EmitKind::Pad);
        assert_eq!(a.segment_uuid, Some(seg));
    }
}
