// crates/aircast-core/src/store.rs
//
// Execution-window store: the engine-facing face of the schedule authority.
// Holds a contiguous run of blocks with an atomic generation id. Publishes
// are all-or-nothing; snapshot readers always observe one generation. The
// engine itself is stateless across restarts — on start it reads a snapshot
// and computes its rejoin position from the session anchor.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::block::Block;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("publish carries no blocks")]
    EmptyPublish,

    #[error("block {block_id} has non-positive duration")]
    EmptyBlock { block_id: Uuid },

    #[error("blocks are not contiguous at {at_utc_ms} (expected start {expected_utc_ms})")]
    NonContiguous { at_utc_ms: i64, expected_utc_ms: i64 },

    #[error("mutation touches locked window [{window_start_ms}, {window_end_ms}) without operator override")]
    LockedWindow { window_start_ms: i64, window_end_ms: i64 },

    #[error("override range [{start_ms}, {end_ms}) does not align with existing block boundaries")]
    RangeMisaligned { start_ms: i64, end_ms: i64 },

    #[error("replacement blocks do not tile the override range exactly")]
    RangeNotTiled,
}

/// Consistent read of the execution window. Every entry shares one
/// generation id; generation ids strictly increase across publishes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub generation_id: u64,
    pub blocks:        Vec<Block>,
}

/// Rejoin position for a wall-clock instant inside the horizon.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RejoinPosition {
    pub block_index:        usize,
    pub block_start_utc_ms: i64,
    pub offset_ms:          i64,
}

struct Inner {
    blocks:        Vec<Block>,
    generation_id: u64,
}

pub struct ScheduleStore {
    locked_window_ms: i64,
    inner:            Mutex<Inner>,
}

fn validate_run(blocks: &[Block]) -> Result<(), StoreError> {
    if blocks.is_empty() {
        return Err(StoreError::EmptyPublish);
    }
    for b in blocks {
        if b.end_utc_ms <= b.start_utc_ms {
            return Err(StoreError::EmptyBlock { block_id: b.block_id });
        }
    }
    for w in blocks.windows(2) {
        if w[1].start_utc_ms != w[0].end_utc_ms {
            return Err(StoreError::NonContiguous {
                at_utc_ms:       w[1].start_utc_ms,
                expected_utc_ms: w[0].end_utc_ms,
            });
        }
    }
    Ok(())
}

impl ScheduleStore {
    pub fn new(locked_window_ms: i64) -> Self {
        Self {
            locked_window_ms,
            inner: Mutex::new(Inner { blocks: Vec::new(), generation_id: 0 }),
        }
    }

    /// Append blocks at the end of the horizon. All-or-nothing: validation
    /// failures leave the store untouched. Without `operator_override`, any
    /// appended block touching the locked window `[now, now + locked)` is
    /// rejected — schedule bootstrap across the present instant is an
    /// operator action.
    pub fn publish_extend(
        &self,
        blocks: Vec<Block>,
        now_utc_ms: i64,
        operator_override: bool,
    ) -> Result<u64, StoreError> {
        validate_run(&blocks)?;
        self.check_locked_window(&blocks, now_utc_ms, operator_override)?;

        let mut inner = self.inner.lock().unwrap();
        if let Some(last) = inner.blocks.last() {
            if blocks[0].start_utc_ms != last.end_utc_ms {
                return Err(StoreError::NonContiguous {
                    at_utc_ms:       blocks[0].start_utc_ms,
                    expected_utc_ms: last.end_utc_ms,
                });
            }
        }
        inner.blocks.extend(blocks);
        inner.generation_id += 1;
        Ok(inner.generation_id)
    }

    /// Atomically replace `[start_ms, end_ms)` with `blocks`. The range must
    /// align with existing block boundaries and the replacements must tile it
    /// exactly. Inside the locked window this requires `operator_override`.
    pub fn publish_override(
        &self,
        start_ms: i64,
        end_ms: i64,
        blocks: Vec<Block>,
        now_utc_ms: i64,
        operator_override: bool,
    ) -> Result<u64, StoreError> {
        validate_run(&blocks)?;
        if blocks.first().unwrap().start_utc_ms != start_ms
            || blocks.last().unwrap().end_utc_ms != end_ms
        {
            return Err(StoreError::RangeNotTiled);
        }
        self.check_locked_window(&blocks, now_utc_ms, operator_override)?;

        let mut inner = self.inner.lock().unwrap();
        let lo = inner.blocks.iter().position(|b| b.start_utc_ms == start_ms);
        let hi = inner.blocks.iter().position(|b| b.end_utc_ms == end_ms);
        let (lo, hi) = match (lo, hi) {
            (Some(lo), Some(hi)) if lo <= hi => (lo, hi),
            _ => return Err(StoreError::RangeMisaligned { start_ms, end_ms }),
        };
        inner.blocks.splice(lo..=hi, blocks);
        inner.generation_id += 1;
        Ok(inner.generation_id)
    }

    fn check_locked_window(
        &self,
        blocks: &[Block],
        now_utc_ms: i64,
        operator_override: bool,
    ) -> Result<(), StoreError> {
        if operator_override {
            return Ok(());
        }
        let window_end = now_utc_ms + self.locked_window_ms;
        let touches = blocks
            .iter()
            .any(|b| b.start_utc_ms < window_end && b.end_utc_ms > now_utc_ms);
        if touches {
            return Err(StoreError::LockedWindow {
                window_start_ms: now_utc_ms,
                window_end_ms:   window_end,
            });
        }
        Ok(())
    }

    /// Consistent copy of the blocks intersecting `[from_ms, to_ms)`.
    pub fn snapshot(&self, from_ms: i64, to_ms: i64) -> Snapshot {
        let inner = self.inner.lock().unwrap();
        Snapshot {
            generation_id: inner.generation_id,
            blocks: inner
                .blocks
                .iter()
                .filter(|b| b.start_utc_ms < to_ms && b.end_utc_ms > from_ms)
                .cloned()
                .collect(),
        }
    }

    /// Everything currently published.
    pub fn snapshot_all(&self) -> Snapshot {
        let inner = self.inner.lock().unwrap();
        Snapshot { generation_id: inner.generation_id, blocks: inner.blocks.clone() }
    }

    /// UTC end of the published horizon, if any.
    pub fn horizon_end_ms(&self) -> Option<i64> {
        self.inner.lock().unwrap().blocks.last().map(|b| b.end_utc_ms)
    }

    /// Block index + offset for a wall-clock instant, for mid-block rejoin.
    pub fn compute_position(&self, at_utc_ms: i64) -> Option<RejoinPosition> {
        let inner = self.inner.lock().unwrap();
        inner
            .blocks
            .iter()
            .position(|b| b.start_utc_ms <= at_utc_ms && at_utc_ms < b.end_utc_ms)
            .map(|i| RejoinPosition {
                block_index:        i,
                block_start_utc_ms: inner.blocks[i].start_utc_ms,
                offset_ms:          at_utc_ms - inner.blocks[i].start_utc_ms,
            })
    }
}
