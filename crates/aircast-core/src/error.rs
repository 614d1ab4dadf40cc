// crates/aircast-core/src/error.rs
//
// Error kinds along the tick path, grouped by propagation policy. The policy
// itself lives at the call sites: transient-local errors are absorbed where
// they occur, planning errors skip to the next queue item, data-contract and
// coordination violations refuse the mutation and continue, terminal errors
// drive the boundary machine to FAILED_TERMINAL. Nothing here is a panic —
// panics are reserved for programmer errors (destroying a buffer with a live
// fill thread).

use thiserror::Error;
use uuid::Uuid;

/// Recoverable planning failures: skip, evaluate the next queue item, log.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanningError {
    #[error("stale block {block_id}: fence tick {fence_tick} <= session frame index {now_tick}")]
    StaleBlock { block_id: Uuid, fence_tick: u64, now_tick: u64 },

    #[error("preload failed for block {block_id}: {msg}")]
    PreloadFailed { block_id: Uuid, msg: String },

    #[error("execution horizon exhausted at tick {tick}")]
    HorizonExhausted { tick: u64 },
}

/// Data-contract violations: reject at the boundary, log, drop the datum.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DataContractError {
    #[error("audio not in house format: got {rate} Hz / {channels} ch, house is {house_rate} Hz / {house_channels} ch")]
    NonHouseAudio { rate: u32, channels: u32, house_rate: u32, house_channels: u32 },

    #[error("zero-sample audio frame rejected")]
    ZeroSampleAudio,

    #[error("video frame payload is {got} bytes, house frame is {want}")]
    BadFrameSize { got: usize, want: usize },
}

/// Coordination violations: log, refuse the mutation, continue. These signal
/// a sequencing bug upstream, not corrupt output.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("seam take requested with no armed live source at tick {tick}")]
    SeamWithoutArmedSource { tick: u64 },

    #[error("second seam take refused at tick {tick} (last take tick {last})")]
    DoubleTake { tick: u64, last: u64 },
}

/// Terminal failures: boundary goes FAILED_TERMINAL, timers cancel, session
/// tears down.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TerminalError {
    #[error("teardown grace timeout after {grace_ms} ms in transient state {state}")]
    GraceTimeout { grace_ms: u64, state: &'static str },

    #[error("switch issuance failed: {msg}")]
    SwitchIssuance { msg: String },
}
