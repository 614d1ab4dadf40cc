// crates/aircast-core/src/config.rs
//
// Immutable channel configuration. Constructed (and validated) once at
// session start, then shared behind Arc — there is no mutation path, so
// mid-session config changes are rejected by construction rather than by
// runtime checks.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::FrameRate;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("video dimensions must be even and non-zero (got {width}x{height})")]
    BadDimensions { width: u32, height: u32 },
    #[error("gop_size must be positive")]
    ZeroGop,
    #[error("audio sample rate {0} is not a supported house rate")]
    BadSampleRate(u32),
    #[error("lookahead cap {cap} must exceed target {target}")]
    LookaheadBounds { target: usize, cap: usize },
    #[error("egress queue must hold at least one TS packet burst")]
    EgressQueueTooSmall,
}

/// House video format. Every decoded frame is conformed to this before it
/// enters the look-ahead; the encoder refuses anything else.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct VideoParams {
    pub width:    u32,
    pub height:   u32,
    pub rate:     FrameRate,
    /// Fixed GOP length in frames; scene-cut insertion is disabled.
    pub gop_size: u32,
    /// Target bitrate in bit/s; the encoder bounds actual output within ±10%.
    pub bitrate:  u64,
}

/// House audio format: AAC at this rate/layout on the wire.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels:    u32,
    pub bitrate:     u64,
}

impl AudioParams {
    /// Samples per video tick, floored. The sample clock is slaved to the
    /// tick grid, so this is the per-tick audio budget.
    pub fn samples_per_tick(&self, rate: FrameRate) -> u64 {
        self.sample_rate as u64 * rate.den() as u64 / rate.num() as u64
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LookaheadParams {
    /// Fill thread blocks at this depth; one pop frees one slot.
    pub target: usize,
    /// Hard cap — exceeded only transiently by the frame already being pushed.
    pub cap:    usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub video: VideoParams,
    pub audio: AudioParams,
    #[serde(default = "default_lookahead")]
    pub lookahead: LookaheadParams,
    /// Teardown grace: a session still in a transient boundary state this long
    /// after a stop request goes FAILED_TERMINAL and tears down anyway.
    #[serde(default = "default_grace_ms")]
    pub grace_timeout_ms: u64,
    /// Schedule mutations inside `[now, now + locked_window_ms)` require an
    /// operator override.
    #[serde(default = "default_locked_window_ms")]
    pub locked_window_ms: i64,
    /// Byte bound on each viewer's egress queue (byte-bounded, not
    /// chunk-bounded). Overflow detaches that viewer.
    #[serde(default = "default_egress_bytes")]
    pub egress_queue_bytes: usize,
    /// Sink ingress depth in tick-frames.
    #[serde(default = "default_sink_frames")]
    pub sink_queue_frames: usize,
}

fn default_lookahead() -> LookaheadParams {
    LookaheadParams { target: 8, cap: 16 }
}

fn default_grace_ms() -> u64 {
    10_000
}

fn default_locked_window_ms() -> i64 {
    2 * 60 * 60 * 1000
}

fn default_egress_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_sink_frames() -> usize {
    64
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let v = &self.video;
        if v.width == 0 || v.height == 0 || v.width % 2 != 0 || v.height % 2 != 0 {
            return Err(ConfigError::BadDimensions { width: v.width, height: v.height });
        }
        if v.gop_size == 0 {
            return Err(ConfigError::ZeroGop);
        }
        if !matches!(self.audio.sample_rate, 32_000 | 44_100 | 48_000) {
            return Err(ConfigError::BadSampleRate(self.audio.sample_rate));
        }
        if self.lookahead.cap <= self.lookahead.target || self.lookahead.target == 0 {
            return Err(ConfigError::LookaheadBounds {
                target: self.lookahead.target,
                cap:    self.lookahead.cap,
            });
        }
        if self.egress_queue_bytes < 188 * 64 {
            return Err(ConfigError::EgressQueueTooSmall);
        }
        Ok(())
    }
}
