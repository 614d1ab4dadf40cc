// crates/aircast-core/src/health.rs
//
// Per-tick observability: lateness percentiles over a sliding window,
// underflow events with depth-at-event, pad counts by reason, detach counts.
// Written only by the master tick thread; snapshotted for the Health() call.

use serde::{Deserialize, Serialize};

use crate::attribution::PadReason;

/// Fixed-size lateness window. 4096 ticks ≈ 2¼ minutes at 30 fps — enough to
/// make p99 meaningful without unbounded growth.
const LATENESS_WINDOW: usize = 4096;

#[derive(Debug)]
pub struct TickStats {
    lateness_ms: Vec<f64>,
    next:        usize,
    filled:      bool,

    pub ticks_emitted:    u64,
    pub underflows:       u64,
    pub last_underflow_depth: usize,
    pub pad_buffer_empty: u64,
    pub pad_producer_gated: u64,
    pub pad_slot_skipped: u64,
    pub pad_ct_mismatch:  u64,
    pub pad_deficit_fill: u64,
    pub pad_unknown:      u64,
    pub freezes:          u64,
    pub detaches:         u64,
    pub horizon_faults:   u64,
}

impl TickStats {
    pub fn new() -> Self {
        Self {
            lateness_ms: vec![0.0; LATENESS_WINDOW],
            next: 0,
            filled: false,
            ticks_emitted: 0,
            underflows: 0,
            last_underflow_depth: 0,
            pad_buffer_empty: 0,
            pad_producer_gated: 0,
            pad_slot_skipped: 0,
            pad_ct_mismatch: 0,
            pad_deficit_fill: 0,
            pad_unknown: 0,
            freezes: 0,
            detaches: 0,
            horizon_faults: 0,
        }
    }

    pub fn record_tick(&mut self, lateness_ms: f64) {
        self.ticks_emitted += 1;
        self.lateness_ms[self.next] = lateness_ms.max(0.0);
        self.next = (self.next + 1) % LATENESS_WINDOW;
        if self.next == 0 {
            self.filled = true;
        }
    }

    pub fn record_underflow(&mut self, depth_at_event: usize) {
        self.underflows += 1;
        self.last_underflow_depth = depth_at_event;
    }

    pub fn record_pad(&mut self, reason: PadReason) {
        match reason {
            PadReason::BufferTrulyEmpty   => self.pad_buffer_empty += 1,
            PadReason::ProducerGated      => self.pad_producer_gated += 1,
            PadReason::CtSlotSkipped      => self.pad_slot_skipped += 1,
            PadReason::FrameCtMismatch    => self.pad_ct_mismatch += 1,
            PadReason::ContentDeficitFill => self.pad_deficit_fill += 1,
            PadReason::Unknown            => self.pad_unknown += 1,
        }
    }

    fn percentile(&self, p: f64) -> f64 {
        let len = if self.filled { LATENESS_WINDOW } else { self.next };
        if len == 0 {
            return 0.0;
        }
        let mut window: Vec<f64> = self.lateness_ms[..len].to_vec();
        window.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let idx = ((len as f64 - 1.0) * p).round() as usize;
        window[idx]
    }

    pub fn report(&self, horizon_ok: bool) -> HealthReport {
        HealthReport {
            horizon_ok,
            ticks_emitted:  self.ticks_emitted,
            lateness_p50_ms: self.percentile(0.50),
            lateness_p95_ms: self.percentile(0.95),
            lateness_p99_ms: self.percentile(0.99),
            underflows:     self.underflows,
            pad_frames: self.pad_buffer_empty
                + self.pad_producer_gated
                + self.pad_slot_skipped
                + self.pad_ct_mismatch
                + self.pad_deficit_fill
                + self.pad_unknown,
            freezes:        self.freezes,
            detaches:       self.detaches,
            horizon_faults: self.horizon_faults,
        }
    }
}

impl Default for TickStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot returned by the control surface's Health() call.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct HealthReport {
    pub horizon_ok:      bool,
    pub ticks_emitted:   u64,
    pub lateness_p50_ms: f64,
    pub lateness_p95_ms: f64,
    pub lateness_p99_ms: f64,
    pub underflows:      u64,
    pub pad_frames:      u64,
    pub freezes:         u64,
    pub detaches:        u64,
    pub horizon_faults:  u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_over_partial_window() {
        let mut s = TickStats::new();
        for i in 0..100 {
            s.record_tick(i as f64);
        }
        let r = s.report(true);
        assert!((r.lateness_p50_ms - 50.0).abs() <= 1.0);
        assert!(r.lateness_p99_ms >= 97.0);
        assert_eq!(r.ticks_emitted, 100);
    }

    #[test]
    fn negative_lateness_clamps_to_zero() {
        let mut s = TickStats::new();
        s.record_tick(-3.0);
        assert_eq!(s.report(true).lateness_p99_ms, 0.0);
    }

    #[test]
    fn pad_counts_split_by_reason() {
        let mut s = TickStats::new();
        s.record_pad(PadReason::ContentDeficitFill);
        s.record_pad(PadReason::ContentDeficitFill);
        s.record_pad(PadReason::ProducerGated);
        assert_eq!(s.pad_deficit_fill, 2);
        assert_eq!(s.report(true).pad_frames, 3);
    }
}
