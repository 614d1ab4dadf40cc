// crates/aircast-core/src/clock.rs
//
// Rational frame-rate arithmetic. Everything the tick grid derives from —
// deadlines, PTS, fence ticks — routes through here as integer math with
// 128-bit intermediates. No floats: a session runs for days, and float
// accumulation drifts audibly within hours.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateError {
    #[error("frame rate terms must be positive (got {num}/{den})")]
    ZeroTerm { num: u32, den: u32 },
}

/// Output frame rate as a positive rational in lowest terms.
///
/// `30/1` for integer rates, `30000/1001` for NTSC. Construction reduces the
/// pair, so equality is structural.
///
/// ```
/// use aircast_core::clock::FrameRate;
/// let ntsc = FrameRate::new(30_000, 1001).unwrap();
/// assert_eq!(ntsc.frame_index_to_pts_90k(1), 3003);
/// let thirty = FrameRate::new(60, 2).unwrap();
/// assert_eq!(thirty, FrameRate::new(30, 1).unwrap());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRate {
    num: u32,
    den: u32,
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

impl FrameRate {
    pub fn new(num: u32, den: u32) -> Result<Self, RateError> {
        if num == 0 || den == 0 {
            return Err(RateError::ZeroTerm { num, den });
        }
        let g = gcd(num, den);
        Ok(Self { num: num / g, den: den / g })
    }

    pub fn num(&self) -> u32 { self.num }
    pub fn den(&self) -> u32 { self.den }

    /// One tick period in microseconds (floor).
    pub fn frame_duration_us(&self) -> u64 {
        1_000_000u64 * self.den as u64 / self.num as u64
    }

    /// One tick period in nanoseconds (floor).
    pub fn frame_duration_ns(&self) -> u64 {
        1_000_000_000u64 * self.den as u64 / self.num as u64
    }

    /// One tick period in milliseconds (floor). 33 ms at 30 fps — coarse,
    /// diagnostics only.
    pub fn frame_duration_ms(&self) -> u64 {
        1_000u64 * self.den as u64 / self.num as u64
    }

    /// Grid time of tick `n` in microseconds since session epoch (floor).
    pub fn tick_time_us(&self, n: u64) -> u64 {
        (n as u128 * 1_000_000 * self.den as u128 / self.num as u128) as u64
    }

    /// Monotonic deadline offset of tick `n` in nanoseconds (round-half-up).
    ///
    /// Rounding (not floor) keeps the worst-case deadline error at half a
    /// nanosecond per tick instead of a full one; over a 24 h session at NTSC
    /// rates the difference is the whole drift budget.
    pub fn tick_deadline_ns(&self, n: u64) -> u64 {
        let a = n as u128 * 1_000_000_000 * self.den as u128;
        ((a + self.num as u128 / 2) / self.num as u128) as u64
    }

    /// Output PTS of frame `n` on the 90 kHz transport clock (floor).
    pub fn frame_index_to_pts_90k(&self, n: u64) -> i64 {
        (n as u128 * 90_000 * self.den as u128 / self.num as u128) as i64
    }

    /// Rounding inverse of [`frame_index_to_pts_90k`]: composed with the
    /// forward map it is the identity on frame indices.
    ///
    /// ```
    /// use aircast_core::clock::FrameRate;
    /// let r = FrameRate::new(30_000, 1001).unwrap();
    /// for n in [0u64, 1, 53_999, 2_592_000] {
    ///     assert_eq!(r.pts_90k_to_frame_index(r.frame_index_to_pts_90k(n)), n);
    /// }
    /// ```
    ///
    /// [`frame_index_to_pts_90k`]: FrameRate::frame_index_to_pts_90k
    pub fn pts_90k_to_frame_index(&self, pts: i64) -> u64 {
        debug_assert!(pts >= 0, "transport PTS is non-negative by construction");
        let denom = 2u128 * 90_000 * self.den as u128;
        ((pts as u128 * self.num as u128 * 2 + denom / 2) / denom) as u64
    }

    /// Per-frame PTS increment on the 90 kHz clock.
    ///
    /// Exact (constant between adjacent frames) whenever `90_000·den` is a
    /// multiple of `num` — true for every house rate this engine accepts
    /// (30/1, 25/1, 50/1, 60/1, 24/1, 30000/1001).
    pub fn frame_duration_90k(&self) -> i64 {
        (90_000u64 * self.den as u64 / self.num as u64) as i64
    }

    /// Whether the 90 kHz grid divides evenly, i.e. `frame_duration_90k` is
    /// exact rather than a floor.
    pub fn is_exact_90k(&self) -> bool {
        (90_000u64 * self.den as u64) % self.num as u64 == 0
    }
}

/// Source→output rate relationship, decided once per segment at probe time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateMode {
    /// Input and output rates are equal: pass frames through one-to-one.
    Off,
    /// Input is an integer multiple of output: keep every `step`-th frame.
    Drop { step: u32 },
    /// Non-integer ratio: repeat or skip against the integer tick grid.
    Cadence,
}

impl RateMode {
    /// Pure function of the two rates. `Off` ⇔ ratio is 1, `Drop` ⇔ ratio is
    /// an integer > 1, `Cadence` otherwise (including input slower than
    /// output).
    pub fn classify(input: FrameRate, output: FrameRate) -> RateMode {
        let a = input.num as u64 * output.den as u64;
        let b = input.den as u64 * output.num as u64;
        if a == b {
            RateMode::Off
        } else if a % b == 0 {
            RateMode::Drop { step: (a / b) as u32 }
        } else {
            RateMode::Cadence
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(num: u32, den: u32) -> FrameRate {
        FrameRate::new(num, den).unwrap()
    }

    #[test]
    fn construction_reduces_to_lowest_terms() {
        assert_eq!(r(60, 2), r(30, 1));
        assert_eq!(r(30_000, 1001).num(), 30_000);
        assert!(FrameRate::new(0, 1).is_err());
        assert!(FrameRate::new(30, 0).is_err());
    }

    #[test]
    fn thirty_fps_grid_values() {
        let rate = r(30, 1);
        assert_eq!(rate.frame_duration_us(), 33_333);
        assert_eq!(rate.frame_duration_90k(), 3000);
        assert_eq!(rate.frame_index_to_pts_90k(0), 0);
        // last frame of a 30-minute block at 30 fps
        assert_eq!(rate.frame_index_to_pts_90k(53_999), 161_997_000);
    }

    #[test]
    fn ntsc_pts_step_is_exactly_3003() {
        let rate = r(30_000, 1001);
        assert!(rate.is_exact_90k());
        for n in 0..10_000u64 {
            let d = rate.frame_index_to_pts_90k(n + 1) - rate.frame_index_to_pts_90k(n);
            assert_eq!(d, 3003);
        }
    }

    #[test]
    fn pts_round_trip_is_identity_on_frame_indices() {
        for rate in [r(30, 1), r(25, 1), r(60, 1), r(24, 1), r(30_000, 1001)] {
            for n in [0u64, 1, 2, 999, 54_000, 2_591_999, 7_776_000] {
                let pts = rate.frame_index_to_pts_90k(n);
                assert_eq!(rate.pts_90k_to_frame_index(pts), n, "rate {rate:?} n {n}");
            }
        }
    }

    #[test]
    fn deadline_does_not_drift_over_a_day() {
        // 24 h of NTSC ticks: deadline from the closed form must match the
        // exact rational to within 1 ns (no accumulation).
        let rate = r(30_000, 1001);
        let n = 24 * 60 * 60 * 30_000u64 / 1001;
        let exact = n as u128 * 1_000_000_000 * 1001 / 30_000;
        let got = rate.tick_deadline_ns(n) as u128;
        assert!(got.abs_diff(exact) <= 1);
    }

    #[test]
    fn classifier_modes() {
        assert_eq!(RateMode::classify(r(30, 1), r(30, 1)), RateMode::Off);
        assert_eq!(RateMode::classify(r(30_000, 1001), r(30_000, 1001)), RateMode::Off);
        assert_eq!(RateMode::classify(r(60, 1), r(30, 1)), RateMode::Drop { step: 2 });
        assert_eq!(RateMode::classify(r(120, 1), r(30, 1)), RateMode::Drop { step: 4 });
        assert_eq!(RateMode::classify(r(60_000, 1001), r(30_000, 1001)), RateMode::Drop { step: 2 });
        assert_eq!(RateMode::classify(r(25, 1), r(30, 1)), RateMode::Cadence);
        assert_eq!(RateMode::classify(r(30_000, 1001), r(30, 1)), RateMode::Cadence);
        assert_eq!(RateMode::classify(r(24, 1), r(30, 1)), RateMode::Cadence);
    }

    #[test]
    fn tick_time_us_matches_rational_floor() {
        let rate = r(30_000, 1001);
        assert_eq!(rate.tick_time_us(0), 0);
        assert_eq!(rate.tick_time_us(30_000), 1_001_000_000);
        // floor semantics: one tick is 33366.6…µs
        assert_eq!(rate.tick_time_us(1), 33_366);
    }
}
