// crates/aircast-core/src/anchor.rs
//
// Session time anchor and the Clock abstraction.
//
// A single UTC epoch is captured when the session starts; every deadline,
// fence tick and PTS derives from that epoch plus the rational output rate.
// The monotonic half of the anchor immunises the tick grid against NTP steps:
// wall-clock is read once, then never consulted for pacing again.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::clock::FrameRate;

/// Time source for the engine. Production uses [`SystemClock`]; tests drive a
/// [`FakeClock`] so tick-grid behaviour is deterministic.
pub trait Clock: Send + Sync {
    /// Wall-clock UTC in milliseconds since the Unix epoch. Read at session
    /// start and by the schedule store's locked-window check — never for
    /// pacing.
    fn utc_now_ms(&self) -> i64;

    /// Monotonic nanoseconds since an arbitrary per-clock origin.
    fn mono_now_ns(&self) -> u64;

    /// Block the calling thread until `mono_now_ns() >= deadline_ns`.
    fn sleep_until_mono_ns(&self, deadline_ns: u64);
}

/// Instant-backed monotonic clock with a fixed origin.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn utc_now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    fn mono_now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn sleep_until_mono_ns(&self, deadline_ns: u64) {
        let now = self.mono_now_ns();
        if deadline_ns > now {
            std::thread::sleep(Duration::from_nanos(deadline_ns - now));
        }
    }
}

/// Manually-advanced clock for tests. `sleep_until_mono_ns` jumps straight to
/// the deadline, advancing wall time in lock-step so locked-window checks stay
/// coherent with the grid.
pub struct FakeClock {
    utc_ms:  AtomicI64,
    mono_ns: AtomicU64,
}

impl FakeClock {
    pub fn new(utc_ms: i64) -> Self {
        Self { utc_ms: AtomicI64::new(utc_ms), mono_ns: AtomicU64::new(0) }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.mono_ns.fetch_add(ms * 1_000_000, Ordering::SeqCst);
        self.utc_ms.fetch_add(ms as i64, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn utc_now_ms(&self) -> i64 {
        self.utc_ms.load(Ordering::SeqCst)
    }

    fn mono_now_ns(&self) -> u64 {
        self.mono_ns.load(Ordering::SeqCst)
    }

    fn sleep_until_mono_ns(&self, deadline_ns: u64) {
        let now = self.mono_ns.load(Ordering::SeqCst);
        if deadline_ns > now {
            let delta = deadline_ns - now;
            self.mono_ns.fetch_add(delta, Ordering::SeqCst);
            self.utc_ms.fetch_add((delta / 1_000_000) as i64, Ordering::SeqCst);
        }
    }
}

/// Immutable session time anchor: captured once on tune-in, shared by every
/// component for the life of the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionAnchor {
    pub epoch_utc_ms:  i64,
    pub epoch_mono_ns: u64,
}

impl SessionAnchor {
    pub fn capture(clock: &dyn Clock) -> Self {
        Self {
            epoch_utc_ms:  clock.utc_now_ms(),
            epoch_mono_ns: clock.mono_now_ns(),
        }
    }

    /// Fixed anchor for replay/rejoin: the epoch is a schedule instant, not
    /// "now". `mono` is the monotonic reading that corresponds to it.
    pub fn at(epoch_utc_ms: i64, epoch_mono_ns: u64) -> Self {
        Self { epoch_utc_ms, epoch_mono_ns }
    }

    /// Monotonic deadline of tick `n`.
    pub fn deadline_ns(&self, rate: FrameRate, tick: u64) -> u64 {
        self.epoch_mono_ns + rate.tick_deadline_ns(tick)
    }

    /// First tick at or after the UTC instant `end_utc_ms`:
    /// `ceil((end − epoch)·num / (den·1000))`. Instants at or before the
    /// epoch map to tick 0.
    ///
    /// This is the fence computation — evaluated exactly once when a block is
    /// fed, then immutable.
    pub fn fence_tick(&self, rate: FrameRate, end_utc_ms: i64) -> u64 {
        let delta_ms = end_utc_ms - self.epoch_utc_ms;
        if delta_ms <= 0 {
            return 0;
        }
        let a = delta_ms as u128 * rate.num() as u128;
        let b = rate.den() as u128 * 1000;
        ((a + b - 1) / b) as u64
    }

    /// Tick whose grid time contains the UTC instant `at_utc_ms` (floor).
    /// Used for mid-block rejoin position computation.
    pub fn tick_at_utc_ms(&self, rate: FrameRate, at_utc_ms: i64) -> u64 {
        let delta_ms = at_utc_ms - self.epoch_utc_ms;
        if delta_ms <= 0 {
            return 0;
        }
        let a = delta_ms as u128 * rate.num() as u128;
        let b = rate.den() as u128 * 1000;
        (a / b) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2025-02-08T06:00:00Z
    const EPOCH_MS: i64 = 1_738_987_200_000;

    fn anchor() -> SessionAnchor {
        SessionAnchor::at(EPOCH_MS, 5_000_000)
    }

    fn r30() -> FrameRate {
        FrameRate::new(30, 1).unwrap()
    }

    #[test]
    fn fence_for_thirty_minute_block() {
        // 30 min at 30 fps → fence tick 54_000
        assert_eq!(anchor().fence_tick(r30(), EPOCH_MS + 1_800_000), 54_000);
    }

    #[test]
    fn fence_rounds_up_partial_frames() {
        let a = anchor();
        assert_eq!(a.fence_tick(r30(), EPOCH_MS + 1), 1);
        assert_eq!(a.fence_tick(r30(), EPOCH_MS + 33), 1);
        assert_eq!(a.fence_tick(r30(), EPOCH_MS + 34), 2);
    }

    #[test]
    fn fence_at_or_before_epoch_is_zero() {
        let a = anchor();
        assert_eq!(a.fence_tick(r30(), EPOCH_MS), 0);
        assert_eq!(a.fence_tick(r30(), EPOCH_MS - 10_000), 0);
    }

    #[test]
    fn day_crossover_fences_are_integer_equal() {
        // last block of day N ends exactly where day N+1 begins: both sides
        // of the seam compute the same tick.
        let a = anchor();
        let midnight = EPOCH_MS + 86_400_000;
        let end_of_day = a.fence_tick(r30(), midnight);
        let start_of_next = a.tick_at_utc_ms(r30(), midnight);
        assert_eq!(end_of_day, start_of_next);
        assert_eq!(end_of_day, 86_400 * 30);
    }

    #[test]
    fn rejoin_position_at_twelve_fifteen() {
        // joining at epoch + 12 min 15 s lands on tick 735·30
        let a = anchor();
        let t = EPOCH_MS + 735_000;
        assert_eq!(a.tick_at_utc_ms(r30(), t), 735 * 30);
    }

    #[test]
    fn deadlines_are_anchored_to_monotonic_epoch() {
        let a = anchor();
        assert_eq!(a.deadline_ns(r30(), 0), 5_000_000);
        assert_eq!(a.deadline_ns(r30(), 30), 5_000_000 + 1_000_000_000);
    }

    #[test]
    fn fake_clock_sleep_advances_both_timescales() {
        let c = FakeClock::new(EPOCH_MS);
        c.sleep_until_mono_ns(2_000_000_000);
        assert_eq!(c.mono_now_ns(), 2_000_000_000);
        assert_eq!(c.utc_now_ms(), EPOCH_MS + 2000);
        // sleeping into the past is a no-op
        c.sleep_until_mono_ns(1_000_000_000);
        assert_eq!(c.mono_now_ns(), 2_000_000_000);
    }
}
