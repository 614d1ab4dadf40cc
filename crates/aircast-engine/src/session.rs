// crates/aircast-engine/src/session.rs
//
// Session-shared state and the two-phase teardown negotiation.
//
// The master tick thread is the only writer of the tick state; everyone else
// reads snapshots. Teardown: a stop request is recorded with a grace
// deadline; the tick loop executes it as soon as the boundary machine is in
// a stable state, or forces FAILED_TERMINAL (cancelling transient timers)
// when the grace expires first.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use aircast_core::anchor::Clock;
use aircast_core::boundary::{BlockBoundary, BoundaryState};
use aircast_core::health::TickStats;

/// The per-tick pair observers may read: both fields move together under the
/// lock, so a reader always sees a consistent (index, fence) — and therefore
/// a consistent `remaining = fence − index`.
#[derive(Clone, Copy, Debug)]
pub struct TickState {
    pub session_frame_index: u64,
    /// Fence of the active block; `u64::MAX` when no block is active.
    pub fence_tick: u64,
}

impl TickState {
    pub fn remaining_block_frames(&self) -> u64 {
        self.fence_tick.saturating_sub(self.session_frame_index)
    }
}

pub enum TeardownDecision {
    Continue,
    /// Stable state reached: tear down now.
    TearDown,
    /// Grace expired while transient: force FAILED_TERMINAL, then tear down.
    ForceTerminal,
}

pub struct SharedState {
    tick:     Mutex<TickState>,
    pub stats:    Mutex<TickStats>,
    pub boundary: Mutex<BlockBoundary>,

    stop_requested:   AtomicBool,
    stop_deadline_ns: AtomicU64,
    grace_ms:         u64,
}

impl SharedState {
    pub fn new(grace_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            tick: Mutex::new(TickState { session_frame_index: 0, fence_tick: u64::MAX }),
            stats: Mutex::new(TickStats::new()),
            boundary: Mutex::new(BlockBoundary::new()),
            stop_requested: AtomicBool::new(false),
            stop_deadline_ns: AtomicU64::new(0),
            grace_ms,
        })
    }

    pub fn tick_state(&self) -> TickState {
        *self.tick.lock()
    }

    /// Master-thread-only: publish the post-tick pair atomically.
    pub fn publish_tick(&self, session_frame_index: u64, fence_tick: u64) {
        *self.tick.lock() = TickState { session_frame_index, fence_tick };
    }

    /// Begin teardown negotiation. Idempotent; the first call arms the grace
    /// deadline.
    pub fn request_stop(&self, clock: &dyn Clock) {
        if self
            .stop_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.stop_deadline_ns
                .store(clock.mono_now_ns() + self.grace_ms * 1_000_000, Ordering::SeqCst);
            log::info!("stop requested; grace {} ms", self.grace_ms);
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Evaluated once per tick by the master thread.
    pub fn teardown_decision(&self, clock: &dyn Clock) -> TeardownDecision {
        if !self.stop_requested() {
            return TeardownDecision::Continue;
        }
        let boundary = self.boundary.lock();
        if boundary.teardown_permitted() {
            return TeardownDecision::TearDown;
        }
        if clock.mono_now_ns() >= self.stop_deadline_ns.load(Ordering::SeqCst) {
            return TeardownDecision::ForceTerminal;
        }
        log::debug!(
            "teardown deferred: boundary {} is transient",
            boundary.state().name()
        );
        TeardownDecision::Continue
    }

    /// Force the boundary machine terminal (grace expiry). Cancels all
    /// transient timers on entry.
    pub fn force_terminal(&self) {
        let mut boundary = self.boundary.lock();
        let from = boundary.state();
        if boundary.transition(BoundaryState::FailedTerminal).is_ok() {
            log::error!("grace timeout in {}; boundary FAILED_TERMINAL", from.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aircast_core::anchor::FakeClock;

    #[test]
    fn remaining_is_fence_minus_index() {
        let s = SharedState::new(10_000);
        s.publish_tick(100, 54_000);
        let t = s.tick_state();
        assert_eq!(t.remaining_block_frames(), 53_900);
    }

    #[test]
    fn stop_in_stable_state_tears_down_immediately() {
        let s = SharedState::new(10_000);
        let clock = FakeClock::new(0);
        s.request_stop(&clock);
        assert!(matches!(s.teardown_decision(&clock), TeardownDecision::TearDown));
    }

    #[test]
    fn stop_defers_while_transient_then_forces_terminal_at_grace() {
        let s = SharedState::new(10_000);
        let clock = FakeClock::new(0);
        {
            let mut b = s.boundary.lock();
            b.transition(BoundaryState::Planned).unwrap();
            b.transition(BoundaryState::PreloadIssued).unwrap();
        }
        s.request_stop(&clock);
        assert!(matches!(s.teardown_decision(&clock), TeardownDecision::Continue));

        clock.advance_ms(9_999);
        assert!(matches!(s.teardown_decision(&clock), TeardownDecision::Continue));

        clock.advance_ms(2);
        assert!(matches!(s.teardown_decision(&clock), TeardownDecision::ForceTerminal));
        s.force_terminal();
        assert_eq!(s.boundary.lock().state(), BoundaryState::FailedTerminal);
        // terminal is stable: teardown proceeds
        assert!(matches!(s.teardown_decision(&clock), TeardownDecision::TearDown));
    }
}
