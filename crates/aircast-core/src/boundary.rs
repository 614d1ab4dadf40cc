// crates/aircast-core/src/boundary.rs
//
// Block-boundary state machine. The transient states are the window where a
// transition to the next block is in flight; teardown is deferred while any
// of them is held. FAILED_TERMINAL is fully absorbing: no exits, no new
// scheduling intent, transient timers cancelled on entry.

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundaryState {
    None,
    Planned,
    PreloadIssued,
    SwitchScheduled,
    SwitchIssued,
    Live,
    FailedTerminal,
}

impl BoundaryState {
    pub fn name(&self) -> &'static str {
        match self {
            BoundaryState::None            => "NONE",
            BoundaryState::Planned         => "PLANNED",
            BoundaryState::PreloadIssued   => "PRELOAD_ISSUED",
            BoundaryState::SwitchScheduled => "SWITCH_SCHEDULED",
            BoundaryState::SwitchIssued    => "SWITCH_ISSUED",
            BoundaryState::Live            => "LIVE",
            BoundaryState::FailedTerminal  => "FAILED_TERMINAL",
        }
    }

    /// Transient states forbid teardown; stable ones permit it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BoundaryState::Planned
                | BoundaryState::PreloadIssued
                | BoundaryState::SwitchScheduled
                | BoundaryState::SwitchIssued
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal boundary transition {from} -> {to}")]
pub struct TransitionError {
    pub from: &'static str,
    pub to:   &'static str,
}

/// The boundary machine for one upcoming block transition.
///
/// Forward path: NONE → PLANNED → PRELOAD_ISSUED → SWITCH_SCHEDULED →
/// SWITCH_ISSUED → LIVE, then back to NONE when the next boundary begins
/// planning. Any state may fail into FAILED_TERMINAL; nothing leaves it.
#[derive(Debug)]
pub struct BlockBoundary {
    state: BoundaryState,
    /// Count of transient timers notionally outstanding; cleared on terminal
    /// entry so a late timer firing is recognisably stale.
    timer_generation: u64,
}

impl BlockBoundary {
    pub fn new() -> Self {
        Self { state: BoundaryState::None, timer_generation: 0 }
    }

    pub fn state(&self) -> BoundaryState {
        self.state
    }

    pub fn timer_generation(&self) -> u64 {
        self.timer_generation
    }

    pub fn teardown_permitted(&self) -> bool {
        !self.state.is_transient()
    }

    pub fn transition(&mut self, to: BoundaryState) -> Result<(), TransitionError> {
        use BoundaryState::*;
        let legal = match (self.state, to) {
            // absorbing: nothing leaves FAILED_TERMINAL
            (FailedTerminal, _) => false,
            // any live state may fail terminally
            (_, FailedTerminal) => true,
            (None, Planned) => true,
            (Planned, PreloadIssued) => true,
            (PreloadIssued, SwitchScheduled) => true,
            (SwitchScheduled, SwitchIssued) => true,
            (SwitchIssued, Live) => true,
            // boundary consumed; next block's cycle starts over
            (Live, None) => true,
            // a boundary whose switch has not been issued yet may be
            // abandoned (block skipped, preload failed, target went stale)
            (Planned, None) | (PreloadIssued, None) | (SwitchScheduled, None) => true,
            _ => false,
        };
        if !legal {
            return Err(TransitionError { from: self.state.name(), to: to.name() });
        }
        if to == BoundaryState::FailedTerminal {
            // cancel all pending transient timers on entry
            self.timer_generation += 1;
        }
        self.state = to;
        Ok(())
    }

    /// Arm a transient timer; returns the generation a later fire must match.
    pub fn arm_timer(&mut self) -> u64 {
        self.timer_generation
    }

    /// Whether a timer armed at `generation` is still current.
    pub fn timer_live(&self, generation: u64) -> bool {
        generation == self.timer_generation && self.state != BoundaryState::FailedTerminal
    }
}

impl Default for BlockBoundary {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BoundaryState::*;

    #[test]
    fn forward_path_is_legal() {
        let mut b = BlockBoundary::new();
        for s in [Planned, PreloadIssued, SwitchScheduled, SwitchIssued, Live, None] {
            b.transition(s).unwrap();
        }
        assert_eq!(b.state(), None);
    }

    #[test]
    fn transient_states_forbid_teardown() {
        let mut b = BlockBoundary::new();
        assert!(b.teardown_permitted()); // NONE
        b.transition(Planned).unwrap();
        assert!(!b.teardown_permitted());
        b.transition(PreloadIssued).unwrap();
        assert!(!b.teardown_permitted());
        b.transition(SwitchScheduled).unwrap();
        assert!(!b.teardown_permitted());
        b.transition(SwitchIssued).unwrap();
        assert!(!b.teardown_permitted());
        b.transition(Live).unwrap();
        assert!(b.teardown_permitted());
    }

    #[test]
    fn failed_terminal_is_absorbing() {
        let mut b = BlockBoundary::new();
        b.transition(Planned).unwrap();
        b.transition(FailedTerminal).unwrap();
        assert!(b.teardown_permitted());
        for s in [None, Planned, Live, FailedTerminal] {
            assert!(b.transition(s).is_err(), "escaped terminal via {s:?}");
        }
        assert_eq!(b.state(), FailedTerminal);
    }

    #[test]
    fn terminal_entry_cancels_timers() {
        let mut b = BlockBoundary::new();
        b.transition(Planned).unwrap();
        let g = b.arm_timer();
        assert!(b.timer_live(g));
        b.transition(FailedTerminal).unwrap();
        assert!(!b.timer_live(g));
    }

    #[test]
    fn skipping_is_legal_abandon_mid_switch_is_not() {
        let mut b = BlockBoundary::new();
        b.transition(Planned).unwrap();
        b.transition(None).unwrap(); // skipped before preload — fine

        b.transition(Planned).unwrap();
        b.transition(PreloadIssued).unwrap();
        b.transition(SwitchScheduled).unwrap();
        b.transition(SwitchIssued).unwrap();
        assert!(b.transition(None).is_err()); // an issued switch cannot be abandoned
    }
}
