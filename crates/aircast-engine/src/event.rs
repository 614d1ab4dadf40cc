// crates/aircast-engine/src/event.rs
//
// Engine event stream. Control events (block lifecycle, faults) and the
// per-frame attribution feed travel on separate channels: attribution flows
// at frame rate and is allowed to drop under back-pressure, control events
// are not allowed to be displaced by it.

use uuid::Uuid;

use aircast_core::attribution::FrameAttribution;

#[derive(Clone, Debug)]
pub enum EngineEvent {
    /// Emitted exactly once per block, at the tick where it becomes active.
    BlockStarted { block_id: Uuid, tick: u64 },
    BlockCompleted { block_id: Uuid, tick: u64 },
    BlockSkipped { block_id: Uuid, reason: String },
    /// No next block at the fence with an empty queue.
    HorizonFault { tick: u64 },
    /// Session entered FAILED_TERMINAL.
    Terminal { reason: String },
}

/// Bounded fan-out for engine events; frame attributions ride their own lane.
pub struct EventHub {
    control_tx: crossbeam_channel::Sender<EngineEvent>,
    frames_tx:  crossbeam_channel::Sender<FrameAttribution>,
    dropped_frames: u64,
}

impl EventHub {
    pub fn new() -> (Self, crossbeam_channel::Receiver<EngineEvent>, crossbeam_channel::Receiver<FrameAttribution>) {
        let (control_tx, control_rx) = crossbeam_channel::bounded(256);
        let (frames_tx, frames_rx) = crossbeam_channel::bounded(4096);
        (
            Self { control_tx, frames_tx, dropped_frames: 0 },
            control_rx,
            frames_rx,
        )
    }

    pub fn control(&self, event: EngineEvent) {
        if self.control_tx.try_send(event).is_err() {
            log::warn!("control event dropped: receiver not draining");
        }
    }

    pub fn frame(&mut self, attr: FrameAttribution) {
        if self.frames_tx.try_send(attr).is_err() {
            self.dropped_frames += 1;
        }
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }
}
