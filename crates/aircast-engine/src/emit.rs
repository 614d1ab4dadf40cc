// crates/aircast-engine/src/emit.rs
//
// The emit seam between the tick loop and the transport chain. The pipeline
// speaks in packed house frames and sample counts; the production
// implementation encodes and hands the result to the clock-paced sink.
// Tests substitute a recorder, which is what keeps the tick loop's semantics
// testable without ffmpeg in the loop.

use anyhow::Result;

use aircast_media::encoder::HouseEncoder;
use aircast_media::frame::HouseAudioFrame;
use aircast_media::sink::{SinkFrame, SinkOffer, TsSink};
use aircast_media::EncodedPacket;

/// One tick's interaction, in call order: `begin_segment` (on seams only),
/// `video` exactly once, audio pushes, then `finish_tick` exactly once.
pub trait EmitStage: Send {
    /// Segment switch: reset the IDR gate so the segment opens on an IDR.
    fn begin_segment(&mut self);

    /// The tick's one video frame, stamped with its grid PTS.
    fn video(&mut self, pts_90k: i64, yuv: &[u8]) -> Result<()>;

    /// House audio for the sample clock. Contract violations are rejected
    /// inside, logged, and dropped — never propagated to the tick loop.
    fn audio(&mut self, frame: &HouseAudioFrame);

    /// Silence top-up on the house sample clock.
    fn silence(&mut self, samples: usize);

    /// Close the tick: drain encoders, hand off to the sink. Unconditional —
    /// there is no tick without a hand-off.
    fn finish_tick(&mut self, tick: u64, ct_us: u64) -> SinkOffer;

    /// Session teardown: flush encoders, stop the sink.
    fn finish(&mut self);
}

/// Production stage: house encoder in front of the TS sink.
pub struct EncoderStage {
    encoder: HouseEncoder,
    sink:    Option<TsSink>,
    pending: Vec<EncodedPacket>,
}

impl EncoderStage {
    pub fn new(encoder: HouseEncoder, sink: TsSink) -> Self {
        Self { encoder, sink: Some(sink), pending: Vec::new() }
    }
}

impl EmitStage for EncoderStage {
    fn begin_segment(&mut self) {
        self.encoder.begin_segment();
    }

    fn video(&mut self, pts_90k: i64, yuv: &[u8]) -> Result<()> {
        self.pending.extend(self.encoder.encode_video(yuv, pts_90k)?);
        Ok(())
    }

    fn audio(&mut self, frame: &HouseAudioFrame) {
        if let Err(e) = self.encoder.push_audio(frame) {
            log::warn!("audio rejected at encoder boundary: {e}");
        }
    }

    fn silence(&mut self, samples: usize) {
        self.encoder.push_silence(samples);
    }

    fn finish_tick(&mut self, _tick: u64, ct_us: u64) -> SinkOffer {
        match self.encoder.drain_audio() {
            Ok(pkts) => self.pending.extend(pkts),
            Err(e) => log::error!("audio encode: {e}"),
        }
        let packets = std::mem::take(&mut self.pending);
        match &self.sink {
            Some(sink) => sink.offer(SinkFrame { ct_us, packets }),
            None => SinkOffer::Stopped,
        }
    }

    fn finish(&mut self) {
        match self.encoder.finish() {
            Ok(packets) => {
                if let Some(sink) = &self.sink {
                    // flush tail rides the last grid instant; pacing is moot
                    let _ = sink.offer(SinkFrame { ct_us: 0, packets });
                }
            }
            Err(e) => log::error!("encoder flush: {e}"),
        }
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
    }
}
