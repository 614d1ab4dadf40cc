// crates/aircast-engine/src/preloader.rs
//
// Single-threaded background executor for the pipeline's two deferrable
// jobs: priming the next block (or segment) ahead of its switch, and reaping
// retired fill threads. One preload is in flight at a time — the pipeline
// issues the next only after consuming the previous outcome — and the reap
// queue drains between loads.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use uuid::Uuid;

use aircast_core::block::{Segment, SegmentKind};
use aircast_core::config::LookaheadParams;
use aircast_core::error::PlanningError;
use aircast_media::lookahead::{BlockBuffers, FrameProducer, Retired};

/// Builds a producer for one segment at a media offset. The production
/// factory opens a FileProducer; tests substitute synthetic sources.
pub type ProducerFactory =
    Arc<dyn Fn(&Segment, i64) -> anyhow::Result<Box<dyn FrameProducer>> + Send + Sync>;

/// A segment with its first frame (and audio) buffered and its fill thread
/// running.
pub struct PrimedSegment {
    pub segment: Segment,
    pub buffers: BlockBuffers,
}

/// What the pipeline intends to do with a finished preload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreloadPurpose {
    /// First content segment of the next block.
    NextBlock,
    /// Upcoming segment within the active block.
    NextSegment,
}

pub enum PreloadRequest {
    Segment {
        purpose:   PreloadPurpose,
        block_id:  Uuid,
        segment:   Segment,
        offset_ms: i64,
    },
}

pub enum PreloadOutcome {
    Segment {
        purpose:  PreloadPurpose,
        block_id: Uuid,
        result:   Result<PrimedSegment, PlanningError>,
    },
}

enum Msg {
    Load(PreloadRequest),
    Reap(Retired),
    Shutdown,
}

pub struct Preloader {
    tx:     Sender<Msg>,
    rx_out: Receiver<PreloadOutcome>,
    handle: Option<JoinHandle<()>>,
}

/// Open, prime and start filling one segment's buffers. Shared by the
/// preloader worker and the pipeline's synchronous-drain path at the fence.
pub fn prime_segment(
    factory: &ProducerFactory,
    lookahead: LookaheadParams,
    segment: &Segment,
    offset_ms: i64,
) -> Result<PrimedSegment, PlanningError> {
    debug_assert!(segment.kind != SegmentKind::Pad, "pad segments need no producer");
    let fail = |msg: String| PlanningError::PreloadFailed {
        block_id: segment.segment_uuid, // segment identity; callers re-tag with block id
        msg,
    };

    let mut buffers = BlockBuffers::new(lookahead.target, lookahead.cap);
    let mut producer = factory(segment, offset_ms).map_err(|e| fail(e.to_string()))?;
    let queues = buffers.fill_queues();
    producer.prime(&queues).map_err(|e| fail(e.to_string()))?;
    buffers.start_filling(producer);
    Ok(PrimedSegment { segment: segment.clone(), buffers })
}

impl Preloader {
    pub fn start(factory: ProducerFactory, lookahead: LookaheadParams, reap_grace_ms: u64) -> Self {
        let (tx, rx) = unbounded::<Msg>();
        let (tx_out, rx_out) = unbounded::<PreloadOutcome>();

        let handle = thread::Builder::new()
            .name("aircast-preload".into())
            .spawn(move || {
                for msg in rx.iter() {
                    match msg {
                        Msg::Load(PreloadRequest::Segment { purpose, block_id, segment, offset_ms }) => {
                            let result = prime_segment(&factory, lookahead, &segment, offset_ms);
                            if let Err(e) = &result {
                                log::warn!("preload failed for block {block_id}: {e}");
                            }
                            let _ = tx_out.send(PreloadOutcome::Segment { purpose, block_id, result });
                        }
                        Msg::Reap(retired) => {
                            let begin = Instant::now();
                            retired.reap();
                            let took = begin.elapsed().as_millis() as u64;
                            if took > reap_grace_ms {
                                log::warn!("fill thread outlived its producer by {took} ms (grace {reap_grace_ms} ms)");
                            }
                        }
                        Msg::Shutdown => return,
                    }
                }
            })
            .expect("spawn preloader thread");

        Self { tx, rx_out, handle: Some(handle) }
    }

    pub fn request(&self, req: PreloadRequest) {
        let _ = self.tx.send(Msg::Load(req));
    }

    /// Deferred join of a detached fill thread; the buffers travel with it.
    pub fn reap(&self, retired: Retired) {
        let _ = self.tx.send(Msg::Reap(retired));
    }

    /// Non-blocking poll of finished preloads.
    pub fn poll(&self) -> Option<PreloadOutcome> {
        self.rx_out.try_recv().ok()
    }

    /// Drain outstanding reaps and stop the worker.
    pub fn shutdown(mut self) {
        let _ = self.tx.send(Msg::Shutdown);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aircast_media::frame::{HouseAudioFrame, HouseVideoFrame};
    use aircast_media::lookahead::FillQueues;

    struct OneFrame;

    impl FrameProducer for OneFrame {
        fn prime(&mut self, queues: &FillQueues) -> anyhow::Result<()> {
            queues.video.push(HouseVideoFrame { yuv: vec![1; 6], media_ct_ms: 0 });
            queues.audio.push(HouseAudioFrame::silence(8, 44_100, 0));
            Ok(())
        }

        fn run(&mut self, queues: &FillQueues) {
            queues.video.mark_eof();
        }
    }

    fn seg() -> Segment {
        Segment {
            segment_uuid: Uuid::new_v4(),
            kind: SegmentKind::Content,
            asset_uri: Some("test.mp4".into()),
            asset_uuid: Some(Uuid::new_v4()),
            frame_count: 1,
            probed_duration_ms: None,
        }
    }

    #[test]
    fn preload_primes_and_reports_back() {
        let factory: ProducerFactory = Arc::new(|_, _| Ok(Box::new(OneFrame) as Box<dyn FrameProducer>));
        let pre = Preloader::start(factory, LookaheadParams { target: 4, cap: 8 }, 1000);
        let block_id = Uuid::new_v4();
        pre.request(PreloadRequest::Segment {
            purpose:   PreloadPurpose::NextBlock,
            block_id,
            segment:   seg(),
            offset_ms: 0,
        });

        let outcome = loop {
            if let Some(o) = pre.poll() {
                break o;
            }
            thread::sleep(std::time::Duration::from_millis(2));
        };
        let PreloadOutcome::Segment { block_id: got, result, .. } = outcome;
        assert_eq!(got, block_id);
        let primed = result.unwrap();
        assert_eq!(primed.buffers.video.depth(), 1);
        pre.reap(primed.buffers.stop_filling_async());
        pre.shutdown();
    }

    #[test]
    fn failed_open_reports_planning_error() {
        let factory: ProducerFactory = Arc::new(|_, _| Err(anyhow::anyhow!("no such asset")));
        let pre = Preloader::start(factory, LookaheadParams { target: 4, cap: 8 }, 1000);
        pre.request(PreloadRequest::Segment {
            purpose:   PreloadPurpose::NextSegment,
            block_id:  Uuid::new_v4(),
            segment:   seg(),
            offset_ms: 0,
        });
        let outcome = loop {
            if let Some(o) = pre.poll() {
                break o;
            }
            thread::sleep(std::time::Duration::from_millis(2));
        };
        let PreloadOutcome::Segment { result, .. } = outcome;
        assert!(matches!(result, Err(PlanningError::PreloadFailed { .. })));
        pre.shutdown();
    }
}
