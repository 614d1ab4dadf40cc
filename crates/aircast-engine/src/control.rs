// crates/aircast-engine/src/control.rs
//
// The channel's public surface — where the schedule authority's RPC lands.
// Everything here is thin: feeds and overrides go to the execution-window
// store (the pipeline re-snapshots as it plans), attach/detach touch the
// egress registry, stop begins the teardown negotiation. The master tick
// thread is spawned here and joined on stop.

use std::net::TcpStream;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use uuid::Uuid;

use aircast_core::anchor::{Clock, SessionAnchor};
use aircast_core::attribution::FrameAttribution;
use aircast_core::block::Block;
use aircast_core::config::ChannelConfig;
use aircast_core::health::HealthReport;
use aircast_core::store::{ScheduleStore, StoreError};
use aircast_media::egress::{ByteSink, EgressSet, SocketEgress};
use aircast_media::encoder::HouseEncoder;
use aircast_media::producer::FileProducer;
use aircast_media::sink::TsSink;

use crate::emit::{EmitStage, EncoderStage};
use crate::event::{EngineEvent, EventHub};
use crate::pipeline::PipelineManager;
use crate::preloader::ProducerFactory;
use crate::session::SharedState;

/// A running 24/7 channel.
pub struct Channel {
    cfg:    Arc<ChannelConfig>,
    clock:  Arc<dyn Clock>,
    store:  Arc<ScheduleStore>,
    shared: Arc<SharedState>,
    egress: Arc<EgressSet>,

    events_rx: Receiver<EngineEvent>,
    frames_rx: Receiver<FrameAttribution>,
    master:    Option<JoinHandle<()>>,
}

impl Channel {
    /// Start with the production chain: file producers, house encoder,
    /// clock-paced TS sink.
    pub fn start(
        cfg: ChannelConfig,
        clock: Arc<dyn Clock>,
        store: Arc<ScheduleStore>,
    ) -> Result<Self> {
        cfg.validate().context("channel config")?;
        let cfg = Arc::new(cfg);

        let anchor = SessionAnchor::capture(clock.as_ref());
        let egress = Arc::new(EgressSet::new());

        let encoder = HouseEncoder::new(&cfg.video, &cfg.audio)?;
        let sink = TsSink::start(
            Arc::clone(&clock),
            anchor,
            Arc::clone(&egress),
            cfg.sink_queue_frames,
        );
        let emit = Box::new(EncoderStage::new(encoder, sink));

        let video = cfg.video;
        let audio = cfg.audio;
        let factory: ProducerFactory = Arc::new(move |segment, offset_ms| {
            let uri = segment
                .asset_uri
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("segment {} has no asset", segment.segment_uuid))?;
            let producer = FileProducer::open(
                uri.into(),
                video,
                audio,
                offset_ms,
                segment.probed_duration_ms,
            )?;
            Ok(Box::new(producer) as Box<dyn aircast_media::FrameProducer>)
        });

        Self::start_with(cfg, clock, store, anchor, egress, emit, factory)
    }

    /// Start with injected emit stage and producer factory. This is the seam
    /// integration tests drive a channel through without ffmpeg in the loop.
    pub fn start_with(
        cfg: Arc<ChannelConfig>,
        clock: Arc<dyn Clock>,
        store: Arc<ScheduleStore>,
        anchor: SessionAnchor,
        egress: Arc<EgressSet>,
        emit: Box<dyn EmitStage>,
        factory: ProducerFactory,
    ) -> Result<Self> {
        let shared = SharedState::new(cfg.grace_timeout_ms);
        let (events, events_rx, frames_rx) = EventHub::new();

        let pipeline = PipelineManager::new(
            Arc::clone(&cfg),
            Arc::clone(&clock),
            anchor,
            Arc::clone(&store),
            Arc::clone(&shared),
            emit,
            factory,
            events,
        );

        let master = std::thread::Builder::new()
            .name("aircast-tick".into())
            .spawn(move || pipeline.run())
            .context("spawn master tick thread")?;

        Ok(Self {
            cfg,
            clock,
            store,
            shared,
            egress,
            events_rx,
            frames_rx,
            master: Some(master),
        })
    }

    // ── Control surface ───────────────────────────────────────────────────────

    /// AttachStream: open a sink for a viewer. Idempotent per viewer id.
    pub fn attach_stream(&self, viewer: Uuid, stream: TcpStream) -> bool {
        let sink = SocketEgress::start(stream, self.cfg.egress_queue_bytes);
        self.attach_sink(viewer, Box::new(sink))
    }

    /// Attach an arbitrary byte sink (tests, recorders).
    pub fn attach_sink(&self, viewer: Uuid, sink: Box<dyn ByteSink>) -> bool {
        let attached = self.egress.attach(viewer, sink);
        if attached {
            log::info!("viewer {viewer} attached ({} total)", self.egress.viewer_count());
        }
        attached
    }

    /// DetachStream: close one viewer's sink. The tick loop continues.
    pub fn detach_stream(&self, viewer: Uuid) -> bool {
        let detached = self.egress.detach(viewer);
        if detached {
            log::info!("viewer {viewer} detached ({} left)", self.egress.viewer_count());
        }
        detached
    }

    /// FeedBlock: extend the horizon by one block. Rejected inside the locked
    /// window — operator overrides go through [`override_block`].
    ///
    /// [`override_block`]: Channel::override_block
    pub fn feed_block(&self, block: Block) -> Result<u64, StoreError> {
        self.store
            .publish_extend(vec![block], self.clock.utc_now_ms(), false)
    }

    /// OverrideBlock: atomically replace a range. Inside the locked window
    /// only with `operator_override`.
    pub fn override_block(
        &self,
        start_ms: i64,
        end_ms: i64,
        blocks: Vec<Block>,
        operator_override: bool,
    ) -> Result<u64, StoreError> {
        self.store.publish_override(
            start_ms,
            end_ms,
            blocks,
            self.clock.utc_now_ms(),
            operator_override,
        )
    }

    /// Health: horizon compliance, lateness percentiles, detach counts.
    pub fn health(&self) -> HealthReport {
        let now = self.clock.utc_now_ms();
        let horizon_ok = self
            .store
            .horizon_end_ms()
            .map(|end| end > now + 60_000)
            .unwrap_or(false);
        let mut report = self.shared.stats.lock().report(horizon_ok);
        report.detaches += self.egress.detach_count();
        report
    }

    pub fn viewer_count(&self) -> usize {
        self.egress.viewer_count()
    }

    /// Block lifecycle + fault events.
    pub fn events(&self) -> &Receiver<EngineEvent> {
        &self.events_rx
    }

    /// Per-frame attribution stream (drops under back-pressure).
    pub fn frames(&self) -> &Receiver<FrameAttribution> {
        &self.frames_rx
    }

    /// StopChannel: begin the two-phase teardown and wait for the master
    /// thread to complete it.
    pub fn stop(mut self) {
        self.shared.request_stop(self.clock.as_ref());
        if let Some(h) = self.master.take() {
            let _ = h.join();
        }
        self.egress.detach_all();
        log::info!("channel stopped");
    }
}
