// crates/aircastd/src/main.rs
//
// Thin host process for one channel: load config + schedule, start the
// engine, hand accepted TCP connections to the sink as viewers, stop on
// Ctrl-C. Schedule authoring, EPG and asset management live elsewhere — this
// binary only executes.

use std::fs;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use uuid::Uuid;

use aircast_core::anchor::SystemClock;
use aircast_core::block::Block;
use aircast_core::config::ChannelConfig;
use aircast_core::store::ScheduleStore;
use aircast_engine::{Channel, EngineEvent};

#[derive(Parser, Debug)]
#[command(name = "aircastd", about = "24/7 broadcast channel playout engine")]
struct Args {
    /// Channel configuration (JSON).
    #[arg(long)]
    config: PathBuf,

    /// Pre-resolved execution plan: a contiguous array of blocks (JSON).
    #[arg(long)]
    schedule: PathBuf,

    /// Address to serve the MPEG-TS stream on.
    #[arg(long, default_value = "0.0.0.0:9090")]
    listen: SocketAddr,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg: ChannelConfig = serde_json::from_str(
        &fs::read_to_string(&args.config)
            .with_context(|| format!("read config {}", args.config.display()))?,
    )
    .context("parse channel config")?;

    let blocks: Vec<Block> = serde_json::from_str(
        &fs::read_to_string(&args.schedule)
            .with_context(|| format!("read schedule {}", args.schedule.display()))?,
    )
    .context("parse schedule")?;
    log::info!("schedule: {} blocks", blocks.len());

    let clock = Arc::new(SystemClock::new());
    let store = Arc::new(ScheduleStore::new(cfg.locked_window_ms));
    // bootstrap across the present instant is an operator action
    store
        .publish_extend(blocks, clock.utc_now_ms(), true)
        .context("publish initial schedule")?;

    let channel = Channel::start(cfg, clock, store)?;

    // drain lifecycle events into the log
    let events = channel.events().clone();
    std::thread::spawn(move || {
        for event in events.iter() {
            match event {
                EngineEvent::HorizonFault { tick } => log::error!("horizon fault at tick {tick}"),
                EngineEvent::Terminal { reason } => log::error!("terminal: {reason}"),
                other => log::info!("{other:?}"),
            }
        }
    });

    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("install signal handler")?;

    let listener = TcpListener::bind(args.listen)
        .with_context(|| format!("bind {}", args.listen))?;
    listener.set_nonblocking(true)?;
    log::info!("serving MPEG-TS on {}", args.listen);

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                let viewer = Uuid::new_v4();
                log::info!("viewer {viewer} from {peer}");
                stream.set_nodelay(true).ok();
                channel.attach_stream(viewer, stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if stop_rx.try_recv().is_ok() {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            Err(e) => {
                log::warn!("accept: {e}");
                std::thread::sleep(std::time::Duration::from_millis(200));
            }
        }
    }

    log::info!("stopping channel");
    channel.stop();
    Ok(())
}
