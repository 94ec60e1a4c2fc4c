//! meson-dvb: run a transport stream file through a simulated demux.
//!
//! The device is probed on the recording HAL, feeds are started on demux 0,
//! the file is injected in chunks while the watchdog runs, and the device
//! statistics are printed as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{info, warn};
use meson_dvb::{Config, DemuxOutput, Device, FeedSpec, FilterPattern, SimHal};
use meson_dvb_types::{AfifoId, DmxId, DmxSource, PesType, ASYNCFIFO_COUNT, TS_PACKET_SIZE};
use serde::Serialize;
use tokio::sync::mpsc;

mod logging;

const DEFAULT_CONFIG: &str = "meson-dvb.toml";

/// meson-dvb - hardware TS demux simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Transport stream file to inject
    input: PathBuf,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Source of demux 0 (front0..3, dvr0..3, front0_offset..)
    #[arg(short, long, default_value = "dvr0")]
    source: DmxSource,

    /// PID to open a section feed on (repeatable, hex with 0x)
    #[arg(long = "section-pid", value_parser = parse_pid)]
    section_pids: Vec<u16>,

    /// PES feed as PID[:video|audio|teletext|subtitle] (repeatable)
    #[arg(long = "pes-pid", value_parser = parse_pes)]
    pes_pids: Vec<(u16, PesType)>,

    /// Bytes injected per write
    #[arg(short, long, default_value_t = 64 * TS_PACKET_SIZE)]
    chunk: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long)]
    log_retention_days: Option<u64>,
}

fn parse_pid(s: &str) -> Result<u16, String> {
    let pid = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("invalid PID {:?}: {}", s, e))?;
    if pid > 0x1FFF {
        return Err(format!("PID {:#x} out of range", pid));
    }
    Ok(pid)
}

fn parse_pes(s: &str) -> Result<(u16, PesType), String> {
    let (pid, kind) = s.split_once(':').unwrap_or((s, "other"));
    let pes_type = match kind {
        "video" => PesType::Video,
        "audio" => PesType::Audio,
        "teletext" => PesType::Teletext,
        "subtitle" => PesType::Subtitle,
        "other" => PesType::Other,
        other => return Err(format!("unknown PES type {:?}", other)),
    };
    Ok((parse_pid(pid)?, pes_type))
}

#[derive(Debug, Default, Serialize)]
struct OutputCounts {
    sections: u64,
    pes: u64,
    pcr: u64,
    ts: u64,
    bytes: u64,
}

impl OutputCounts {
    fn count(&mut self, output: &DemuxOutput) {
        match output {
            DemuxOutput::Section { data, .. } => {
                self.sections += 1;
                self.bytes += data.len() as u64;
            }
            DemuxOutput::Pes { data, .. } => {
                self.pes += 1;
                self.bytes += data.len() as u64;
            }
            DemuxOutput::Pcr { .. } => self.pcr += 1,
            DemuxOutput::Ts { data, .. } => {
                self.ts += 1;
                self.bytes += data.len() as u64;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Explicit path > auto-detect > defaults
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG);
        default_path.exists().then_some(default_path)
    });
    let config = match &config_path {
        Some(path) => {
            let config = Config::load(path)?;
            eprintln!("Loaded config from: {}", path.display());
            config
        }
        None => Config::default(),
    };

    // Command line takes precedence over the file
    let log_dir = args.log_dir.clone().unwrap_or_else(|| config.logging.dir.clone());
    let retention_days = args
        .log_retention_days
        .unwrap_or(config.logging.retention_days);
    logging::init_logging(
        &log_dir,
        retention_days,
        args.verbose,
        config.logging.level.as_deref(),
    )?;

    info!("meson-dvb v{}", env!("CARGO_PKG_VERSION"));

    let data = std::fs::read(&args.input)?;
    info!("{}: {} bytes", args.input.display(), data.len());

    let device = Device::probe(Arc::new(SimHal::new()), config).await?;
    let dmx = DmxId::new(0)?;
    device.set_source(dmx, args.source).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    for &pid in &args.section_pids {
        let feed = device.start_feed(dmx, FeedSpec::section(pid), tx.clone()).await?;
        device
            .attach_filter(dmx, feed, FilterPattern::default(), pid as u64)
            .await?;
    }
    for &(pid, pes_type) in &args.pes_pids {
        device
            .start_feed(dmx, FeedSpec::pes(pid, pes_type), tx.clone())
            .await?;
    }
    drop(tx);
    if args.section_pids.is_empty() && args.pes_pids.is_empty() {
        warn!("no feeds requested, only statistics will be collected");
    }

    let watchdog = device.start_watchdog();

    let source = device.lock().await.router().resolve(args.source)?;
    for chunk in data.chunks(args.chunk.max(1)) {
        device.inject(source, chunk).await?;
        tokio::task::yield_now().await;
    }

    for i in 0..ASYNCFIFO_COUNT {
        device.afifo(AfifoId::new(i)?)?.flush();
    }
    device.settle().await;
    watchdog.abort();

    let mut counts = OutputCounts::default();
    while let Ok(output) = rx.try_recv() {
        counts.count(&output);
    }
    info!(
        "delivered {} sections, {} PES packets",
        counts.sections, counts.pes
    );

    let report = serde_json::json!({
        "outputs": counts,
        "video_pts": device.video_pts(dmx)?,
        "audio_pts": device.audio_pts(dmx)?,
        "device": device.stats(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
