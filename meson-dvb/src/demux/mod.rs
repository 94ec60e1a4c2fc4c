//! Demux engine instances.
//!
//! Each [`DemuxInstance`] owns its channel, filter and feed tables, its
//! buffer pools and the software model of the engine datapath. Completed
//! units are raised as "interrupts" onto two queues, drained by one
//! serialized worker each (demux output and DVR passthrough).
//!
//! Table mutation happens under the device lock; the instance state itself
//! sits behind a short-lived `std::sync::Mutex` shared with the workers.
//! Stop and reset paths quiesce first: mask the interrupt gate so new events
//! latch, then push a barrier through both queues and wait for it.

pub mod engine;
pub mod stats;
pub mod tasklet;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use log::{debug, info, warn};
use meson_dvb_types::{
    ChannelType, DemuxError, DmxId, DmxSource, PesType, Resource, SectionOrigin, TsSource,
    CHANNEL_COUNT,
};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::buffer::{BufferSlot, DemuxPools};
use crate::config::DemuxConfig;
use crate::frontend::{ErrorCheck, PtsTracker};
use crate::hal::{DemuxHal, IrqLine};
use crate::table::{
    Allocation, ChannelId, ChannelTable, FeedId, FilterId, FilterPath, FilterPattern,
    FilterTable, Release, SlotTable,
};

use engine::EngineState;
pub use stats::{DemuxStats, OriginCounts, StatsSnapshot};

/// Feed slots per engine.
pub const FEED_COUNT: usize = CHANNEL_COUNT * 2;

/// Where a feed's output is delivered.
pub type FeedSink = mpsc::UnboundedSender<DemuxOutput>;

/// A unit delivered to a feed consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxOutput {
    Section {
        pid: u16,
        filter: FilterId,
        /// Handle given at attach time.
        handle: u64,
        origin: SectionOrigin,
        data: Bytes,
    },
    Pes {
        pid: u16,
        pes_type: PesType,
        pts: Option<u64>,
        data: Bytes,
    },
    Pcr {
        pid: u16,
        pcr: u64,
    },
    /// Raw packet of a recorded PID.
    Ts {
        pid: u16,
        data: Bytes,
    },
}

/// What a feed consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    Section,
    Pes(PesType),
    Pcr,
    /// DVR mirror of the raw packets.
    Record,
}

/// Programming of a channel that only DVR mirrors use.
const RECORD_ONLY: (ChannelType, PesType) = (ChannelType::Pes, PesType::Other);

impl FeedKind {
    /// Channel programming this feed needs. `None` for the DVR mirror,
    /// which rides on whatever the channel already is.
    fn channel_type(self) -> Option<(ChannelType, PesType)> {
        match self {
            FeedKind::Section => Some((ChannelType::Section, PesType::Other)),
            FeedKind::Pes(pes_type) => Some((ChannelType::Pes, pes_type)),
            FeedKind::Pcr => Some((ChannelType::Pcr, PesType::Pcr)),
            FeedKind::Record => None,
        }
    }
}

/// Combine a channel's programming with one more feed on its PID. PES
/// programming carries PCR too; any other mismatch is a conflict.
fn merge_channel_type(
    current: Option<(ChannelType, PesType)>,
    kind: FeedKind,
) -> Result<Option<(ChannelType, PesType)>, DemuxError> {
    let Some(wanted) = kind.channel_type() else {
        return Ok(current);
    };
    let Some(have) = current else {
        return Ok(Some(wanted));
    };
    match (have.0, wanted.0) {
        _ if have == wanted => Ok(Some(have)),
        (ChannelType::Pcr, ChannelType::Pes) => Ok(Some(wanted)),
        (ChannelType::Pes, ChannelType::Pcr) => Ok(Some(have)),
        _ => Err(DemuxError::InvalidState(format!(
            "{:?} feed conflicts with {:?}/{:?} channel",
            kind, have.0, have.1
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedSpec {
    pub pid: u16,
    pub kind: FeedKind,
}

impl FeedSpec {
    pub fn section(pid: u16) -> Self {
        Self {
            pid,
            kind: FeedKind::Section,
        }
    }

    pub fn pes(pid: u16, pes_type: PesType) -> Self {
        Self {
            pid,
            kind: FeedKind::Pes(pes_type),
        }
    }

    pub fn pcr(pid: u16) -> Self {
        Self {
            pid,
            kind: FeedKind::Pcr,
        }
    }

    pub fn record(pid: u16) -> Self {
        Self {
            pid,
            kind: FeedKind::Record,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Feed {
    pub spec: FeedSpec,
    pub channel: ChannelId,
    pub sink: FeedSink,
}

/// Watchdog view of one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchdogState {
    #[default]
    Normal,
    /// A monitored channel is past its timeout.
    Suspect,
    Resetting,
}

pub(crate) enum DrainEvent {
    Section {
        channel: ChannelId,
        slot: BufferSlot,
        origin: SectionOrigin,
    },
    Pes {
        channel: ChannelId,
        slot: BufferSlot,
    },
    Pcr {
        channel: ChannelId,
        pcr: u64,
    },
    Barrier(oneshot::Sender<()>),
}

pub(crate) enum DvrEvent {
    Packet { channel: ChannelId, data: Bytes },
    Barrier(oneshot::Sender<()>),
}

/// Software interrupt gate in front of the two drain queues.
pub(crate) struct IrqGate {
    dmx_tx: mpsc::UnboundedSender<DrainEvent>,
    dvr_tx: mpsc::UnboundedSender<DvrEvent>,
    masked: bool,
    latched: Vec<DrainEvent>,
    latched_dvr: Vec<DvrEvent>,
}

impl IrqGate {
    pub(crate) fn raise(&mut self, event: DrainEvent) {
        if self.masked {
            self.latched.push(event);
        } else if self.dmx_tx.send(event).is_err() {
            debug!("demux worker gone, event dropped");
        }
    }

    pub(crate) fn raise_dvr(&mut self, event: DvrEvent) {
        if self.masked {
            self.latched_dvr.push(event);
        } else if self.dvr_tx.send(event).is_err() {
            debug!("dvr worker gone, event dropped");
        }
    }

    pub(crate) fn is_masked(&self) -> bool {
        self.masked
    }
}

#[derive(Debug, Default)]
pub(crate) struct TimeoutState {
    /// Monitored channels past the timeout on the last scan.
    pub match_count: usize,
    /// Consecutive scans with `match_count > 0`.
    pub trigger: u32,
    pub state: WatchdogState,
}

#[derive(Debug)]
pub(crate) struct CrcWindow {
    pub count: u32,
    pub start: Instant,
}

impl CrcWindow {
    pub(crate) fn record(&mut self, now: Instant, window: std::time::Duration) {
        if now.saturating_duration_since(self.start) > window {
            self.start = now;
            self.count = 0;
        }
        self.count += 1;
    }
}

/// Channels currently carrying each tracked stream.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Tracked {
    pub audio: Option<ChannelId>,
    pub video: Option<ChannelId>,
    pub subtitle: Option<ChannelId>,
    pub pcr: Option<ChannelId>,
}

impl Tracked {
    fn set(&mut self, kind: FeedKind, channel: ChannelId) {
        match kind {
            FeedKind::Pes(PesType::Audio) => self.audio = Some(channel),
            FeedKind::Pes(PesType::Video) => self.video = Some(channel),
            FeedKind::Pes(PesType::Subtitle) | FeedKind::Pes(PesType::Teletext) => {
                self.subtitle = Some(channel)
            }
            FeedKind::Pcr | FeedKind::Pes(PesType::Pcr) => self.pcr = Some(channel),
            _ => {}
        }
    }

    fn forget(&mut self, channel: ChannelId) {
        for slot in [
            &mut self.audio,
            &mut self.video,
            &mut self.subtitle,
            &mut self.pcr,
        ] {
            if *slot == Some(channel) {
                *slot = None;
            }
        }
    }
}

/// Mutable state of one engine.
pub(crate) struct DemuxCore {
    pub channels: ChannelTable,
    pub filters: FilterTable,
    pub feeds: SlotTable<Feed>,
    pub pools: DemuxPools,
    pub engine: EngineState,
    pub irq: IrqGate,
    pub source: Option<TsSource>,
    pub dmx_source: DmxSource,
    pub dump_ts_select: bool,
    pub timeout: TimeoutState,
    pub crc: CrcWindow,
    pub error_check: ErrorCheck,
    pub pts: PtsTracker,
    pub tracked: Tracked,
    /// Most recent timeout or CRC fault seen on the data path.
    pub last_fault: Option<DemuxError>,
    pub available: bool,
    pub config: DemuxConfig,
}

impl DemuxCore {
    fn sinks_for(&self, channel: ChannelId, pred: impl Fn(FeedKind) -> bool) -> Vec<FeedSink> {
        self.feeds
            .iter()
            .filter(|(_, f)| f.channel == channel && pred(f.spec.kind))
            .map(|(_, f)| f.sink.clone())
            .collect()
    }

    pub(crate) fn has_feed(&self, channel: ChannelId, pred: impl Fn(FeedKind) -> bool) -> bool {
        self.feeds
            .iter()
            .any(|(_, f)| f.channel == channel && pred(f.spec.kind))
    }

    /// Programming the feeds bound to `channel` call for.
    fn feeds_channel_type(&self, channel: ChannelId) -> Option<(ChannelType, PesType)> {
        self.feeds
            .iter()
            .filter(|(_, f)| f.channel == channel)
            .try_fold(None, |acc, (_, f)| merge_channel_type(acc, f.spec.kind))
            .ok()
            .flatten()
    }

    /// Re-arm a live channel with new programming and restart its assembly.
    fn reprogram_channel(
        &mut self,
        hal: &dyn DemuxHal,
        dmx: DmxId,
        id: ChannelId,
        (kind, pes_type): (ChannelType, PesType),
    ) -> Result<(), DemuxError> {
        let channel = self.channels.get_mut(id).ok_or(DemuxError::InvalidChannel)?;
        hal.dmx_start_feed(dmx, id.index(), channel.pid, kind)?;
        debug!(
            "{}: channel {} pid 0x{:04X} reprogrammed {:?}/{:?} -> {:?}/{:?}",
            dmx,
            id.index(),
            channel.pid,
            channel.kind,
            channel.pes_type,
            kind,
            pes_type
        );
        channel.kind = kind;
        channel.pes_type = pes_type;
        self.engine.channel_removed(id);
        self.engine.channel_added(id, kind);
        Ok(())
    }

    /// Drop latched events, returning their buffers.
    fn discard_latched(&mut self, stats: &DemuxStats) {
        for event in std::mem::take(&mut self.irq.latched) {
            match event {
                DrainEvent::Section { slot, .. } | DrainEvent::Pes { slot, .. } => {
                    stats.record_stale();
                    self.pools.release(slot);
                }
                DrainEvent::Barrier(done) => {
                    let _ = done.send(());
                }
                DrainEvent::Pcr { .. } => {}
            }
        }
        for event in std::mem::take(&mut self.irq.latched_dvr) {
            if let DvrEvent::Barrier(done) = event {
                let _ = done.send(());
            }
        }
    }
}

/// Outcome of stopping a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StopOutcome {
    pub sw_filters_detached: usize,
    pub last_feed: bool,
}

/// One hardware demux engine.
pub struct DemuxInstance {
    id: DmxId,
    core: Mutex<DemuxCore>,
    stats: DemuxStats,
}

impl DemuxInstance {
    /// Create the instance and spawn its drain workers. Must be called
    /// inside a tokio runtime.
    pub(crate) fn new(
        id: DmxId,
        config: &DemuxConfig,
        dmx_source: DmxSource,
        source: Option<TsSource>,
        pool_base: u64,
        now: Instant,
    ) -> Arc<Self> {
        let (dmx_tx, dmx_rx) = mpsc::unbounded_channel();
        let (dvr_tx, dvr_rx) = mpsc::unbounded_channel();

        let core = DemuxCore {
            channels: ChannelTable::new(config.ignore.policy()),
            filters: FilterTable::new(config.sw_filter_count),
            feeds: SlotTable::with_capacity(FEED_COUNT),
            pools: DemuxPools::new(pool_base, config),
            engine: EngineState::default(),
            irq: IrqGate {
                dmx_tx,
                dvr_tx,
                masked: false,
                latched: Vec::new(),
                latched_dvr: Vec::new(),
            },
            source,
            dmx_source,
            dump_ts_select: false,
            timeout: TimeoutState::default(),
            crc: CrcWindow {
                count: 0,
                start: now,
            },
            error_check: ErrorCheck::new(now),
            pts: PtsTracker::default(),
            tracked: Tracked::default(),
            last_fault: None,
            available: true,
            config: config.clone(),
        };

        let instance = Arc::new(Self {
            id,
            core: Mutex::new(core),
            stats: DemuxStats::default(),
        });
        tokio::spawn(tasklet::run_dmx_worker(Arc::downgrade(&instance), dmx_rx));
        tokio::spawn(tasklet::run_dvr_worker(Arc::downgrade(&instance), dvr_rx));
        instance
    }

    pub fn id(&self) -> DmxId {
        self.id
    }

    pub fn stats(&self) -> &DemuxStats {
        &self.stats
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, DemuxCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_available(&self) -> bool {
        self.lock().available
    }

    pub(crate) fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    pub fn source(&self) -> Option<TsSource> {
        self.lock().source
    }

    pub fn dmx_source(&self) -> DmxSource {
        self.lock().dmx_source
    }

    pub fn dump_ts_select(&self) -> bool {
        self.lock().dump_ts_select
    }

    pub fn watchdog_state(&self) -> WatchdogState {
        self.lock().timeout.state
    }

    pub fn last_fault(&self) -> Option<DemuxError> {
        self.lock().last_fault.clone()
    }

    pub fn pts(&self) -> PtsTracker {
        self.lock().pts
    }

    /// PIDs with an allocated channel, in slot order.
    pub fn channel_pids(&self) -> Vec<u16> {
        self.lock().channels.iter().map(|(_, c)| c.pid).collect()
    }

    pub fn feed_count(&self) -> usize {
        self.lock().feeds.len()
    }

    /// Busy slots across all pools.
    pub fn busy_buffers(&self) -> usize {
        self.lock().pools.busy_count()
    }

    pub(crate) fn mask(&self) {
        self.lock().irq.masked = true;
    }

    /// Re-open the gate. Latched events are forwarded in order, or dropped
    /// (and their buffers returned) when they belong to torn-down state.
    pub(crate) fn unmask(&self, forward: bool) {
        let mut guard = self.lock();
        let core = &mut *guard;
        core.irq.masked = false;
        if !forward {
            core.discard_latched(&self.stats);
            return;
        }
        for event in std::mem::take(&mut core.irq.latched) {
            core.irq.raise(event);
        }
        for event in std::mem::take(&mut core.irq.latched_dvr) {
            core.irq.raise_dvr(event);
        }
    }

    /// Wait until both workers have processed everything queued so far.
    pub(crate) async fn flush(&self) {
        let (dmx_done, dmx_wait) = oneshot::channel();
        let (dvr_done, dvr_wait) = oneshot::channel();
        {
            let core = self.lock();
            let dmx_sent = core.irq.dmx_tx.send(DrainEvent::Barrier(dmx_done)).is_ok();
            let dvr_sent = core.irq.dvr_tx.send(DvrEvent::Barrier(dvr_done)).is_ok();
            if !dmx_sent || !dvr_sent {
                return;
            }
        }
        let _ = dmx_wait.await;
        let _ = dvr_wait.await;
    }

    /// Mask and flush.
    pub(crate) async fn quiesce(&self) {
        self.mask();
        self.flush().await;
    }

    pub(crate) fn start_feed(
        &self,
        hal: &dyn DemuxHal,
        spec: FeedSpec,
        sink: FeedSink,
        now: Instant,
    ) -> Result<FeedId, DemuxError> {
        let mut guard = self.lock();
        let core = &mut *guard;
        if !core.available {
            return Err(DemuxError::Unavailable(self.id.index() as u8));
        }
        if core.feeds.is_full() {
            return Err(DemuxError::ResourceExhausted(Resource::Feed));
        }
        let current = core
            .channels
            .lookup_pid(spec.pid)
            .and_then(|id| core.feeds_channel_type(id));
        let wanted = merge_channel_type(current, spec.kind)?;

        let first = core.feeds.is_empty();
        if first {
            let source = core
                .source
                .ok_or_else(|| DemuxError::InvalidState(format!("{} has no source", self.id)))?;
            hal.dmx_set_source(self.id, source)?;
            hal.set_irq_enabled(IrqLine::Demux(self.id), true)?;
            hal.set_irq_enabled(IrqLine::Dvr(self.id), true)?;
        }
        let disable_irqs = |hal: &dyn DemuxHal| {
            if first {
                let _ = hal.set_irq_enabled(IrqLine::Demux(self.id), false);
                let _ = hal.set_irq_enabled(IrqLine::Dvr(self.id), false);
            }
        };

        let (kind, pes_type) = wanted.unwrap_or(RECORD_ONLY);
        let allocation = match core.channels.allocate(kind, pes_type, spec.pid, now) {
            Ok(a) => a,
            Err(e) => {
                disable_irqs(hal);
                return Err(e);
            }
        };
        let channel_id = allocation.id();

        match allocation {
            Allocation::New(_) => {
                if let Err(e) = hal.dmx_start_feed(self.id, channel_id.index(), spec.pid, kind) {
                    warn!("{}: dmx_start_feed pid 0x{:04X} failed: {}", self.id, spec.pid, e);
                    let _ = core.channels.release(channel_id, 0, now);
                    disable_irqs(hal);
                    return Err(e.into());
                }
                core.engine.channel_added(channel_id, kind);
            }
            // A typed feed joining a record-only or PCR-only channel.
            Allocation::Shared(_) if wanted != current => {
                if let Err(e) =
                    core.reprogram_channel(hal, self.id, channel_id, (kind, pes_type))
                {
                    warn!("{}: reprogramming pid 0x{:04X} failed: {}", self.id, spec.pid, e);
                    let _ = core.channels.release(channel_id, 0, now);
                    return Err(e);
                }
            }
            Allocation::Shared(_) => {}
        }

        let key = core
            .feeds
            .insert(Feed {
                spec,
                channel: channel_id,
                sink,
            })
            .ok_or(DemuxError::ResourceExhausted(Resource::Feed))?;
        let feed_id = FeedId(key);

        if let Some(channel) = core.channels.get_mut(channel_id) {
            if spec.kind == FeedKind::Record {
                channel.dvr_feed.get_or_insert(feed_id);
            } else {
                channel.feed.get_or_insert(feed_id);
            }
        }
        core.tracked.set(spec.kind, channel_id);

        info!(
            "{}: feed {} started on pid 0x{:04X} ({:?}), channel {}",
            self.id,
            feed_id.index(),
            spec.pid,
            spec.kind,
            channel_id.index()
        );
        Ok(feed_id)
    }

    /// Unbind a feed. The caller has quiesced the instance.
    pub(crate) fn stop_feed(
        &self,
        hal: &dyn DemuxHal,
        feed_id: FeedId,
        now: Instant,
    ) -> Result<StopOutcome, DemuxError> {
        let mut guard = self.lock();
        let core = &mut *guard;
        let feed = core.feeds.get(feed_id.0).ok_or(DemuxError::InvalidFeed)?;
        let channel_id = feed.channel;
        let channel = core
            .channels
            .get(channel_id)
            .ok_or(DemuxError::InvalidChannel)?;
        let pid = channel.pid;

        if channel.refs() == 1 {
            // Hardware first: a failure leaves every table untouched.
            hal.dmx_stop_feed(self.id, channel_id.index(), pid)?;
        }

        let detached = core.filters.detach_feed(&mut core.channels, feed_id);
        let sw_filters_detached = detached
            .iter()
            .filter(|f| f.path == FilterPath::Software)
            .count();
        let _ = core.feeds.remove(feed_id.0);

        let ch_disable = core.config.timeout.ch_disable;
        match core.channels.release(channel_id, ch_disable, now)? {
            Release::Freed(_) => {
                core.engine.channel_removed(channel_id);
                core.tracked.forget(channel_id);
            }
            Release::Shared { .. } => {
                let (primary, dvr) = {
                    let mut primary = None;
                    let mut dvr = None;
                    for (key, f) in core.feeds.iter().filter(|(_, f)| f.channel == channel_id) {
                        if f.spec.kind == FeedKind::Record {
                            dvr.get_or_insert(FeedId(key));
                        } else {
                            primary.get_or_insert(FeedId(key));
                        }
                    }
                    (primary, dvr)
                };
                if let Some(channel) = core.channels.get_mut(channel_id) {
                    channel.feed = primary;
                    channel.dvr_feed = dvr;
                }

                let wanted = core.feeds_channel_type(channel_id).unwrap_or(RECORD_ONLY);
                let programmed = core.channels.get(channel_id).map(|c| (c.kind, c.pes_type));
                if programmed != Some(wanted) {
                    if let Err(e) = core.reprogram_channel(hal, self.id, channel_id, wanted) {
                        warn!("{}: reprogramming pid 0x{:04X} failed: {}", self.id, pid, e);
                    }
                }
                core.tracked.forget(channel_id);
                let remaining: Vec<FeedKind> = core
                    .feeds
                    .iter()
                    .filter(|(_, f)| f.channel == channel_id)
                    .map(|(_, f)| f.spec.kind)
                    .collect();
                for kind in remaining {
                    core.tracked.set(kind, channel_id);
                }
            }
        }

        let last_feed = core.feeds.is_empty();
        if last_feed {
            if let Err(e) = hal.set_irq_enabled(IrqLine::Demux(self.id), false) {
                warn!("{}: failed to disable interrupts: {}", self.id, e);
            }
            let _ = hal.set_irq_enabled(IrqLine::Dvr(self.id), false);
        }

        info!("{}: feed {} on pid 0x{:04X} stopped", self.id, feed_id.index(), pid);
        Ok(StopOutcome {
            sw_filters_detached,
            last_feed,
        })
    }

    /// Attach a section filter to a section feed.
    pub(crate) fn attach_filter(
        &self,
        feed_id: FeedId,
        pattern: FilterPattern,
        handle: u64,
        path: FilterPath,
    ) -> Result<FilterId, DemuxError> {
        let mut guard = self.lock();
        let core = &mut *guard;
        let feed = core.feeds.get(feed_id.0).ok_or(DemuxError::InvalidFeed)?;
        if feed.spec.kind != FeedKind::Section {
            return Err(DemuxError::InvalidState(format!(
                "feed {} is not a section feed",
                feed_id.index()
            )));
        }
        let channel = feed.channel;
        match path {
            FilterPath::Hardware => {
                core.filters
                    .attach(&mut core.channels, channel, pattern, feed_id, handle)
            }
            FilterPath::Software => core.filters.attach_software(
                &mut core.channels,
                channel,
                pattern,
                feed_id,
                handle,
            ),
        }
    }

    pub(crate) fn detach_filter(&self, filter: FilterId) -> Result<FilterPath, DemuxError> {
        let mut guard = self.lock();
        let core = &mut *guard;
        let detached = core.filters.detach(&mut core.channels, filter)?;
        Ok(detached.path)
    }

    /// Whether a new filter would have to use the software path.
    pub(crate) fn needs_software_filter(&self) -> bool {
        let core = self.lock();
        !core.config.hw_filters || (core.filters.hw_is_full() && core.config.sw_fallback)
    }

    /// Switch the input. The caller has quiesced the instance.
    pub(crate) fn set_source(
        &self,
        hal: &dyn DemuxHal,
        dmx_source: DmxSource,
        source: TsSource,
    ) -> Result<(), DemuxError> {
        let mut guard = self.lock();
        let core = &mut *guard;
        hal.dmx_set_source(self.id, source)?;
        core.source = Some(source);
        core.dmx_source = dmx_source;
        core.engine.reset();
        info!("{}: source set to {:?} ({})", self.id, dmx_source, source);
        Ok(())
    }

    /// Whether `source` is already selected.
    pub(crate) fn has_source(&self, dmx_source: DmxSource, source: TsSource) -> bool {
        let core = self.lock();
        core.dmx_source == dmx_source && core.source == Some(source)
    }

    pub(crate) fn set_dump_ts_select(&self, hal: &dyn DemuxHal, dump: bool) -> Result<(), DemuxError> {
        let mut core = self.lock();
        if core.dump_ts_select == dump {
            return Ok(());
        }
        hal.dmx_set_dump_ts_select(self.id, dump)?;
        core.dump_ts_select = dump;
        Ok(())
    }

    /// PIDs whose channels carry software filters.
    pub(crate) fn software_pids(&self) -> HashMap<u16, ChannelId> {
        self.lock()
            .channels
            .iter()
            .filter(|(_, c)| c.sw_filter_count > 0)
            .map(|(id, c)| (c.pid, id))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::hal::{HalCall, SimHal};
    use crate::packet::tests::packet;
    use crate::section::tests::make_section;
    use meson_dvb_types::DTO_CHDIS_VAS;

    pub(crate) fn instance(config: &DemuxConfig) -> Arc<DemuxInstance> {
        DemuxInstance::new(
            DmxId::new(0).unwrap(),
            config,
            DmxSource::Front(0),
            Some(TsSource::Ts0),
            0x1000_0000,
            Instant::now(),
        )
    }

    /// Packets carrying each section in its own payload unit.
    pub(crate) fn section_packets(pid: u16, sections: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        for (cc, s) in sections.iter().enumerate() {
            let mut payload = vec![0u8];
            payload.extend(s);
            out.extend(packet(pid, true, cc as u8, &payload));
        }
        out
    }

    #[tokio::test]
    async fn test_first_and_last_feed_toggle_hardware() {
        let hal = SimHal::new();
        let inst = instance(&DemuxConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let now = Instant::now();

        let a = inst.start_feed(&hal, FeedSpec::section(0x12), tx.clone(), now).unwrap();
        let b = inst.start_feed(&hal, FeedSpec::section(0x12), tx, now).unwrap();
        let calls = hal.calls();
        assert_eq!(calls[0], HalCall::DmxSetSource(inst.id(), TsSource::Ts0));
        assert_eq!(hal.started_feeds(inst.id()), vec![(0, 0x12)]);
        assert_eq!(inst.channel_pids(), vec![0x12]);

        inst.stop_feed(&hal, a, now).unwrap();
        assert!(!hal.calls().iter().any(|c| matches!(c, HalCall::DmxStopFeed { .. })));
        let outcome = inst.stop_feed(&hal, b, now).unwrap();
        assert!(outcome.last_feed);
        assert!(hal
            .calls()
            .contains(&HalCall::SetIrqEnabled(IrqLine::Demux(inst.id()), false)));
        assert!(inst.channel_pids().is_empty());
        assert_eq!(inst.stop_feed(&hal, b, now).unwrap_err(), DemuxError::InvalidFeed);
    }

    #[tokio::test]
    async fn test_start_feed_rollback_on_hal_failure() {
        let hal = SimHal::new();
        let inst = instance(&DemuxConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        hal.fail_next("dmx_start_feed", 1);

        let err = inst
            .start_feed(&hal, FeedSpec::pes(0x100, PesType::Video), tx.clone(), Instant::now())
            .unwrap_err();
        assert!(matches!(err, DemuxError::Hardware(_)));
        assert!(inst.channel_pids().is_empty());
        assert_eq!(inst.feed_count(), 0);

        // Same slot is reusable afterwards.
        inst.start_feed(&hal, FeedSpec::pes(0x100, PesType::Video), tx, Instant::now())
            .unwrap();
        assert_eq!(hal.started_feeds(inst.id()), vec![(0, 0x100)]);
    }

    #[tokio::test]
    async fn test_stop_feed_hal_failure_keeps_state() {
        let hal = SimHal::new();
        let inst = instance(&DemuxConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let feed = inst.start_feed(&hal, FeedSpec::section(0x20), tx, now).unwrap();
        inst.attach_filter(feed, FilterPattern::table_id(0x42), 1, FilterPath::Hardware)
            .unwrap();

        hal.fail_next("dmx_stop_feed", 1);
        assert!(inst.stop_feed(&hal, feed, now).is_err());
        assert_eq!(inst.channel_pids(), vec![0x20]);
        assert_eq!(inst.lock().filters.hw_count(), 1);

        inst.stop_feed(&hal, feed, now).unwrap();
        assert_eq!(inst.lock().filters.hw_count(), 0);
    }

    #[tokio::test]
    async fn test_filter_on_pes_feed_rejected() {
        let hal = SimHal::new();
        let inst = instance(&DemuxConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let feed = inst
            .start_feed(&hal, FeedSpec::pes(0x100, PesType::Audio), tx, Instant::now())
            .unwrap();
        assert!(matches!(
            inst.attach_filter(feed, FilterPattern::default(), 0, FilterPath::Hardware),
            Err(DemuxError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_masked_events_latch_until_unmask() {
        let hal = SimHal::new();
        let inst = instance(&DemuxConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let feed = inst.start_feed(&hal, FeedSpec::section(0x12), tx, Instant::now()).unwrap();
        inst.attach_filter(feed, FilterPattern::table_id(0x02), 9, FilterPath::Hardware)
            .unwrap();

        inst.quiesce().await;
        let ts = section_packets(0x12, &[make_section(0x02, 1, &[1])]);
        inst.process(&ts, Instant::now(), engine::Capture::None);
        inst.flush().await;
        assert!(rx.try_recv().is_err());

        inst.unmask(true);
        inst.flush().await;
        assert!(matches!(rx.try_recv(), Ok(DemuxOutput::Section { handle: 9, .. })));
    }

    #[tokio::test]
    async fn test_stale_slot_after_reclaim_is_not_read() {
        let hal = SimHal::new();
        let inst = instance(&DemuxConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let feed = inst.start_feed(&hal, FeedSpec::section(0x12), tx, Instant::now()).unwrap();
        inst.attach_filter(feed, FilterPattern::table_id(0x02), 1, FilterPath::Hardware)
            .unwrap();

        inst.mask();
        let ts = section_packets(
            0x12,
            &[make_section(0x02, 1, &[1]), make_section(0x02, 2, &[2])],
        );
        inst.process(&ts, Instant::now(), engine::Capture::None);
        assert_eq!(inst.busy_buffers(), 2);

        // Reclaim while the units are still pending, then let them through.
        assert_eq!(inst.lock().pools.reclaim_all(), 2);
        inst.unmask(true);
        inst.flush().await;

        assert!(rx.try_recv().is_err());
        assert_eq!(inst.stats().stale_dropped(), 2);
        assert_eq!(inst.busy_buffers(), 0);
    }

    fn programming(inst: &DemuxInstance, pid: u16) -> Option<(ChannelType, PesType)> {
        let core = inst.lock();
        let id = core.channels.lookup_pid(pid)?;
        core.channels.get(id).map(|c| (c.kind, c.pes_type))
    }

    #[tokio::test]
    async fn test_record_then_section_on_same_pid() {
        let hal = SimHal::new();
        let inst = instance(&DemuxConfig::default());
        let (dvr_tx, mut dvr_rx) = mpsc::unbounded_channel();
        let (sec_tx, mut sec_rx) = mpsc::unbounded_channel();
        let now = Instant::now();

        let record = inst.start_feed(&hal, FeedSpec::record(0x12), dvr_tx, now).unwrap();
        let section = inst.start_feed(&hal, FeedSpec::section(0x12), sec_tx, now).unwrap();
        inst.attach_filter(section, FilterPattern::table_id(0x02), 3, FilterPath::Hardware)
            .unwrap();
        assert_eq!(programming(&inst, 0x12), Some((ChannelType::Section, PesType::Other)));
        assert_eq!(hal.started_feeds(inst.id()), vec![(0, 0x12), (0, 0x12)]);

        let ts = section_packets(0x12, &[make_section(0x02, 1, &[7])]);
        inst.process(&ts, now, engine::Capture::None);
        inst.flush().await;
        assert!(matches!(sec_rx.try_recv(), Ok(DemuxOutput::Section { handle: 3, .. })));
        assert!(matches!(dvr_rx.try_recv(), Ok(DemuxOutput::Ts { pid: 0x12, .. })));

        // The recording keeps the channel alive after the section feed goes.
        inst.stop_feed(&hal, section, now).unwrap();
        assert_eq!(inst.channel_pids(), vec![0x12]);
        assert_eq!(programming(&inst, 0x12), Some(RECORD_ONLY));
        assert!(!hal.calls().iter().any(|c| matches!(c, HalCall::DmxStopFeed { .. })));

        inst.stop_feed(&hal, record, now).unwrap();
        assert!(inst.channel_pids().is_empty());
        assert!(hal.calls().contains(&HalCall::DmxStopFeed {
            dmx: inst.id(),
            channel: 0,
            pid: 0x12
        }));
    }

    #[tokio::test]
    async fn test_section_then_record_on_same_pid() {
        let hal = SimHal::new();
        let inst = instance(&DemuxConfig::default());
        let (dvr_tx, mut dvr_rx) = mpsc::unbounded_channel();
        let (sec_tx, mut sec_rx) = mpsc::unbounded_channel();
        let now = Instant::now();

        let section = inst.start_feed(&hal, FeedSpec::section(0x12), sec_tx, now).unwrap();
        inst.attach_filter(section, FilterPattern::table_id(0x02), 3, FilterPath::Hardware)
            .unwrap();
        let record = inst.start_feed(&hal, FeedSpec::record(0x12), dvr_tx, now).unwrap();
        assert_eq!(programming(&inst, 0x12), Some((ChannelType::Section, PesType::Other)));
        assert_eq!(hal.started_feeds(inst.id()), vec![(0, 0x12)]);

        inst.stop_feed(&hal, record, now).unwrap();
        let ts = section_packets(0x12, &[make_section(0x02, 1, &[7])]);
        inst.process(&ts, now, engine::Capture::None);
        inst.flush().await;
        assert!(matches!(sec_rx.try_recv(), Ok(DemuxOutput::Section { handle: 3, .. })));
        assert!(dvr_rx.try_recv().is_err());
        assert_eq!(inst.channel_pids(), vec![0x12]);
    }

    #[tokio::test]
    async fn test_record_then_video_is_watched_and_tracked() {
        let hal = SimHal::new();
        let inst = instance(&DemuxConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let now = Instant::now();

        let record = inst.start_feed(&hal, FeedSpec::record(0x100), tx.clone(), now).unwrap();
        {
            let core = inst.lock();
            let id = core.channels.lookup_pid(0x100).unwrap();
            assert!(!core.channels.get(id).unwrap().is_watched(DTO_CHDIS_VAS, now));
        }
        let video = inst
            .start_feed(&hal, FeedSpec::pes(0x100, PesType::Video), tx, now)
            .unwrap();
        {
            let core = inst.lock();
            let id = core.channels.lookup_pid(0x100).unwrap();
            let channel = core.channels.get(id).unwrap();
            assert_eq!(channel.pes_type, PesType::Video);
            assert_eq!(channel.refs(), 2);
            assert!(channel.is_watched(DTO_CHDIS_VAS, now));
        }

        let pes = [0, 0, 1, 0xE0, 0, 10, 0x80, 0x80, 5, 0x21, 0x00, 0x05, 0xBF, 0x21, 0xAA, 0xBB];
        inst.process(&packet(0x100, true, 0, &pes), now, engine::Capture::None);
        inst.flush().await;
        assert_eq!(inst.pts().first_video, Some(90000));
        let mut pes_units = 0;
        while let Ok(output) = rx.try_recv() {
            if let DemuxOutput::Pes { pes_type, .. } = output {
                assert_eq!(pes_type, PesType::Video);
                pes_units += 1;
            }
        }
        assert_eq!(pes_units, 1);

        // Back to an unwatched recording once the video feed stops.
        inst.stop_feed(&hal, video, now).unwrap();
        assert_eq!(programming(&inst, 0x100), Some(RECORD_ONLY));
        inst.stop_feed(&hal, record, now).unwrap();
        assert!(inst.channel_pids().is_empty());
    }

    #[tokio::test]
    async fn test_pcr_channel_upgraded_by_pes_feed() {
        let hal = SimHal::new();
        let inst = instance(&DemuxConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let now = Instant::now();

        let pcr = inst.start_feed(&hal, FeedSpec::pcr(0x100), tx.clone(), now).unwrap();
        let video = inst
            .start_feed(&hal, FeedSpec::pes(0x100, PesType::Video), tx.clone(), now)
            .unwrap();
        assert_eq!(programming(&inst, 0x100), Some((ChannelType::Pes, PesType::Video)));
        // PCR joining a PES channel leaves it as it is.
        inst.start_feed(&hal, FeedSpec::pcr(0x100), tx, now).unwrap();
        assert_eq!(hal.started_feeds(inst.id()).len(), 2);

        inst.stop_feed(&hal, video, now).unwrap();
        assert_eq!(programming(&inst, 0x100), Some((ChannelType::Pcr, PesType::Pcr)));
        inst.stop_feed(&hal, pcr, now).unwrap();
        assert_eq!(inst.channel_pids(), vec![0x100]);
    }

    #[tokio::test]
    async fn test_conflicting_feed_types_rejected() {
        let hal = SimHal::new();
        let inst = instance(&DemuxConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let now = Instant::now();

        inst.start_feed(&hal, FeedSpec::record(0x30), tx.clone(), now).unwrap();
        inst.start_feed(&hal, FeedSpec::section(0x30), tx.clone(), now).unwrap();
        let err = inst
            .start_feed(&hal, FeedSpec::pes(0x30, PesType::Audio), tx.clone(), now)
            .unwrap_err();
        assert!(matches!(err, DemuxError::InvalidState(_)));
        let err = inst
            .start_feed(&hal, FeedSpec::pcr(0x30), tx.clone(), now)
            .unwrap_err();
        assert!(matches!(err, DemuxError::InvalidState(_)));
        assert_eq!(inst.feed_count(), 2);

        inst.start_feed(&hal, FeedSpec::pes(0x31, PesType::Audio), tx.clone(), now)
            .unwrap();
        assert!(inst
            .start_feed(&hal, FeedSpec::pes(0x31, PesType::Video), tx, now)
            .is_err());

        let core = inst.lock();
        let id = core.channels.lookup_pid(0x30).unwrap();
        assert_eq!(core.channels.get(id).unwrap().refs(), 2);
    }
}
