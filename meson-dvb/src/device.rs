//! Top-level device: the demux engines, async FIFOs, software filter,
//! input router and frontend registry behind one device lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use bytes::Bytes;
use log::{debug, error, info, warn};
use meson_dvb_types::{
    AfifoId, DemuxError, DmxId, DmxSource, Resource, TsSource, DMX_DEV_COUNT,
};
use serde::Serialize;
use tokio::sync::MutexGuard as AsyncMutexGuard;

use crate::asyncfifo::{AsyncFifo, AsyncFifoSnapshot, CaptureTap};
use crate::config::Config;
use crate::demux::engine::Capture;
use crate::demux::{DemuxInstance, FeedSink, FeedSpec, StatsSnapshot, WatchdogState};
use crate::frontend::{ErrorCheckReport, Frontend, PtsTracker};
use crate::hal::{DemuxHal, IrqLine};
use crate::router::Router;
use crate::swfilter::{SwFilter, SwFilterStats};
use crate::table::{FeedId, FilterId, FilterPath, FilterPattern};

/// Base of the simulated buffer memory.
const POOL_BASE: u64 = 0x0800_0000;
/// Address space given to each engine's pools.
const POOL_STRIDE: u64 = 0x0400_0000;

/// State guarded by the device lock.
pub struct DeviceState {
    pub(crate) router: Router,
    pub(crate) frontends: HashMap<DmxSource, Arc<dyn Frontend>>,
    /// Set while a reset sequence runs.
    pub(crate) reset_flag: bool,
    /// Device-wide reset requested, served by the next watchdog tick.
    pub(crate) reset_requested: bool,
    pub(crate) watchdog_disabled: [bool; DMX_DEV_COUNT],
}

impl DeviceState {
    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn is_resetting(&self) -> bool {
        self.reset_flag
    }
}

pub struct Device {
    pub(crate) hal: Arc<dyn DemuxHal>,
    pub(crate) config: Config,
    pub(crate) demux: Vec<Arc<DemuxInstance>>,
    pub(crate) afifos: Vec<Arc<AsyncFifo>>,
    pub(crate) swfilter: Mutex<SwFilter>,
    pub(crate) state: tokio::sync::Mutex<DeviceState>,
}

impl Device {
    /// Bring up every engine and async FIFO. Engines whose init fails are
    /// marked unavailable; the rest keep working.
    pub async fn probe(hal: Arc<dyn DemuxHal>, config: Config) -> Result<Arc<Self>, DemuxError> {
        let router = Router::from_config(&config.device);
        let default_source: DmxSource = config.device.default_source.parse()?;
        let ts_source = match router.resolve(default_source) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("default source {:?} unusable: {}", default_source, e);
                None
            }
        };
        let sw_afifo = AfifoId::new(config.swfilter.afifo as usize)?;
        let now = Instant::now();

        let device = Arc::new_cyclic(|weak: &Weak<Device>| {
            let demux = DmxId::all()
                .map(|id| {
                    DemuxInstance::new(
                        id,
                        &config.demux,
                        default_source,
                        ts_source,
                        POOL_BASE + id.index() as u64 * POOL_STRIDE,
                        now,
                    )
                })
                .collect();
            let tap: Weak<dyn CaptureTap> = weak.clone();
            let afifos = AfifoId::all()
                .map(|id| AsyncFifo::new(id, &config.asyncfifo, tap.clone()))
                .collect();
            let mut watchdog_disabled = [false; DMX_DEV_COUNT];
            for &d in &config.watchdog.disabled {
                if let Some(flag) = watchdog_disabled.get_mut(d as usize) {
                    *flag = true;
                }
            }
            Device {
                hal,
                swfilter: Mutex::new(SwFilter::new(&config.swfilter, sw_afifo)),
                state: tokio::sync::Mutex::new(DeviceState {
                    router,
                    frontends: HashMap::new(),
                    reset_flag: false,
                    reset_requested: false,
                    watchdog_disabled,
                }),
                config,
                demux,
                afifos,
            }
        });

        for inst in &device.demux {
            if let Err(e) = device.hal.dmx_init(inst.id()) {
                error!("{}: init failed, engine unavailable: {}", inst.id(), e);
                inst.set_available(false);
            }
        }
        for fifo in &device.afifos {
            device.hal.afifo_init(fifo.id())?;
            device.hal.set_irq_enabled(IrqLine::AsyncFifo(fifo.id()), true)?;
            fifo.init();
        }
        info!(
            "device probed: {} engines, {} async fifos, default source {:?}",
            device.demux.len(),
            device.afifos.len(),
            default_source
        );
        Ok(device)
    }

    /// Take the device lock, for the `*_locked` operations.
    pub async fn lock(&self) -> AsyncMutexGuard<'_, DeviceState> {
        self.state.lock().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn instance(&self, dmx: DmxId) -> Result<&Arc<DemuxInstance>, DemuxError> {
        self.demux
            .get(dmx.index())
            .ok_or_else(|| DemuxError::InvalidState(format!("no engine {}", dmx)))
    }

    pub fn instances(&self) -> &[Arc<DemuxInstance>] {
        &self.demux
    }

    pub fn afifo(&self, id: AfifoId) -> Result<&Arc<AsyncFifo>, DemuxError> {
        self.afifos
            .get(id.index())
            .ok_or_else(|| DemuxError::InvalidState(format!("no async fifo {}", id)))
    }

    pub(crate) fn swfilter(&self) -> MutexGuard<'_, SwFilter> {
        self.swfilter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn available(&self, dmx: DmxId) -> Result<&Arc<DemuxInstance>, DemuxError> {
        let inst = self.instance(dmx)?;
        if !inst.is_available() {
            return Err(DemuxError::Unavailable(dmx.index() as u8));
        }
        Ok(inst)
    }

    // ---- transport input ----

    /// Feed raw transport data arriving on `source`.
    pub async fn inject(&self, source: TsSource, data: &[u8]) -> Result<(), DemuxError> {
        let state = self.state.lock().await;
        state.router.check_input(source)?;
        self.route(source, data, Instant::now(), 0);
        Ok(())
    }

    fn route(&self, source: TsSource, data: &[u8], now: Instant, depth: usize) {
        if depth >= DMX_DEV_COUNT {
            warn!("cascade loop on {}, data dropped", source);
            return;
        }
        for inst in &self.demux {
            if inst.source() != Some(source) {
                continue;
            }
            let bound: Vec<&Arc<AsyncFifo>> = self
                .afifos
                .iter()
                .filter(|f| f.source() == Some(inst.id()))
                .collect();
            let capture = match (bound.is_empty(), inst.dump_ts_select()) {
                (true, _) => Capture::None,
                (false, true) => Capture::All,
                (false, false) => Capture::Recorded,
            };
            let captured = inst.process(data, now, capture);
            if !captured.is_empty() {
                for fifo in bound {
                    fifo.fill(&captured);
                }
            }
            self.route(TsSource::cascade(inst.id()), data, now, depth + 1);
        }
    }

    // ---- feeds and filters ----

    pub async fn start_feed(
        &self,
        dmx: DmxId,
        spec: FeedSpec,
        sink: FeedSink,
    ) -> Result<FeedId, DemuxError> {
        let _state = self.state.lock().await;
        let inst = self.available(dmx)?;
        inst.start_feed(self.hal.as_ref(), spec, sink, Instant::now())
    }

    pub async fn stop_feed(&self, dmx: DmxId, feed: FeedId) -> Result<(), DemuxError> {
        let _state = self.state.lock().await;
        let inst = self.instance(dmx)?;
        inst.quiesce().await;
        let result = inst.stop_feed(self.hal.as_ref(), feed, Instant::now());
        inst.unmask(true);
        let outcome = result?;
        if outcome.sw_filters_detached > 0 {
            self.release_swfilter(inst, outcome.sw_filters_detached);
        }
        Ok(())
    }

    /// Attach a section filter to a section feed. Falls back to the software
    /// filter when the engine cannot take another hardware filter.
    pub async fn attach_filter(
        &self,
        dmx: DmxId,
        feed: FeedId,
        pattern: FilterPattern,
        handle: u64,
    ) -> Result<FilterId, DemuxError> {
        let _state = self.state.lock().await;
        let inst = self.available(dmx)?;
        if !inst.needs_software_filter() {
            return inst.attach_filter(feed, pattern, handle, FilterPath::Hardware);
        }

        let mut sf = self.swfilter();
        if !sf.is_enabled() {
            return Err(DemuxError::ResourceExhausted(Resource::Filter));
        }
        let first = sf.acquire(dmx).map_err(DemuxError::InvalidState)?;
        if first {
            if let Err(e) = self.bind_swfilter(inst, sf.afifo()) {
                sf.release(1);
                return Err(e);
            }
        }
        match inst.attach_filter(feed, pattern, handle, FilterPath::Software) {
            Ok(id) => Ok(id),
            Err(e) => {
                drop(sf);
                self.release_swfilter(inst, 1);
                Err(e)
            }
        }
    }

    pub async fn detach_filter(&self, dmx: DmxId, filter: FilterId) -> Result<(), DemuxError> {
        let _state = self.state.lock().await;
        let inst = self.instance(dmx)?;
        inst.quiesce().await;
        let result = inst.detach_filter(filter);
        inst.unmask(true);
        if result? == FilterPath::Software {
            self.release_swfilter(inst, 1);
        }
        Ok(())
    }

    fn bind_swfilter(&self, inst: &DemuxInstance, afifo: AfifoId) -> Result<(), DemuxError> {
        let fifo = self.afifo(afifo)?;
        self.hal.afifo_set_source(afifo, inst.id())?;
        fifo.set_source(Some(inst.id()));
        inst.set_dump_ts_select(self.hal.as_ref(), true)?;
        Ok(())
    }

    fn release_swfilter(&self, inst: &DemuxInstance, count: usize) {
        let mut sf = self.swfilter();
        let afifo = sf.afifo();
        if sf.release(count) == Some(inst.id()) {
            if let Err(e) = inst.set_dump_ts_select(self.hal.as_ref(), false) {
                warn!("{}: failed to clear dump-ts select: {}", inst.id(), e);
            }
            if let Ok(fifo) = self.afifo(afifo) {
                fifo.set_source(None);
            }
        }
    }

    // ---- sources ----

    pub async fn set_source(&self, dmx: DmxId, source: DmxSource) -> Result<(), DemuxError> {
        let state = self.state.lock().await;
        let ts = state.router.resolve(source)?;
        if ts.cascade_dmx() == Some(dmx) {
            return Err(DemuxError::InvalidSource(format!("{} cannot cascade from itself", dmx)));
        }
        let inst = self.available(dmx)?;
        if inst.has_source(source, ts) {
            return Ok(());
        }
        inst.quiesce().await;
        let result = inst.set_source(self.hal.as_ref(), source, ts);
        inst.unmask(false);
        result
    }

    pub async fn set_dump_ts_select(&self, dmx: DmxId, dump: bool) -> Result<(), DemuxError> {
        let _state = self.state.lock().await;
        self.available(dmx)?.set_dump_ts_select(self.hal.as_ref(), dump)
    }

    pub async fn set_stb_source(&self, source: DmxSource) -> Result<(), DemuxError> {
        let mut state = self.state.lock().await;
        state.router.set_stb_source(self.hal.as_ref(), source)
    }

    pub async fn set_tso_source(&self, source: DmxSource) -> Result<(), DemuxError> {
        let mut state = self.state.lock().await;
        state.router.set_tso_source(self.hal.as_ref(), source)
    }

    pub async fn set_skipbyte(&self, skipbyte: u8) -> Result<(), DemuxError> {
        let mut state = self.state.lock().await;
        state.router.set_skipbyte(self.hal.as_ref(), skipbyte)
    }

    // ---- async FIFOs ----

    pub async fn afifo_set_source(&self, id: AfifoId, dmx: DmxId) -> Result<(), DemuxError> {
        let _state = self.state.lock().await;
        let fifo = self.afifo(id)?;
        self.instance(dmx)?;
        self.hal.afifo_set_source(id, dmx)?;
        fifo.set_source(Some(dmx));
        Ok(())
    }

    pub async fn afifo_deinit(&self, id: AfifoId) -> Result<(), DemuxError> {
        let _state = self.state.lock().await;
        let fifo = self.afifo(id)?;
        self.hal.set_irq_enabled(IrqLine::AsyncFifo(id), false)?;
        self.hal.afifo_deinit(id)?;
        fifo.deinit();
        Ok(())
    }

    /// Re-initialise a FIFO taken down with [`Device::afifo_deinit`].
    pub async fn afifo_init(&self, id: AfifoId) -> Result<(), DemuxError> {
        let _state = self.state.lock().await;
        let fifo = self.afifo(id)?;
        self.hal.afifo_init(id)?;
        self.hal.set_irq_enabled(IrqLine::AsyncFifo(id), true)?;
        fifo.init();
        Ok(())
    }

    // ---- frontends ----

    pub async fn register_frontend(&self, source: DmxSource, frontend: Arc<dyn Frontend>) {
        let mut state = self.state.lock().await;
        state.frontends.insert(source, frontend);
        debug!("frontend registered for {:?}", source);
    }

    fn on_source<'a>(&'a self, source: DmxSource) -> impl Iterator<Item = &'a Arc<DemuxInstance>> {
        self.demux.iter().filter(move |i| i.dmx_source() == source)
    }

    /// The tuner is about to retune: suspend the error check.
    pub async fn before_retune(&self, source: DmxSource) {
        let _state = self.state.lock().await;
        for inst in self.on_source(source) {
            inst.lock().error_check.before_retune();
        }
    }

    pub async fn after_retune(&self, source: DmxSource) {
        let _state = self.state.lock().await;
        let now = Instant::now();
        for inst in self.on_source(source) {
            inst.lock().error_check.after_retune(now);
        }
    }

    pub async fn start_error_check(&self, source: DmxSource) {
        let _state = self.state.lock().await;
        let now = Instant::now();
        for inst in self.on_source(source) {
            inst.lock().error_check.start(now);
        }
    }

    pub async fn stop_error_check(&self, source: DmxSource) -> ErrorCheckReport {
        let _state = self.state.lock().await;
        self.on_source(source)
            .map(|inst| inst.lock().error_check.stop())
            .fold(ErrorCheckReport::default(), |acc, r| ErrorCheckReport {
                interrupts: acc.interrupts + r.interrupts,
                retunes: acc.retunes + r.retunes,
            })
    }

    // ---- PTS ----

    fn pts(&self, dmx: DmxId) -> Result<PtsTracker, DemuxError> {
        Ok(self.instance(dmx)?.pts())
    }

    pub fn video_pts(&self, dmx: DmxId) -> Result<Option<u64>, DemuxError> {
        Ok(self.pts(dmx)?.video)
    }

    pub fn audio_pts(&self, dmx: DmxId) -> Result<Option<u64>, DemuxError> {
        Ok(self.pts(dmx)?.audio)
    }

    pub fn first_video_pts(&self, dmx: DmxId) -> Result<Option<u64>, DemuxError> {
        Ok(self.pts(dmx)?.first_video)
    }

    pub fn first_audio_pts(&self, dmx: DmxId) -> Result<Option<u64>, DemuxError> {
        Ok(self.pts(dmx)?.first_audio)
    }

    // ---- statistics ----

    /// Wait until every worker has delivered what is queued.
    pub async fn settle(&self) {
        for inst in &self.demux {
            inst.flush().await;
        }
        for fifo in &self.afifos {
            fifo.drained().await;
        }
        for inst in &self.demux {
            inst.flush().await;
        }
    }

    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            demux: self
                .demux
                .iter()
                .map(|inst| DemuxReport {
                    id: inst.id().index() as u8,
                    available: inst.is_available(),
                    state: inst.watchdog_state(),
                    source: inst.source().map(|s| s.to_string()),
                    feeds: inst.feed_count(),
                    pids: inst.channel_pids(),
                    busy_buffers: inst.busy_buffers(),
                    last_fault: inst.last_fault().map(|e| e.to_string()),
                    stats: inst.stats().snapshot(),
                })
                .collect(),
            afifo: self.afifos.iter().map(|f| f.stats().snapshot()).collect(),
            swfilter: self.swfilter().stats(),
        }
    }
}

impl CaptureTap for Device {
    fn captured(&self, fifo: AfifoId, data: &Bytes) {
        let mut sf = self.swfilter();
        if sf.afifo() != fifo {
            return;
        }
        let Some(dmx) = sf.dmx() else {
            return;
        };
        if let Some(inst) = self.demux.get(dmx.index()) {
            sf.write(data);
            sf.process(inst);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DemuxReport {
    pub id: u8,
    pub available: bool,
    pub state: WatchdogState,
    pub source: Option<String>,
    pub feeds: usize,
    pub pids: Vec<u16>,
    pub busy_buffers: usize,
    pub last_fault: Option<String>,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStats {
    pub demux: Vec<DemuxReport>,
    pub afifo: Vec<AsyncFifoSnapshot>,
    pub swfilter: SwFilterStats,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::DemuxConfig;
    use crate::demux::DemuxOutput;
    use crate::demux::tests::section_packets;
    use crate::hal::{HalCall, SimHal};
    use crate::section::tests::make_section;
    use meson_dvb_types::SectionOrigin;
    use tokio::sync::mpsc;

    pub(crate) async fn device(config: Config) -> (Arc<Device>, Arc<SimHal>) {
        let hal = Arc::new(SimHal::new());
        let device = Device::probe(hal.clone(), config).await.unwrap();
        (device, hal)
    }

    pub(crate) fn dmx0() -> DmxId {
        DmxId::new(0).unwrap()
    }

    #[tokio::test]
    async fn test_probe_initializes_hardware() {
        let (device, hal) = device(Config::default()).await;
        let calls = hal.calls();
        for id in DmxId::all() {
            assert!(calls.contains(&HalCall::DmxInit(id)));
        }
        assert!(calls.contains(&HalCall::AfifoInit(AfifoId::new(1).unwrap())));
        assert_eq!(device.instance(dmx0()).unwrap().source(), Some(TsSource::Ts0));
    }

    #[tokio::test]
    async fn test_probe_failure_marks_engine_unavailable() {
        let hal = Arc::new(SimHal::new());
        hal.fail_next("dmx_init", 1);
        let device = Device::probe(hal, Config::default()).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(
            device.start_feed(dmx0(), FeedSpec::section(0x10), tx).await.unwrap_err(),
            DemuxError::Unavailable(0)
        );
        assert!(device.instance(DmxId::new(1).unwrap()).unwrap().is_available());
    }

    #[tokio::test]
    async fn test_inject_delivers_matching_sections() {
        let (device, _hal) = device(Config::default()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let feed = device.start_feed(dmx0(), FeedSpec::section(0x12), tx).await.unwrap();
        device
            .attach_filter(dmx0(), feed, FilterPattern::table_id(0x02), 1)
            .await
            .unwrap();

        let sections = vec![make_section(0x02, 1, &[1]), make_section(0x03, 1, &[2])];
        device
            .inject(TsSource::Ts0, &section_packets(0x12, &sections))
            .await
            .unwrap();
        device.settle().await;

        // Every engine defaults to front0, but only dmx0 has a feed.
        assert!(matches!(rx.try_recv(), Ok(DemuxOutput::Section { handle: 1, .. })));
        assert!(rx.try_recv().is_err());
        assert!(device.inject(TsSource::Ts1, &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_set_source_is_idempotent_and_checked() {
        let (device, hal) = device(Config::default()).await;
        hal.clear_calls();
        device.set_source(dmx0(), DmxSource::Dvr(0)).await.unwrap();
        device.set_source(dmx0(), DmxSource::Dvr(0)).await.unwrap();
        let switches = hal
            .calls()
            .iter()
            .filter(|c| matches!(c, HalCall::DmxSetSource(..)))
            .count();
        assert_eq!(switches, 1);
        assert_eq!(device.instance(dmx0()).unwrap().source(), Some(TsSource::Hiu));

        assert!(device.set_source(dmx0(), DmxSource::FrontOffset(0)).await.is_err());
        assert!(device.set_source(dmx0(), DmxSource::Front(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_cascade_reaches_downstream_engine() {
        let (device, _hal) = device(Config::default()).await;
        let dmx1 = DmxId::new(1).unwrap();
        device.set_source(dmx1, DmxSource::FrontOffset(0)).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let feed = device.start_feed(dmx1, FeedSpec::section(0x14), tx).await.unwrap();
        device
            .attach_filter(dmx1, feed, FilterPattern::default(), 4)
            .await
            .unwrap();

        let ts = section_packets(0x14, &[make_section(0x70, 0, &[])]);
        device.inject(TsSource::Ts0, &ts).await.unwrap();
        device.settle().await;
        assert!(matches!(rx.try_recv(), Ok(DemuxOutput::Section { handle: 4, .. })));
    }

    #[tokio::test]
    async fn test_software_fallback_when_hardware_table_disabled() {
        let mut config = Config::default();
        config.demux = DemuxConfig {
            hw_filters: false,
            ..Default::default()
        };
        let (device, hal) = device(config).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let feed = device.start_feed(dmx0(), FeedSpec::section(0x12), tx).await.unwrap();
        let filter = device
            .attach_filter(dmx0(), feed, FilterPattern::table_id(0x02), 8)
            .await
            .unwrap();

        let sw_afifo = AfifoId::new(1).unwrap();
        assert!(hal.calls().contains(&HalCall::AfifoSetSource(sw_afifo, dmx0())));
        assert!(device.instance(dmx0()).unwrap().dump_ts_select());

        let sections = vec![make_section(0x02, 5, &[9; 30]), make_section(0x03, 5, &[])];
        let ts = section_packets(0x12, &sections);
        for chunk in ts.chunks(77) {
            device.inject(TsSource::Ts0, chunk).await.unwrap();
        }
        device.afifo(sw_afifo).unwrap().flush();
        device.settle().await;

        match rx.try_recv() {
            Ok(DemuxOutput::Section { origin, data, .. }) => {
                assert_eq!(origin, SectionOrigin::Sw);
                assert_eq!(data.to_vec(), sections[0]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());

        device.detach_filter(dmx0(), filter).await.unwrap();
        assert!(!device.instance(dmx0()).unwrap().dump_ts_select());
        assert_eq!(device.stats().swfilter.users, 0);
    }

    #[tokio::test]
    async fn test_pts_queries() {
        let (device, _hal) = device(Config::default()).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        device
            .start_feed(dmx0(), FeedSpec::pes(0x100, meson_dvb_types::PesType::Video), tx)
            .await
            .unwrap();
        let pes = [0, 0, 1, 0xE0, 0, 8, 0x80, 0x80, 5, 0x21, 0x00, 0x05, 0xBF, 0x21];
        let ts = crate::packet::tests::packet(0x100, true, 0, &pes);
        device.inject(TsSource::Ts0, &ts).await.unwrap();
        device.settle().await;
        assert_eq!(device.video_pts(dmx0()).unwrap(), Some(90000));
        assert_eq!(device.first_video_pts(dmx0()).unwrap(), Some(90000));
        assert_eq!(device.audio_pts(dmx0()).unwrap(), None);
    }
}
