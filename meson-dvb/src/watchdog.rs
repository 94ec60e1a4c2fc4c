//! Watchdog and reset controller.
//!
//! A periodic tick walks every engine: reclaims leaked buffers, scans the
//! monitored channels for inactivity, watches for CRC-failure storms and
//! runs the frontend error check. A stall that persists for
//! `trigger_threshold` ticks resets the engine; the stalled channels are
//! latched so the same stall cannot trigger again until data flows.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use meson_dvb_types::{DemuxError, DmxId};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::asyncfifo::AsyncFifo;
use crate::demux::{DemuxInstance, WatchdogState};
use crate::device::{Device, DeviceState};
use crate::table::Channel;

/// Interrupt scope of a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetIrq {
    /// Demux and DVR interrupts only.
    DemuxOnly,
    /// Also quiesce and reset the async FIFOs fed by the engine.
    WithAsyncFifo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResetReason {
    Timeout,
    CrcStorm,
}

impl Device {
    pub async fn reset_instance(&self, dmx: DmxId, irq: ResetIrq) -> Result<(), DemuxError> {
        let mut state = self.state.lock().await;
        self.reset_instance_locked(&mut state, dmx, irq).await
    }

    pub async fn reset_all(&self, irq: ResetIrq) -> Result<(), DemuxError> {
        let mut state = self.state.lock().await;
        self.reset_all_locked(&mut state, irq).await
    }

    /// Reset every engine. Stops at the first failure.
    pub async fn reset_all_locked(
        &self,
        state: &mut DeviceState,
        irq: ResetIrq,
    ) -> Result<(), DemuxError> {
        for dmx in DmxId::all() {
            self.reset_instance_locked(state, dmx, irq).await?;
        }
        Ok(())
    }

    /// Reset one engine and restore its programming. The caller holds the
    /// device lock.
    pub async fn reset_instance_locked(
        &self,
        state: &mut DeviceState,
        dmx: DmxId,
        irq: ResetIrq,
    ) -> Result<(), DemuxError> {
        let inst = self.instance(dmx)?.clone();
        state.reset_flag = true;
        inst.lock().timeout.state = WatchdogState::Resetting;
        inst.quiesce().await;

        let fifos: Vec<_> = match irq {
            ResetIrq::DemuxOnly => Vec::new(),
            ResetIrq::WithAsyncFifo => self
                .afifos
                .iter()
                .filter(|f| f.source() == Some(dmx))
                .cloned()
                .collect(),
        };
        for fifo in &fifos {
            fifo.mask();
            fifo.drained().await;
        }

        let result = self.reinit(&inst, &fifos);
        inst.unmask(false);
        for fifo in &fifos {
            fifo.unmask(false);
        }
        state.reset_flag = false;

        match result {
            Ok(()) => {
                inst.stats().record_reset();
                info!("{}: reset complete ({:?})", dmx, irq);
                Ok(())
            }
            Err(e) => {
                error!("{}: reset failed, engine unavailable: {}", dmx, e);
                inst.set_available(false);
                Err(e)
            }
        }
    }

    fn reinit(
        &self,
        inst: &DemuxInstance,
        fifos: &[Arc<AsyncFifo>],
    ) -> Result<(), DemuxError> {
        let dmx = inst.id();
        let failure = |reason: String| DemuxError::HardwareInitFailure {
            dmx: dmx.index() as u8,
            reason,
        };

        for fifo in fifos {
            self.hal
                .afifo_reset(fifo.id())
                .map_err(|e| failure(e.to_string()))?;
            fifo.hw_reset();
        }

        self.hal.dmx_deinit(dmx).map_err(|e| failure(e.to_string()))?;
        self.hal.dmx_init(dmx).map_err(|e| failure(e.to_string()))?;

        let now = Instant::now();
        let mut guard = inst.lock();
        let core = &mut *guard;
        core.available = true;

        if !core.feeds.is_empty() {
            if let Some(source) = core.source {
                self.hal
                    .dmx_set_source(dmx, source)
                    .map_err(|e| failure(e.to_string()))?;
            }
            if core.dump_ts_select {
                self.hal
                    .dmx_set_dump_ts_select(dmx, true)
                    .map_err(|e| failure(e.to_string()))?;
            }
            for (id, channel) in core.channels.iter() {
                self.hal
                    .dmx_start_feed(dmx, id.index(), channel.pid, channel.kind)
                    .map_err(|e| failure(e.to_string()))?;
            }
        }

        let reclaimed = core.pools.reclaim_all();
        if reclaimed > 0 {
            debug!("{}: {} busy buffers reclaimed by reset", dmx, reclaimed);
        }
        core.engine.reset();

        let stalled: Vec<Channel> = core
            .channels
            .iter()
            .filter(|(_, c)| c.stalled)
            .map(|(_, c)| c.clone())
            .collect();
        for channel in &stalled {
            core.channels.remember(channel, now);
        }
        for (_, channel) in core.channels.iter_mut() {
            channel.last_activity = now;
        }

        core.timeout.match_count = 0;
        core.timeout.trigger = 0;
        core.timeout.state = WatchdogState::Normal;
        core.crc.count = 0;
        core.crc.start = now;
        Ok(())
    }

    /// Ask the next watchdog tick to reset the whole device.
    pub async fn request_reset(&self) {
        self.state.lock().await.reset_requested = true;
    }

    pub async fn set_watchdog_disabled(&self, dmx: DmxId, disabled: bool) {
        let mut state = self.state.lock().await;
        if let Some(flag) = state.watchdog_disabled.get_mut(dmx.index()) {
            *flag = disabled;
        }
    }

    pub async fn watchdog_tick(&self) {
        self.watchdog_tick_at(Instant::now()).await
    }

    /// One watchdog pass with an explicit clock.
    pub async fn watchdog_tick_at(&self, now: Instant) {
        let mut state = self.state.lock().await;

        if state.reset_requested {
            state.reset_requested = false;
            warn!("device reset requested");
            if let Err(e) = self.reset_all_locked(&mut state, ResetIrq::WithAsyncFifo).await {
                error!("device reset failed: {}", e);
            }
        }

        let cfg = &self.config.watchdog;
        for inst in &self.demux {
            let dmx = inst.id();
            if state.watchdog_disabled[dmx.index()] || !inst.is_available() {
                continue;
            }

            let (reason, retune_source) = {
                let mut guard = inst.lock();
                let core = &mut *guard;

                let leaked = core.pools.tick(cfg.buffer_leak_ticks);
                if leaked > 0 {
                    warn!("{}: {} leaked buffers reclaimed", dmx, leaked);
                    inst.stats().record_leaked(leaked);
                }

                let mut reason = None;
                let timeout_cfg = &core.config.timeout;
                if timeout_cfg.enable {
                    let timeout = timeout_cfg.timeout();
                    let ch_disable = timeout_cfg.ch_disable;
                    let stalled: Vec<_> = core
                        .channels
                        .iter()
                        .filter(|(_, c)| {
                            c.is_watched(ch_disable, now)
                                && now.saturating_duration_since(c.last_activity) > timeout
                        })
                        .map(|(id, _)| id)
                        .collect();
                    core.timeout.match_count = stalled.len();
                    if stalled.is_empty() {
                        core.timeout.trigger = 0;
                        core.timeout.state = WatchdogState::Normal;
                    } else {
                        core.timeout.trigger += 1;
                        core.timeout.state = WatchdogState::Suspect;
                        debug!(
                            "{}: {} channels idle, trigger {}",
                            dmx,
                            stalled.len(),
                            core.timeout.trigger
                        );
                    }
                    if core.timeout.trigger >= timeout_cfg.trigger_threshold.max(1) {
                        for id in &stalled {
                            if let Some(c) = core.channels.get_mut(*id) {
                                c.stalled = true;
                                let fault = DemuxError::Timeout { pid: c.pid };
                                warn!("{}: {}", dmx, fault);
                                core.last_fault = Some(fault);
                            }
                        }
                        inst.stats().record_timeouts(stalled.len());
                        reason = Some(ResetReason::Timeout);
                    }
                }

                let crc = &core.config.crc;
                let window = Duration::from_millis(crc.window_ms);
                if reason.is_none()
                    && crc.storm_threshold > 0
                    && core.crc.count >= crc.storm_threshold
                    && now.saturating_duration_since(core.crc.start) <= window
                {
                    inst.stats().record_crc_storm();
                    reason = Some(ResetReason::CrcStorm);
                }

                let retune = core
                    .error_check
                    .poll(now, cfg.error_check_window())
                    .then_some(core.dmx_source);
                (reason, retune)
            };

            if let Some(source) = retune_source {
                match state.frontends.get(&source) {
                    Some(frontend) => {
                        warn!("{}: no data from {:?} while in tune, retuning", dmx, source);
                        frontend.retune();
                        inst.stats().record_retune();
                    }
                    None => debug!("{}: retune wanted but no frontend for {:?}", dmx, source),
                }
            }

            if let Some(reason) = reason {
                warn!("{}: resetting after {:?}", dmx, reason);
                if let Err(e) = self
                    .reset_instance_locked(&mut state, dmx, ResetIrq::DemuxOnly)
                    .await
                {
                    error!("{}: {}", dmx, e);
                }
            }
        }
    }

    /// Run the watchdog every `watchdog.period_ms` until the device is
    /// dropped.
    pub fn start_watchdog(self: &Arc<Self>) -> JoinHandle<()> {
        let device = Arc::downgrade(self);
        let period = self.config.watchdog.period();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(device) = device.upgrade() else {
                    break;
                };
                device.watchdog_tick().await;
            }
            debug!("watchdog stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::Config;
    use crate::demux::tests::section_packets;
    use crate::demux::{DemuxOutput, FeedSpec};
    use crate::device::tests::{device, dmx0};
    use crate::frontend::Frontend;
    use crate::hal::HalCall;
    use crate::section::tests::make_section;
    use crate::table::FilterPattern;
    use meson_dvb_types::{DmxSource, PesType, TsSource};
    use tokio::sync::mpsc;

    const TICK: Duration = Duration::from_millis(250);

    #[tokio::test]
    async fn test_sustained_stall_resets_once() {
        let (device, hal) = device(Config::default()).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        device
            .start_feed(dmx0(), FeedSpec::pes(0x100, PesType::Video), tx.clone())
            .await
            .unwrap();
        device
            .start_feed(dmx0(), FeedSpec::pes(0x101, PesType::Audio), tx)
            .await
            .unwrap();
        let inst = device.instance(dmx0()).unwrap().clone();

        let t0 = Instant::now();
        device.watchdog_tick_at(t0 + TICK * 3).await;
        assert_eq!(inst.watchdog_state(), WatchdogState::Suspect);
        assert_eq!(inst.stats().resets(), 0);
        device.watchdog_tick_at(t0 + TICK * 4).await;
        assert_eq!(inst.stats().resets(), 1);
        assert_eq!(inst.watchdog_state(), WatchdogState::Normal);

        // Same PIDs re-armed on the same channels.
        assert_eq!(
            hal.started_feeds(dmx0()),
            vec![(0, 0x100), (1, 0x101), (0, 0x100), (1, 0x101)]
        );

        for i in 5..20 {
            device.watchdog_tick_at(t0 + TICK * i).await;
        }
        assert_eq!(inst.stats().resets(), 1);
        assert_eq!(inst.stats().snapshot().timeouts, 2);
    }

    #[tokio::test]
    async fn test_stalled_video_behind_recording_resets() {
        let (device, _hal) = device(Config::default()).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        device
            .start_feed(dmx0(), FeedSpec::record(0x100), tx.clone())
            .await
            .unwrap();
        device
            .start_feed(dmx0(), FeedSpec::pes(0x100, PesType::Video), tx)
            .await
            .unwrap();
        let inst = device.instance(dmx0()).unwrap().clone();

        let t0 = Instant::now();
        device.watchdog_tick_at(t0 + TICK * 3).await;
        device.watchdog_tick_at(t0 + TICK * 4).await;
        assert_eq!(inst.stats().resets(), 1);
        assert_eq!(inst.stats().snapshot().timeouts, 1);
        assert_eq!(inst.last_fault(), Some(DemuxError::Timeout { pid: 0x100 }));
        assert_eq!(
            device.stats().demux[0].last_fault.as_deref(),
            Some("Channel timeout on PID 0x0100")
        );
    }

    #[tokio::test]
    async fn test_unmonitored_types_never_trigger() {
        let (device, _hal) = device(Config::default()).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        device.start_feed(dmx0(), FeedSpec::section(0x10), tx).await.unwrap();
        let t0 = Instant::now();
        for i in 1..10 {
            device.watchdog_tick_at(t0 + TICK * i * 4).await;
        }
        assert_eq!(device.instance(dmx0()).unwrap().stats().resets(), 0);
    }

    #[tokio::test]
    async fn test_reset_hal_failure_marks_unavailable() {
        let (device, hal) = device(Config::default()).await;
        hal.fail_next("dmx_init", 1);
        let err = device
            .reset_instance(dmx0(), ResetIrq::DemuxOnly)
            .await
            .unwrap_err();
        assert!(matches!(err, DemuxError::HardwareInitFailure { dmx: 0, .. }));
        assert!(!device.instance(dmx0()).unwrap().is_available());

        // A later successful reset brings it back.
        device.reset_instance(dmx0(), ResetIrq::DemuxOnly).await.unwrap();
        assert!(device.instance(dmx0()).unwrap().is_available());
    }

    #[tokio::test]
    async fn test_reset_discards_pending_units() {
        let (device, _hal) = device(Config::default()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let feed = device.start_feed(dmx0(), FeedSpec::section(0x12), tx).await.unwrap();
        device
            .attach_filter(dmx0(), feed, FilterPattern::table_id(0x02), 0)
            .await
            .unwrap();
        let inst = device.instance(dmx0()).unwrap().clone();

        inst.mask();
        let ts = section_packets(0x12, &[make_section(0x02, 1, &[1])]);
        device.inject(TsSource::Ts0, &ts).await.unwrap();
        assert_eq!(inst.busy_buffers(), 1);

        {
            let mut state = device.lock().await;
            device
                .reset_instance_locked(&mut state, dmx0(), ResetIrq::WithAsyncFifo)
                .await
                .unwrap();
        }
        device.settle().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(inst.busy_buffers(), 0);
        assert_eq!(inst.stats().stale_dropped(), 1);

        // Delivery resumes after the reset.
        let ts = section_packets(0x12, &[make_section(0x02, 2, &[2])]);
        device.inject(TsSource::Ts0, &ts).await.unwrap();
        device.settle().await;
        assert!(matches!(rx.try_recv(), Ok(DemuxOutput::Section { .. })));
    }

    #[tokio::test]
    async fn test_crc_storm_resets() {
        let mut config = Config::default();
        config.demux.crc.storm_threshold = 3;
        let (device, _hal) = device(config).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        device.start_feed(dmx0(), FeedSpec::section(0x12), tx).await.unwrap();

        let bad: Vec<_> = (0..3)
            .map(|i| {
                let mut s = make_section(0x02, i, &[i as u8]);
                let last = s.len() - 1;
                s[last] ^= 0x5A;
                s
            })
            .collect();
        device
            .inject(TsSource::Ts0, &section_packets(0x12, &bad))
            .await
            .unwrap();
        device.settle().await;
        device.watchdog_tick().await;
        let inst = device.instance(dmx0()).unwrap();
        assert_eq!(inst.stats().snapshot().crc_storms, 1);
        assert_eq!(inst.stats().resets(), 1);
    }

    struct CountingFrontend(AtomicUsize);

    impl Frontend for CountingFrontend {
        fn retune(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_error_check_requests_retune() {
        let (device, _hal) = device(Config::default()).await;
        let frontend = Arc::new(CountingFrontend(AtomicUsize::new(0)));
        device
            .register_frontend(DmxSource::Front(0), frontend.clone())
            .await;
        device.start_error_check(DmxSource::Front(0)).await;
        device.after_retune(DmxSource::Front(0)).await;

        let later = Instant::now() + Duration::from_secs(2);
        device.watchdog_tick_at(later).await;
        // Every engine on front0 saw a silent window.
        assert_eq!(frontend.0.load(Ordering::SeqCst), 3);

        let report = device.stop_error_check(DmxSource::Front(0)).await;
        assert_eq!(report.retunes, 3);
    }

    #[tokio::test]
    async fn test_disabled_watchdog_skips_engine() {
        let (device, _hal) = device(Config::default()).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        device
            .start_feed(dmx0(), FeedSpec::pes(0x100, PesType::Video), tx)
            .await
            .unwrap();
        device.set_watchdog_disabled(dmx0(), true).await;
        let t0 = Instant::now();
        for i in 1..10 {
            device.watchdog_tick_at(t0 + TICK * i * 4).await;
        }
        assert_eq!(device.instance(dmx0()).unwrap().stats().resets(), 0);
    }

    #[tokio::test]
    async fn test_requested_reset_covers_all_engines() {
        let (device, hal) = device(Config::default()).await;
        hal.clear_calls();
        device.request_reset().await;
        device.watchdog_tick().await;
        let deinits = hal
            .calls()
            .iter()
            .filter(|c| matches!(c, HalCall::DmxDeinit(_)))
            .count();
        assert_eq!(deinits, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reset_during_drain() {
        let (device, _hal) = device(Config::default()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let feed = device.start_feed(dmx0(), FeedSpec::section(0x12), tx).await.unwrap();
        device
            .attach_filter(dmx0(), feed, FilterPattern::default(), 0)
            .await
            .unwrap();

        let sections: Vec<_> = (0..16).map(|i| make_section(0x02, i, &[i as u8; 20])).collect();
        let ts = section_packets(0x12, &sections);
        let injector = {
            let device = device.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    device.inject(TsSource::Ts0, &ts).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        for _ in 0..5 {
            device.reset_instance(dmx0(), ResetIrq::DemuxOnly).await.unwrap();
            tokio::task::yield_now().await;
        }
        injector.await.unwrap();
        device.settle().await;

        let inst = device.instance(dmx0()).unwrap();
        assert_eq!(inst.busy_buffers(), 0);
        let mut delivered = 0;
        while let Ok(DemuxOutput::Section { data, .. }) = rx.try_recv() {
            assert_eq!(data[0], 0x02);
            delivered += 1;
        }
        let stats = inst.stats().snapshot();
        assert_eq!(stats.resets, 5);
        assert!(delivered as u64 <= stats.sections_seen.hw);
    }
}
