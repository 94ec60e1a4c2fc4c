//! Drain workers: the deferred half of the demux and DVR interrupts.

use std::sync::Weak;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::debug;
use meson_dvb_types::{DemuxError, PesType, SectionOrigin};
use tokio::sync::mpsc;

use super::{DemuxCore, DemuxInstance, DemuxOutput, DemuxStats, DrainEvent, DvrEvent, FeedKind, FeedSink};
use crate::buffer::BufferSlot;
use crate::packet::parse_pes_pts;
use crate::section::{crc_ok, has_syntax_indicator};
use crate::table::{ChannelId, FilterPath};

type Deliveries = Vec<(FeedSink, DemuxOutput)>;

pub(crate) async fn run_dmx_worker(
    instance: Weak<DemuxInstance>,
    mut rx: mpsc::UnboundedReceiver<DrainEvent>,
) {
    while let Some(event) = rx.recv().await {
        if let DrainEvent::Barrier(done) = event {
            let _ = done.send(());
            continue;
        }
        let Some(instance) = instance.upgrade() else {
            break;
        };
        instance.drain(event);
    }
    debug!("demux drain worker exiting");
}

pub(crate) async fn run_dvr_worker(
    instance: Weak<DemuxInstance>,
    mut rx: mpsc::UnboundedReceiver<DvrEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            DvrEvent::Barrier(done) => {
                let _ = done.send(());
            }
            DvrEvent::Packet { channel, data } => {
                let Some(instance) = instance.upgrade() else {
                    break;
                };
                instance.drain_dvr(channel, data);
            }
        }
    }
    debug!("dvr drain worker exiting");
}

impl DemuxInstance {
    /// Handle one data-ready event: read the buffer, match, deliver, release.
    pub(crate) fn drain(&self, event: DrainEvent) {
        let mut deliveries = Deliveries::new();
        {
            let mut guard = self.lock();
            let core = &mut *guard;
            match event {
                DrainEvent::Section {
                    channel,
                    slot,
                    origin,
                } => {
                    if let Some(data) = core.take_slot(slot, &self.stats) {
                        core.match_section(channel, data, origin, &self.stats, &mut deliveries);
                    }
                }
                DrainEvent::Pes { channel, slot } => {
                    if let Some(data) = core.take_slot(slot, &self.stats) {
                        core.deliver_pes(channel, data, &self.stats, &mut deliveries);
                    }
                }
                DrainEvent::Pcr { channel, pcr } => {
                    if let Some(c) = core.channels.get(channel) {
                        let pid = c.pid;
                        self.stats.record_pcr();
                        for sink in core.sinks_for(channel, |k| k == FeedKind::Pcr) {
                            deliveries.push((sink, DemuxOutput::Pcr { pid, pcr }));
                        }
                    }
                }
                DrainEvent::Barrier(done) => {
                    let _ = done.send(());
                }
            }
        }
        send_all(deliveries);
    }

    fn drain_dvr(&self, channel: ChannelId, data: Bytes) {
        let sinks = {
            let core = self.lock();
            let Some(c) = core.channels.get(channel) else {
                self.stats.record_stale();
                return;
            };
            let pid = c.pid;
            core.sinks_for(channel, |k| k == FeedKind::Record)
                .into_iter()
                .map(|s| (s, pid))
                .collect::<Vec<_>>()
        };
        self.stats.record_dvr(data.len());
        for (sink, pid) in sinks {
            let _ = sink.send(DemuxOutput::Ts {
                pid,
                data: data.clone(),
            });
        }
    }

    /// Deliver sections extracted by the software filter.
    pub(crate) fn deliver_software(&self, sections: Vec<(ChannelId, Vec<u8>)>) {
        let mut deliveries = Deliveries::new();
        {
            let mut guard = self.lock();
            let core = &mut *guard;
            for (channel, section) in sections {
                core.match_section(
                    channel,
                    Bytes::from(section),
                    SectionOrigin::Sw,
                    &self.stats,
                    &mut deliveries,
                );
            }
        }
        send_all(deliveries);
    }
}

fn send_all(deliveries: Deliveries) {
    for (sink, output) in deliveries {
        // A closed sink means the consumer went away before stopping its feed.
        let _ = sink.send(output);
    }
}

impl DemuxCore {
    /// Copy a unit out of its buffer and return the buffer to the pool.
    /// `None` when the buffer was reclaimed while the event was pending.
    fn take_slot(&mut self, slot: BufferSlot, stats: &DemuxStats) -> Option<Bytes> {
        let data = self
            .pools
            .get_mut(slot.kind())
            .and_then(|pool| pool.read(&slot))
            .map(Bytes::copy_from_slice);
        self.pools.release(slot);
        if data.is_none() {
            stats.record_stale();
        }
        data
    }

    fn match_section(
        &mut self,
        channel: ChannelId,
        data: Bytes,
        origin: SectionOrigin,
        stats: &DemuxStats,
        deliveries: &mut Deliveries,
    ) {
        let Some(pid) = self.channels.get(channel).map(|c| c.pid) else {
            stats.record_stale();
            return;
        };
        stats.record_seen(origin);

        if self.config.crc.check && has_syntax_indicator(&data) && !crc_ok(&data) {
            stats.record_crc_fail(origin);
            let window = Duration::from_millis(self.config.crc.window_ms);
            self.crc.record(Instant::now(), window);
            let fault = DemuxError::CrcMismatch { pid };
            debug!("{}, table 0x{:02X}", fault, data[0]);
            self.last_fault = Some(fault);
            return;
        }

        let path = match origin {
            SectionOrigin::Sw => FilterPath::Software,
            SectionOrigin::Hw | SectionOrigin::SmallSection => FilterPath::Hardware,
        };
        let mut matched = false;
        for (filter_id, filter) in self.filters.for_channel(channel, path) {
            if !filter.matches(&data) {
                continue;
            }
            let Some(feed) = self.feeds.get(filter.feed.0) else {
                continue;
            };
            matched = true;
            deliveries.push((
                feed.sink.clone(),
                DemuxOutput::Section {
                    pid,
                    filter: filter_id,
                    handle: filter.handle,
                    origin,
                    data: data.clone(),
                },
            ));
        }
        if matched {
            stats.record_matched(origin);
        }
    }

    fn deliver_pes(
        &mut self,
        channel: ChannelId,
        data: Bytes,
        stats: &DemuxStats,
        deliveries: &mut Deliveries,
    ) {
        let Some((pid, pes_type)) = self.channels.get(channel).map(|c| (c.pid, c.pes_type)) else {
            stats.record_stale();
            return;
        };
        stats.record_pes();
        let pts = parse_pes_pts(&data);
        if let Some(pts) = pts {
            match pes_type {
                PesType::Video => self.pts.record_video(pts),
                PesType::Audio => self.pts.record_audio(pts),
                _ => {}
            }
        }
        for sink in self.sinks_for(channel, |k| matches!(k, FeedKind::Pes(_))) {
            deliveries.push((
                sink,
                DemuxOutput::Pes {
                    pid,
                    pes_type,
                    pts,
                    data: data.clone(),
                },
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::engine::Capture;
    use super::super::tests::{instance, section_packets};
    use super::super::FeedSpec;
    use super::*;
    use crate::config::DemuxConfig;
    use crate::hal::SimHal;
    use crate::packet::tests::packet;
    use crate::section::tests::make_section;
    use crate::table::FilterPattern;

    #[tokio::test]
    async fn test_table_id_filter_in_arrival_order() {
        let hal = SimHal::new();
        let inst = instance(&DemuxConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let feed = inst.start_feed(&hal, FeedSpec::section(0x12), tx, Instant::now()).unwrap();
        inst.attach_filter(feed, FilterPattern::table_id(0x02), 5, FilterPath::Hardware)
            .unwrap();

        let sections = vec![
            make_section(0x02, 1, &[1]),
            make_section(0x03, 1, &[2]),
            make_section(0x02, 2, &[3]),
            make_section(0x03, 2, &[4]),
            make_section(0x02, 3, &[5]),
        ];
        inst.process(&section_packets(0x12, &sections), Instant::now(), Capture::None);
        inst.flush().await;

        let mut got = Vec::new();
        while let Ok(DemuxOutput::Section { data, handle, .. }) = rx.try_recv() {
            assert_eq!(handle, 5);
            got.push(data.to_vec());
        }
        assert_eq!(got, vec![sections[0].clone(), sections[2].clone(), sections[4].clone()]);
        assert_eq!(inst.stats().seen(SectionOrigin::Hw), 5);
        assert_eq!(inst.stats().matched(SectionOrigin::Hw), 3);
    }

    #[tokio::test]
    async fn test_crc_failure_dropped_and_counted() {
        let hal = SimHal::new();
        let inst = instance(&DemuxConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let feed = inst.start_feed(&hal, FeedSpec::section(0x12), tx, Instant::now()).unwrap();
        inst.attach_filter(feed, FilterPattern::default(), 0, FilterPath::Hardware)
            .unwrap();

        let mut bad = make_section(0x02, 1, &[1, 2]);
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        inst.process(&section_packets(0x12, &[bad]), Instant::now(), Capture::None);
        inst.flush().await;

        assert!(rx.try_recv().is_err());
        assert_eq!(inst.stats().crc_failed(SectionOrigin::Hw), 1);
        assert_eq!(inst.lock().crc.count, 1);
        assert_eq!(inst.last_fault(), Some(DemuxError::CrcMismatch { pid: 0x12 }));
    }

    #[tokio::test]
    async fn test_small_sections_counted_separately() {
        let hal = SimHal::new();
        let mut config = DemuxConfig::default();
        config.small_section.enable = true;
        config.small_section.max_len = 64;
        let inst = instance(&config);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let feed = inst.start_feed(&hal, FeedSpec::section(0x14), tx, Instant::now()).unwrap();
        inst.attach_filter(feed, FilterPattern::default(), 0, FilterPath::Hardware)
            .unwrap();

        let sections = vec![make_section(0x70, 0, &[0; 8]), make_section(0x42, 1, &[0; 100])];
        inst.process(&section_packets(0x14, &sections), Instant::now(), Capture::None);
        inst.flush().await;

        let origins: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|o| match o {
                DemuxOutput::Section { origin, .. } => origin,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(origins, vec![SectionOrigin::SmallSection, SectionOrigin::Hw]);
        assert_eq!(inst.stats().matched(SectionOrigin::SmallSection), 1);
    }

    #[tokio::test]
    async fn test_pes_pts_and_dvr_passthrough() {
        let hal = SimHal::new();
        let inst = instance(&DemuxConfig::default());
        let (pes_tx, mut pes_rx) = mpsc::unbounded_channel();
        let (dvr_tx, mut dvr_rx) = mpsc::unbounded_channel();
        inst.start_feed(&hal, FeedSpec::pes(0x100, PesType::Video), pes_tx, Instant::now())
            .unwrap();
        inst.start_feed(&hal, FeedSpec::record(0x100), dvr_tx, Instant::now())
            .unwrap();

        // PTS 90000, PES_packet_length bounded to the header + 2 bytes.
        let pes = [0, 0, 1, 0xE0, 0, 10, 0x80, 0x80, 5, 0x21, 0x00, 0x05, 0xBF, 0x21, 0xAA, 0xBB];
        let ts = packet(0x100, true, 0, &pes);
        inst.process(&ts, Instant::now(), Capture::None);
        inst.flush().await;

        match pes_rx.try_recv() {
            Ok(DemuxOutput::Pes { pts, data, .. }) => {
                assert_eq!(pts, Some(90000));
                assert_eq!(&data[..], &pes[..]);
            }
            other => panic!("unexpected {:?}", other),
        }
        match dvr_rx.try_recv() {
            Ok(DemuxOutput::Ts { pid, data }) => {
                assert_eq!(pid, 0x100);
                assert_eq!(&data[..], &ts[..]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(inst.pts().first_video, Some(90000));
    }
}
