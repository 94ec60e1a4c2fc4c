//! Software fallback section filter.
//!
//! Used when the hardware filter table of an engine is full, or when
//! hardware filtering is turned off. One instance serves the whole device:
//! it binds an async FIFO to the engine it tracks, selects dump-TS on that
//! engine, and re-filters the captured stream. Captured chunks do not end on
//! packet boundaries, so a partial packet is carried between chunks.

use std::collections::{HashMap, VecDeque};

use log::{debug, info, warn};
use meson_dvb_types::{AfifoId, DmxId, TS_PACKET_SIZE};
use serde::Serialize;

use crate::config::SwFilterConfig;
use crate::demux::DemuxInstance;
use crate::packet::{self, TsPacket};
use crate::section::SectionAssembler;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SwFilterStats {
    pub packets: u64,
    pub sections: u64,
    /// Bytes dropped because the ring was full.
    pub ring_overflow: u64,
    pub users: usize,
    pub dmx: Option<u8>,
}

#[derive(Debug)]
pub(crate) struct SwFilter {
    enabled: bool,
    buffer_size: usize,
    afifo: AfifoId,
    ring: VecDeque<u8>,
    /// Partial packet left over from the previous chunk.
    wrap: Vec<u8>,
    user: usize,
    dmx: Option<DmxId>,
    assemblers: HashMap<u16, SectionAssembler>,
    packets: u64,
    sections: u64,
    ring_overflow: u64,
}

impl SwFilter {
    pub(crate) fn new(config: &SwFilterConfig, afifo: AfifoId) -> Self {
        Self {
            enabled: config.enable,
            buffer_size: config.buffer_size.max(TS_PACKET_SIZE),
            afifo,
            ring: VecDeque::new(),
            wrap: Vec::with_capacity(TS_PACKET_SIZE),
            user: 0,
            dmx: None,
            assemblers: HashMap::new(),
            packets: 0,
            sections: 0,
            ring_overflow: 0,
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn afifo(&self) -> AfifoId {
        self.afifo
    }

    pub(crate) fn dmx(&self) -> Option<DmxId> {
        self.dmx
    }

    pub(crate) fn users(&self) -> usize {
        self.user
    }

    /// Take a user reference. Returns true when this is the first user and
    /// the caller must bind the async FIFO.
    pub(crate) fn acquire(&mut self, dmx: DmxId) -> Result<bool, String> {
        match self.dmx {
            Some(current) if current != dmx => {
                return Err(format!("software filter is tracking {}", current))
            }
            _ => {}
        }
        self.user += 1;
        if self.user == 1 {
            self.dmx = Some(dmx);
            self.clear();
            info!("software filter activated on {} via {}", dmx, self.afifo);
            return Ok(true);
        }
        Ok(false)
    }

    /// Drop `count` user references. Returns the engine to unbind when the
    /// last user went away.
    pub(crate) fn release(&mut self, count: usize) -> Option<DmxId> {
        if count == 0 || self.user == 0 {
            return None;
        }
        self.user = self.user.saturating_sub(count);
        if self.user > 0 {
            return None;
        }
        let dmx = self.dmx.take();
        self.clear();
        if let Some(dmx) = dmx {
            info!("software filter deactivated on {}", dmx);
        }
        dmx
    }

    fn clear(&mut self) {
        self.ring.clear();
        self.wrap.clear();
        self.assemblers.clear();
    }

    /// Queue captured bytes, dropping the oldest when the ring is full.
    pub(crate) fn write(&mut self, chunk: &[u8]) {
        self.ring.extend(chunk);
        let excess = self.ring.len().saturating_sub(self.buffer_size);
        if excess > 0 {
            self.ring.drain(..excess);
            self.ring_overflow += excess as u64;
            warn!("software filter ring overflow, {} bytes dropped", excess);
        }
    }

    /// Filter everything queued against the tracked instance's software
    /// filters.
    pub(crate) fn process(&mut self, instance: &DemuxInstance) {
        if self.dmx != Some(instance.id()) {
            self.ring.clear();
            return;
        }
        let mut buf = std::mem::take(&mut self.wrap);
        buf.extend(self.ring.drain(..));

        let pids = instance.software_pids();
        self.assemblers.retain(|pid, _| pids.contains_key(pid));

        let mut found = Vec::new();
        let mut packets = 0u64;
        let consumed = packet::for_each_packet(&buf, |raw| {
            packets += 1;
            let Some(pkt) = TsPacket::parse(raw) else {
                return;
            };
            if pkt.header.transport_error {
                return;
            }
            let Some(&channel) = pids.get(&pkt.header.pid) else {
                return;
            };
            self.assemblers.entry(pkt.header.pid).or_default().push(
                pkt.payload,
                pkt.header.continuity_counter,
                pkt.header.payload_unit_start,
                |s| found.push((channel, s.to_vec())),
            );
        });
        self.wrap = buf[consumed..].to_vec();
        self.packets += packets;

        if !found.is_empty() {
            debug!("software filter assembled {} sections", found.len());
            self.sections += found.len() as u64;
            instance.deliver_software(found);
        }
    }

    pub(crate) fn stats(&self) -> SwFilterStats {
        SwFilterStats {
            packets: self.packets,
            sections: self.sections,
            ring_overflow: self.ring_overflow,
            users: self.user,
            dmx: self.dmx.map(|d| d.index() as u8),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::config::DemuxConfig;
    use crate::demux::tests::{instance, section_packets};
    use crate::demux::{DemuxOutput, FeedSpec};
    use crate::hal::SimHal;
    use crate::section::tests::make_section;
    use crate::table::{FilterPath, FilterPattern};
    use meson_dvb_types::SectionOrigin;
    use tokio::sync::mpsc;

    fn swfilter() -> SwFilter {
        SwFilter::new(&SwFilterConfig::default(), AfifoId::new(1).unwrap())
    }

    #[test]
    fn test_single_tracked_engine() {
        let mut sf = swfilter();
        let dmx0 = DmxId::new(0).unwrap();
        let dmx1 = DmxId::new(1).unwrap();
        assert_eq!(sf.acquire(dmx0), Ok(true));
        assert_eq!(sf.acquire(dmx0), Ok(false));
        assert!(sf.acquire(dmx1).is_err());
        assert_eq!(sf.release(1), None);
        assert_eq!(sf.release(1), Some(dmx0));
        assert_eq!(sf.acquire(dmx1), Ok(true));
    }

    #[test]
    fn test_ring_is_bounded() {
        let config = SwFilterConfig {
            buffer_size: 2 * TS_PACKET_SIZE,
            ..Default::default()
        };
        let mut sf = SwFilter::new(&config, AfifoId::new(0).unwrap());
        sf.write(&[0x47; 3 * TS_PACKET_SIZE]);
        assert_eq!(sf.ring.len(), 2 * TS_PACKET_SIZE);
        assert_eq!(sf.stats().ring_overflow, TS_PACKET_SIZE as u64);
    }

    #[tokio::test]
    async fn test_sections_across_unaligned_chunks() {
        let hal = SimHal::new();
        let inst = instance(&DemuxConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let feed = inst.start_feed(&hal, FeedSpec::section(0x12), tx, Instant::now()).unwrap();
        inst.attach_filter(feed, FilterPattern::table_id(0x02), 3, FilterPath::Software)
            .unwrap();

        let mut sf = swfilter();
        sf.acquire(inst.id()).unwrap();
        let sections = vec![make_section(0x02, 1, &[1; 40]), make_section(0x03, 1, &[2])];
        let ts = section_packets(0x12, &sections);
        for chunk in ts.chunks(100) {
            sf.write(chunk);
            sf.process(&inst);
        }

        match rx.try_recv() {
            Ok(DemuxOutput::Section { origin, data, handle, .. }) => {
                assert_eq!(origin, SectionOrigin::Sw);
                assert_eq!(handle, 3);
                assert_eq!(data.to_vec(), sections[0]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(inst.stats().seen(SectionOrigin::Sw), 2);
        assert_eq!(inst.stats().matched(SectionOrigin::Sw), 1);
        assert_eq!(sf.stats().packets, 2);
    }
}
