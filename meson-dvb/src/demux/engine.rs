//! Software model of the engine datapath: packets in, buffered units and
//! interrupts out.

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;
use log::trace;
use meson_dvb_types::{ChannelType, DemuxError, SectionOrigin, TS_PACKET_SIZE};

use super::{DemuxCore, DemuxInstance, DemuxStats, DrainEvent, DvrEvent, FeedKind};
use crate::buffer::PoolKind;
use crate::packet::{self, TsPacket};
use crate::section::{PesAssembler, SectionAssembler};
use crate::table::ChannelId;

/// Which packets an attached async FIFO receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    None,
    /// Every packet (dump-TS select).
    All,
    /// Packets of recorded PIDs only.
    Recorded,
}

/// Partial packet and unit reassembly state.
#[derive(Debug, Default)]
pub(crate) struct EngineState {
    carry: Vec<u8>,
    sections: HashMap<ChannelId, SectionAssembler>,
    pes: HashMap<ChannelId, PesAssembler>,
}

impl EngineState {
    pub(crate) fn channel_added(&mut self, channel: ChannelId, kind: ChannelType) {
        if kind == ChannelType::Section {
            self.sections.insert(channel, SectionAssembler::new());
        }
    }

    pub(crate) fn channel_removed(&mut self, channel: ChannelId) {
        self.sections.remove(&channel);
        self.pes.remove(&channel);
    }

    /// Forget every partial packet and unit.
    pub(crate) fn reset(&mut self) {
        self.carry.clear();
        self.sections.values_mut().for_each(SectionAssembler::reset);
        self.pes.values_mut().for_each(PesAssembler::reset);
    }
}

impl DemuxInstance {
    /// Run `data` through the engine. Returns the bytes an attached async
    /// FIFO should capture.
    pub(crate) fn process(&self, data: &[u8], now: Instant, capture: Capture) -> Vec<u8> {
        let mut guard = self.lock();
        let core = &mut *guard;
        let mut captured = Vec::new();
        if !core.available {
            return captured;
        }

        let mut buf = std::mem::take(&mut core.engine.carry);
        buf.extend_from_slice(data);
        let mut packets = 0usize;
        let consumed = packet::for_each_packet(&buf, |raw| {
            packets += 1;
            core.process_packet(raw, now, &self.stats, capture, &mut captured);
        });
        let skipped = consumed - packets * TS_PACKET_SIZE;
        if skipped > 0 {
            self.stats.record_sync_lost(skipped);
        }
        core.engine.carry = buf[consumed..].to_vec();
        captured
    }
}

impl DemuxCore {
    fn raise(&mut self, event: DrainEvent, stats: &DemuxStats) {
        stats.record_interrupt();
        self.error_check.record_interrupt();
        self.irq.raise(event);
    }

    fn process_packet(
        &mut self,
        raw: &[u8],
        now: Instant,
        stats: &DemuxStats,
        capture: Capture,
        captured: &mut Vec<u8>,
    ) {
        stats.record_packet();
        let Some(pkt) = TsPacket::parse(raw) else {
            return;
        };
        if capture == Capture::All {
            captured.extend_from_slice(raw);
        }
        let Some(channel_id) = self.channels.lookup_pid(pkt.header.pid) else {
            return;
        };
        let Some(channel) = self.channels.get_mut(channel_id) else {
            return;
        };
        if !pkt.payload.is_empty() {
            channel.touch(now);
        }
        let kind = channel.kind;
        let pes_type = channel.pes_type;
        let recorded = channel.dvr_feed.is_some();
        let demuxed = channel.feed.is_some();

        if recorded {
            if capture == Capture::Recorded {
                captured.extend_from_slice(raw);
            }
            self.irq.raise_dvr(DvrEvent::Packet {
                channel: channel_id,
                data: Bytes::copy_from_slice(raw),
            });
        }
        if !demuxed || pkt.header.transport_error {
            return;
        }

        if let Some(pcr) = pkt.pcr {
            if self.has_feed(channel_id, |k| k == FeedKind::Pcr) {
                self.raise(
                    DrainEvent::Pcr {
                        channel: channel_id,
                        pcr,
                    },
                    stats,
                );
            }
        }
        if pkt.payload.is_empty() {
            return;
        }

        let mut units: Vec<Vec<u8>> = Vec::new();
        match kind {
            ChannelType::Section => {
                let assembler = self.engine.sections.entry(channel_id).or_default();
                assembler.push(
                    pkt.payload,
                    pkt.header.continuity_counter,
                    pkt.header.payload_unit_start,
                    |s| units.push(s.to_vec()),
                );
                for section in units {
                    self.queue_section(channel_id, &section, stats);
                }
            }
            ChannelType::Pes => {
                let pool = if pes_type.uses_subtitle_pool() {
                    PoolKind::Subtitle
                } else {
                    PoolKind::Pes
                };
                let limit = match pool {
                    PoolKind::Subtitle => self.pools.subtitle.slot_len(),
                    _ => self.pools.pes.slot_len(),
                };
                let assembler = self
                    .engine
                    .pes
                    .entry(channel_id)
                    .or_insert_with(|| PesAssembler::new(limit));
                assembler.push(pkt.payload, pkt.header.payload_unit_start, |u| {
                    units.push(u.to_vec())
                });
                for unit in units {
                    self.queue_unit(channel_id, pool, &unit, stats);
                }
            }
            ChannelType::Pcr => {}
        }
    }

    fn queue_section(&mut self, channel: ChannelId, section: &[u8], stats: &DemuxStats) {
        let kind = self.pools.section_pool(section.len());
        let origin = if kind == PoolKind::SmallSection {
            SectionOrigin::SmallSection
        } else {
            SectionOrigin::Hw
        };
        let Some(pool) = self.pools.get_mut(kind) else {
            return;
        };
        match pool.acquire(section.len()) {
            Ok(slot) => {
                pool.fill(&slot, section);
                self.raise(
                    DrainEvent::Section {
                        channel,
                        slot,
                        origin,
                    },
                    stats,
                );
            }
            Err(e) => {
                trace!("section of {} bytes dropped: {}", section.len(), e);
                record_drop(stats, kind, &e);
            }
        }
    }

    fn queue_unit(&mut self, channel: ChannelId, kind: PoolKind, unit: &[u8], stats: &DemuxStats) {
        let Some(pool) = self.pools.get_mut(kind) else {
            return;
        };
        match pool.acquire(unit.len()) {
            Ok(slot) => {
                pool.fill(&slot, unit);
                self.raise(DrainEvent::Pes { channel, slot }, stats);
            }
            Err(e) => {
                trace!("PES unit of {} bytes dropped: {}", unit.len(), e);
                record_drop(stats, kind, &e);
            }
        }
    }
}

fn record_drop(stats: &DemuxStats, kind: PoolKind, err: &DemuxError) {
    match err {
        DemuxError::ResourceExhausted(_) => stats.record_exhausted(kind),
        _ => stats.record_oversized(),
    }
}
