//! Per-instance monotonic counters.

use std::sync::atomic::{AtomicU64, Ordering};

use meson_dvb_types::{SectionOrigin, SEC_CNT_MAX};
use serde::Serialize;

use crate::buffer::PoolKind;

/// Counters of one demux engine. Updated from the engine, the drain workers
/// and the watchdog without locking.
#[derive(Debug, Default)]
pub struct DemuxStats {
    sections_seen: [AtomicU64; SEC_CNT_MAX],
    sections_matched: [AtomicU64; SEC_CNT_MAX],
    crc_fail: [AtomicU64; SEC_CNT_MAX],
    /// Units dropped because their pool was exhausted, per pool.
    pool_exhausted: [AtomicU64; 4],
    /// Units larger than a slot of their pool.
    oversized: AtomicU64,
    stale_dropped: AtomicU64,
    pes_units: AtomicU64,
    pcr_units: AtomicU64,
    dvr_bytes: AtomicU64,
    interrupts: AtomicU64,
    resets: AtomicU64,
    timeouts: AtomicU64,
    crc_storms: AtomicU64,
    leaked_reclaimed: AtomicU64,
    retunes: AtomicU64,
    packets: AtomicU64,
    sync_lost: AtomicU64,
}

impl DemuxStats {
    pub fn record_seen(&self, origin: SectionOrigin) {
        self.sections_seen[origin.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_matched(&self, origin: SectionOrigin) {
        self.sections_matched[origin.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_crc_fail(&self, origin: SectionOrigin) {
        self.crc_fail[origin.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exhausted(&self, pool: PoolKind) {
        self.pool_exhausted[pool.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_oversized(&self) {
        self.oversized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pes(&self) {
        self.pes_units.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pcr(&self) {
        self.pcr_units.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dvr(&self, bytes: usize) {
        self.dvr_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeouts(&self, channels: usize) {
        self.timeouts.fetch_add(channels as u64, Ordering::Relaxed);
    }

    pub fn record_crc_storm(&self) {
        self.crc_storms.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_leaked(&self, count: usize) {
        self.leaked_reclaimed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_retune(&self) {
        self.retunes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_packet(&self) {
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync_lost(&self, bytes: usize) {
        self.sync_lost.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn matched(&self, origin: SectionOrigin) -> u64 {
        self.sections_matched[origin.index()].load(Ordering::Relaxed)
    }

    pub fn seen(&self, origin: SectionOrigin) -> u64 {
        self.sections_seen[origin.index()].load(Ordering::Relaxed)
    }

    pub fn crc_failed(&self, origin: SectionOrigin) -> u64 {
        self.crc_fail[origin.index()].load(Ordering::Relaxed)
    }

    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    pub fn stale_dropped(&self) -> u64 {
        self.stale_dropped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let per_origin = |arr: &[AtomicU64; SEC_CNT_MAX]| OriginCounts {
            hw: load(&arr[SectionOrigin::Hw.index()]),
            sw: load(&arr[SectionOrigin::Sw.index()]),
            small_section: load(&arr[SectionOrigin::SmallSection.index()]),
        };
        StatsSnapshot {
            sections_seen: per_origin(&self.sections_seen),
            sections_matched: per_origin(&self.sections_matched),
            crc_fail: per_origin(&self.crc_fail),
            dropped_section: load(&self.pool_exhausted[PoolKind::Section.index()]),
            dropped_pes: load(&self.pool_exhausted[PoolKind::Pes.index()]),
            dropped_subtitle: load(&self.pool_exhausted[PoolKind::Subtitle.index()]),
            dropped_small_section: load(&self.pool_exhausted[PoolKind::SmallSection.index()]),
            dropped_oversized: load(&self.oversized),
            stale_dropped: load(&self.stale_dropped),
            pes_units: load(&self.pes_units),
            pcr_units: load(&self.pcr_units),
            dvr_bytes: load(&self.dvr_bytes),
            interrupts: load(&self.interrupts),
            resets: load(&self.resets),
            timeouts: load(&self.timeouts),
            crc_storms: load(&self.crc_storms),
            leaked_reclaimed: load(&self.leaked_reclaimed),
            retunes: load(&self.retunes),
            packets: load(&self.packets),
            sync_lost_bytes: load(&self.sync_lost),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OriginCounts {
    pub hw: u64,
    pub sw: u64,
    pub small_section: u64,
}

/// Point-in-time copy of [`DemuxStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub sections_seen: OriginCounts,
    pub sections_matched: OriginCounts,
    pub crc_fail: OriginCounts,
    pub dropped_section: u64,
    pub dropped_pes: u64,
    pub dropped_subtitle: u64,
    pub dropped_small_section: u64,
    pub dropped_oversized: u64,
    pub stale_dropped: u64,
    pub pes_units: u64,
    pub pcr_units: u64,
    pub dvr_bytes: u64,
    pub interrupts: u64,
    pub resets: u64,
    pub timeouts: u64,
    pub crc_storms: u64,
    pub leaked_reclaimed: u64,
    pub retunes: u64,
    pub packets: u64,
    pub sync_lost_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_split() {
        let stats = DemuxStats::default();
        stats.record_seen(SectionOrigin::Hw);
        stats.record_matched(SectionOrigin::Hw);
        stats.record_seen(SectionOrigin::Sw);
        stats.record_crc_fail(SectionOrigin::SmallSection);
        stats.record_exhausted(PoolKind::Pes);

        let snap = stats.snapshot();
        assert_eq!(snap.sections_seen.hw, 1);
        assert_eq!(snap.sections_seen.sw, 1);
        assert_eq!(snap.sections_matched.sw, 0);
        assert_eq!(snap.crc_fail.small_section, 1);
        assert_eq!(snap.dropped_pes, 1);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["sections_matched"]["hw"], 1);
    }
}
