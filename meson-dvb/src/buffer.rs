//! Page-backed buffer pools shared with the demux hardware.
//!
//! A pool is one contiguous, page-rounded allocation split into fixed
//! slots. Slots are handed out as [`BufferSlot`] values: they are not
//! `Clone`, and [`BufferPool::release`] consumes them, so a slot cannot be
//! released twice. A watchdog reclaim bumps the slot generation; a handle
//! that survives a reclaim reads `None` and releases as a no-op.

use log::{trace, warn};
use meson_dvb_types::{DemuxError, Resource, MAX_SECTION_SIZE, SEC_BUF_BUSY_SIZE, SEC_BUF_COUNT};

use crate::config::DemuxConfig;

/// Allocation granularity of pool storage.
pub const PAGE_SIZE: usize = 4096;

/// Most slots one pool can index.
pub const MAX_POOL_SLOTS: usize = u16::MAX as usize;

/// Which pool a slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Section,
    Pes,
    /// Subtitle and teletext PES.
    Subtitle,
    SmallSection,
}

impl PoolKind {
    pub fn resource(self) -> Resource {
        match self {
            PoolKind::Section => Resource::SectionBuffer,
            PoolKind::Pes => Resource::PesBuffer,
            PoolKind::Subtitle => Resource::SubtitleBuffer,
            PoolKind::SmallSection => Resource::SmallSectionBuffer,
        }
    }

    pub fn index(self) -> usize {
        match self {
            PoolKind::Section => 0,
            PoolKind::Pes => 1,
            PoolKind::Subtitle => 2,
            PoolKind::SmallSection => 3,
        }
    }
}

/// Exclusive handle to one pool slot.
#[derive(Debug)]
#[must_use = "a buffer slot must be released back to its pool"]
pub struct BufferSlot {
    kind: PoolKind,
    index: u16,
    generation: u32,
}

impl BufferSlot {
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// Fixed-slot buffer pool (`aml_sec_buf` table).
#[derive(Debug)]
pub struct BufferPool {
    kind: PoolKind,
    base: u64,
    slot_len: usize,
    slot_count: usize,
    storage: Box<[u8]>,
    busy: Vec<u32>,
    lens: Vec<usize>,
    generations: Vec<u32>,
    ticks: Vec<u32>,
}

impl BufferPool {
    /// `base` is the hardware address of the first slot.
    pub fn new(kind: PoolKind, base: u64, slot_count: usize, slot_len: usize) -> Self {
        if slot_count > MAX_POOL_SLOTS {
            warn!("{:?} pool limited to {} of {} slots", kind, MAX_POOL_SLOTS, slot_count);
        }
        let slot_count = slot_count.min(MAX_POOL_SLOTS);
        let bytes = (slot_count * slot_len).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let words = slot_count.div_ceil(32);
        Self {
            kind,
            base,
            slot_len,
            slot_count,
            storage: vec![0u8; bytes].into_boxed_slice(),
            busy: vec![0; words],
            lens: vec![0; slot_count],
            generations: vec![0; slot_count],
            ticks: vec![0; slot_count],
        }
    }

    /// Section pool: `SEC_BUF_COUNT` slots of `MAX_SECTION_SIZE`.
    pub fn section(base: u64) -> Self {
        Self::new(PoolKind::Section, base, SEC_BUF_COUNT, MAX_SECTION_SIZE)
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.slot_count
    }

    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    /// Size of the page-rounded backing allocation.
    pub fn storage_len(&self) -> usize {
        self.storage.len()
    }

    pub fn busy_words(&self) -> &[u32] {
        &self.busy
    }

    pub fn is_busy(&self, index: usize) -> bool {
        index < self.slot_count && self.busy[index / 32] & (1 << (index % 32)) != 0
    }

    pub fn busy_count(&self) -> usize {
        self.busy.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Hardware address of slot `index`.
    pub fn addr(&self, index: usize) -> u64 {
        self.base + (index * self.slot_len) as u64
    }

    /// Take a free slot. Never blocks; exhaustion is an error.
    pub fn acquire(&mut self, size_hint: usize) -> Result<BufferSlot, DemuxError> {
        if size_hint > self.slot_len {
            return Err(DemuxError::InvalidState(format!(
                "{} byte unit exceeds {} slot size {}",
                size_hint,
                self.kind.resource(),
                self.slot_len
            )));
        }
        let index = (0..self.slot_count)
            .find(|&i| !self.is_busy(i))
            .ok_or(DemuxError::ResourceExhausted(self.kind.resource()))?;
        let handle_index = u16::try_from(index)
            .map_err(|_| DemuxError::ResourceExhausted(self.kind.resource()))?;

        self.busy[index / 32] |= 1 << (index % 32);
        self.ticks[index] = 0;
        self.lens[index] = 0;
        trace!("{:?} slot {} acquired @0x{:x}", self.kind, index, self.addr(index));
        Ok(BufferSlot {
            kind: self.kind,
            index: handle_index,
            generation: self.generations[index],
        })
    }

    fn owns(&self, slot: &BufferSlot) -> bool {
        slot.kind == self.kind
            && slot.index() < self.slot_count
            && self.generations[slot.index()] == slot.generation
            && self.is_busy(slot.index())
    }

    /// Copy a unit into the slot, as the hardware DMA would.
    pub fn fill(&mut self, slot: &BufferSlot, data: &[u8]) -> bool {
        if !self.owns(slot) || data.len() > self.slot_len {
            return false;
        }
        let start = slot.index() * self.slot_len;
        self.storage[start..start + data.len()].copy_from_slice(data);
        self.lens[slot.index()] = data.len();
        true
    }

    /// Contents of a live slot, `None` after a reclaim.
    pub fn read(&self, slot: &BufferSlot) -> Option<&[u8]> {
        if !self.owns(slot) {
            return None;
        }
        let start = slot.index() * self.slot_len;
        Some(&self.storage[start..start + self.lens[slot.index()]])
    }

    /// Return a slot. Releasing a reclaimed slot does nothing.
    pub fn release(&mut self, slot: BufferSlot) {
        if !self.owns(&slot) {
            trace!("{:?} slot {} already reclaimed", self.kind, slot.index);
            return;
        }
        self.free(slot.index());
    }

    fn free(&mut self, index: usize) {
        self.busy[index / 32] &= !(1 << (index % 32));
        self.generations[index] = self.generations[index].wrapping_add(1);
        self.ticks[index] = 0;
        self.lens[index] = 0;
    }

    /// Advance the watchdog counter of every busy slot and reclaim the ones
    /// above `threshold`. Returns the number reclaimed.
    pub fn tick(&mut self, threshold: u32) -> usize {
        let mut reclaimed = 0;
        for index in 0..self.slot_count {
            if !self.is_busy(index) {
                continue;
            }
            self.ticks[index] += 1;
            if self.ticks[index] > threshold {
                warn!(
                    "{:?} slot {} held for {} ticks, reclaiming",
                    self.kind, index, self.ticks[index]
                );
                self.free(index);
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Reclaim every busy slot.
    pub fn reclaim_all(&mut self) -> usize {
        let mut reclaimed = 0;
        for index in 0..self.slot_count {
            if self.is_busy(index) {
                self.free(index);
                reclaimed += 1;
            }
        }
        reclaimed
    }
}

/// The pools of one demux engine.
#[derive(Debug)]
pub struct DemuxPools {
    pub section: BufferPool,
    pub pes: BufferPool,
    pub subtitle: BufferPool,
    pub small_section: Option<BufferPool>,
    /// Largest section routed to the small-section pool.
    pub small_section_max: usize,
}

impl DemuxPools {
    /// Lay the pools out back to back starting at `base`.
    pub fn new(base: u64, config: &DemuxConfig) -> Self {
        let section = BufferPool::new(
            PoolKind::Section,
            base,
            config.section_buf_count.min(SEC_BUF_BUSY_SIZE * 32),
            MAX_SECTION_SIZE,
        );
        let mut next = base + section.storage_len() as u64;
        let pes = BufferPool::new(PoolKind::Pes, next, config.pes_buf_count, config.pes_buf_size);
        next += pes.storage_len() as u64;
        let subtitle = BufferPool::new(
            PoolKind::Subtitle,
            next,
            config.sub_buf_count,
            config.sub_buf_size,
        );
        next += subtitle.storage_len() as u64;

        let ss = &config.small_section;
        let small_section = (ss.enable && ss.max_len > 0).then(|| {
            BufferPool::new(PoolKind::SmallSection, next, ss.bufsize / ss.max_len, ss.max_len)
        });

        Self {
            section,
            pes,
            subtitle,
            small_section,
            small_section_max: if ss.enable { ss.max_len } else { 0 },
        }
    }

    pub fn get_mut(&mut self, kind: PoolKind) -> Option<&mut BufferPool> {
        match kind {
            PoolKind::Section => Some(&mut self.section),
            PoolKind::Pes => Some(&mut self.pes),
            PoolKind::Subtitle => Some(&mut self.subtitle),
            PoolKind::SmallSection => self.small_section.as_mut(),
        }
    }

    /// Pool for a section of `len` bytes.
    pub fn section_pool(&self, len: usize) -> PoolKind {
        if self.small_section.is_some() && len <= self.small_section_max {
            PoolKind::SmallSection
        } else {
            PoolKind::Section
        }
    }

    pub fn release(&mut self, slot: BufferSlot) {
        if let Some(pool) = self.get_mut(slot.kind()) {
            pool.release(slot);
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BufferPool> {
        [&mut self.section, &mut self.pes, &mut self.subtitle]
            .into_iter()
            .chain(self.small_section.as_mut())
    }

    pub fn tick(&mut self, threshold: u32) -> usize {
        self.iter_mut().map(|p| p.tick(threshold)).sum()
    }

    pub fn reclaim_all(&mut self) -> usize {
        self.iter_mut().map(|p| p.reclaim_all()).sum()
    }

    pub fn busy_count(&self) -> usize {
        self.section.busy_count()
            + self.pes.busy_count()
            + self.subtitle.busy_count()
            + self.small_section.as_ref().map_or(0, |p| p.busy_count())
    }
}
