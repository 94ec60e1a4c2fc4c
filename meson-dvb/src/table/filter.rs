//! Section filter table and the DVB section matching rule.

use log::debug;
use meson_dvb_types::{DemuxError, Resource, FILTER_COUNT, FILTER_LEN};

use super::channel::ChannelTable;
use super::slot::{Lookup, SlotTable};
use super::{ChannelId, FeedId, FilterId};

/// Size of the DVB user-space section filter (`DMX_FILTER_SIZE`).
pub const DMX_FILTER_SIZE: usize = 16;

/// Overall accept/reject polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Polarity {
    #[default]
    Normal,
    /// Deliver sections the pattern rejects.
    Inverted,
}

/// Section byte compared by pattern position `i`.
///
/// Position 0 is the table_id; the two section_length bytes are never
/// compared, so position 1 maps to section byte 3.
fn section_offset(i: usize) -> usize {
    if i == 0 {
        0
    } else {
        i + 2
    }
}

/// Byte pattern of a section filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterPattern {
    pub value: [u8; FILTER_LEN],
    pub mask: [u8; FILTER_LEN],
    /// Bits set here must differ somewhere instead of being equal.
    pub mask_negate: [u8; FILTER_LEN],
    pub polarity: Polarity,
}

impl Default for FilterPattern {
    /// Matches every section.
    fn default() -> Self {
        Self {
            value: [0; FILTER_LEN],
            mask: [0; FILTER_LEN],
            mask_negate: [0; FILTER_LEN],
            polarity: Polarity::Normal,
        }
    }
}

impl FilterPattern {
    pub fn new(
        value: [u8; FILTER_LEN],
        mask: [u8; FILTER_LEN],
        mask_negate: [u8; FILTER_LEN],
        polarity: Polarity,
    ) -> Self {
        Self {
            value,
            mask,
            mask_negate,
            polarity,
        }
    }

    /// Pattern accepting a single table_id.
    pub fn table_id(table_id: u8) -> Self {
        let mut pattern = Self::default();
        pattern.value[0] = table_id;
        pattern.mask[0] = 0xFF;
        pattern
    }

    /// Convert a DVB user filter, where a `mode` bit of 1 means "must equal"
    /// and 0 means "must differ". The last user byte has no hardware
    /// position and is dropped.
    pub fn from_dmx_filter(
        filter: &[u8; DMX_FILTER_SIZE],
        mask: &[u8; DMX_FILTER_SIZE],
        mode: &[u8; DMX_FILTER_SIZE],
    ) -> Self {
        let mut pattern = Self::default();
        for i in 0..FILTER_LEN {
            pattern.value[i] = filter[i];
            pattern.mask[i] = mask[i];
            pattern.mask_negate[i] = mask[i] & !mode[i];
        }
        pattern
    }

    fn mode_eq(&self) -> [u8; FILTER_LEN] {
        std::array::from_fn(|i| self.mask[i] & !self.mask_negate[i])
    }

    fn mode_neq(&self) -> [u8; FILTER_LEN] {
        std::array::from_fn(|i| self.mask[i] & self.mask_negate[i])
    }

    /// Evaluate the pattern against a complete section.
    pub fn matches(&self, section: &[u8]) -> bool {
        let mode_neq = self.mode_neq();
        let neq = mode_neq.iter().any(|&b| b != 0);
        match_section(&self.value, &self.mode_eq(), &mode_neq, neq, self.polarity, section)
    }
}

fn match_section(
    value: &[u8; FILTER_LEN],
    mode_eq: &[u8; FILTER_LEN],
    mode_neq: &[u8; FILTER_LEN],
    neq: bool,
    polarity: Polarity,
    section: &[u8],
) -> bool {
    let mut accepted = true;
    let mut differs = 0u8;

    for i in 0..FILTER_LEN {
        let used = mode_eq[i] | mode_neq[i];
        let byte = match section.get(section_offset(i)) {
            Some(&b) => b,
            None if used != 0 => return false,
            None => continue,
        };
        let xor = value[i] ^ byte;
        if mode_eq[i] & xor != 0 {
            accepted = false;
            break;
        }
        differs |= mode_neq[i] & xor;
    }

    if accepted && neq && differs == 0 {
        accepted = false;
    }

    match polarity {
        Polarity::Normal => accepted,
        Polarity::Inverted => !accepted,
    }
}

/// Where a filter is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterPath {
    Hardware,
    Software,
}

/// An attached section filter.
#[derive(Debug, Clone)]
pub struct Filter {
    pub channel: ChannelId,
    pub feed: FeedId,
    /// Opaque handle of the framework's filter, echoed on delivery.
    pub handle: u64,
    pub path: FilterPath,
    pub pattern: FilterPattern,
    maskandmode: [u8; FILTER_LEN],
    maskandnotmode: [u8; FILTER_LEN],
    neq: bool,
}

impl Filter {
    fn new(
        channel: ChannelId,
        feed: FeedId,
        handle: u64,
        path: FilterPath,
        pattern: FilterPattern,
    ) -> Self {
        let maskandnotmode = pattern.mode_neq();
        Self {
            channel,
            feed,
            handle,
            path,
            pattern,
            maskandmode: pattern.mode_eq(),
            neq: maskandnotmode.iter().any(|&b| b != 0),
            maskandnotmode,
        }
    }

    /// Whether the pattern contains "must differ" positions.
    pub fn neq(&self) -> bool {
        self.neq
    }

    pub fn matches(&self, section: &[u8]) -> bool {
        match_section(
            &self.pattern.value,
            &self.maskandmode,
            &self.maskandnotmode,
            self.neq,
            self.pattern.polarity,
            section,
        )
    }
}

/// Filter table with separate hardware and software budgets.
#[derive(Debug)]
pub struct FilterTable {
    slots: SlotTable<Filter>,
    hw_capacity: usize,
    sw_capacity: usize,
    hw_used: usize,
    sw_used: usize,
}

impl FilterTable {
    pub fn new(sw_capacity: usize) -> Self {
        Self::with_capacity(FILTER_COUNT, sw_capacity)
    }

    pub fn with_capacity(hw_capacity: usize, sw_capacity: usize) -> Self {
        Self {
            slots: SlotTable::with_capacity(hw_capacity + sw_capacity),
            hw_capacity,
            sw_capacity,
            hw_used: 0,
            sw_used: 0,
        }
    }

    /// Attach a hardware filter to an in-use channel.
    pub fn attach(
        &mut self,
        channels: &mut ChannelTable,
        channel: ChannelId,
        pattern: FilterPattern,
        feed: FeedId,
        handle: u64,
    ) -> Result<FilterId, DemuxError> {
        self.attach_on(channels, channel, pattern, feed, handle, FilterPath::Hardware)
    }

    /// Attach a filter evaluated by the software fallback path.
    pub fn attach_software(
        &mut self,
        channels: &mut ChannelTable,
        channel: ChannelId,
        pattern: FilterPattern,
        feed: FeedId,
        handle: u64,
    ) -> Result<FilterId, DemuxError> {
        self.attach_on(channels, channel, pattern, feed, handle, FilterPath::Software)
    }

    fn attach_on(
        &mut self,
        channels: &mut ChannelTable,
        channel_id: ChannelId,
        pattern: FilterPattern,
        feed: FeedId,
        handle: u64,
        path: FilterPath,
    ) -> Result<FilterId, DemuxError> {
        let channel = channels.get_mut(channel_id).ok_or(DemuxError::InvalidChannel)?;
        let (used, capacity, resource) = match path {
            FilterPath::Hardware => (self.hw_used, self.hw_capacity, Resource::Filter),
            FilterPath::Software => (self.sw_used, self.sw_capacity, Resource::SoftwareFilter),
        };
        if used >= capacity {
            return Err(DemuxError::ResourceExhausted(resource));
        }
        let key = self
            .slots
            .insert(Filter::new(channel_id, feed, handle, path, pattern))
            .ok_or(DemuxError::ResourceExhausted(resource))?;

        match path {
            FilterPath::Hardware => {
                self.hw_used += 1;
                channel.filter_count += 1;
            }
            FilterPath::Software => {
                self.sw_used += 1;
                channel.sw_filter_count += 1;
            }
        }
        let id = FilterId(key);
        debug!(
            "filter {} attached to channel {} (pid 0x{:04X}, {:?})",
            id.index(),
            channel_id.index(),
            channel.pid,
            path
        );
        Ok(id)
    }

    /// Detach a filter. A second detach of the same id is `InvalidState`.
    pub fn detach(
        &mut self,
        channels: &mut ChannelTable,
        id: FilterId,
    ) -> Result<Filter, DemuxError> {
        let filter = self.slots.remove(id.0).map_err(|e| match e {
            Lookup::OutOfRange => DemuxError::InvalidFilter,
            Lookup::Stale => DemuxError::InvalidState(format!("filter {} not attached", id.index())),
        })?;

        let channel = channels.get_mut(filter.channel);
        match filter.path {
            FilterPath::Hardware => {
                self.hw_used -= 1;
                if let Some(channel) = channel {
                    channel.filter_count = channel.filter_count.saturating_sub(1);
                }
            }
            FilterPath::Software => {
                self.sw_used -= 1;
                if let Some(channel) = channel {
                    channel.sw_filter_count = channel.sw_filter_count.saturating_sub(1);
                }
            }
        }
        Ok(filter)
    }

    /// Detach every filter owned by `feed`.
    pub fn detach_feed(&mut self, channels: &mut ChannelTable, feed: FeedId) -> Vec<Filter> {
        let ids: Vec<FilterId> = self
            .slots
            .iter()
            .filter(|(_, f)| f.feed == feed)
            .map(|(k, _)| FilterId(k))
            .collect();
        ids.into_iter()
            .filter_map(|id| self.detach(channels, id).ok())
            .collect()
    }

    pub fn get(&self, id: FilterId) -> Option<&Filter> {
        self.slots.get(id.0)
    }

    /// Filters of `channel` evaluated on `path`, in slot order.
    pub fn for_channel(
        &self,
        channel: ChannelId,
        path: FilterPath,
    ) -> impl Iterator<Item = (FilterId, &Filter)> {
        self.slots
            .iter()
            .filter(move |(_, f)| f.channel == channel && f.path == path)
            .map(|(k, f)| (FilterId(k), f))
    }

    pub fn hw_count(&self) -> usize {
        self.hw_used
    }

    pub fn sw_count(&self) -> usize {
        self.sw_used
    }

    pub fn hw_is_full(&self) -> bool {
        self.hw_used >= self.hw_capacity
    }
}
