//! Channel table: PID to channel slot mapping.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use log::{debug, trace};
use meson_dvb_types::{ChannelType, DemuxError, PesType, Resource, CHANNEL_COUNT};
use serde::Deserialize;

use super::slot::{Lookup, SlotTable};
use super::{ChannelId, FeedId};

/// Highest valid PID.
const MAX_PID: u16 = 0x1FFF;

/// A PID stream being demultiplexed.
#[derive(Debug, Clone)]
pub struct Channel {
    pub kind: ChannelType,
    pub pes_type: PesType,
    pub pid: u16,
    refs: u32,
    /// Hardware filters attached.
    pub filter_count: u32,
    /// Software-fallback filters attached.
    pub sw_filter_count: u32,
    /// Owning demux feed.
    pub feed: Option<FeedId>,
    /// DVR mirror feed.
    pub dvr_feed: Option<FeedId>,
    /// Last time a packet with payload arrived for this PID.
    pub last_activity: Instant,
    /// Latched by the watchdog when a stall triggered a reset; cleared by data.
    pub stalled: bool,
    /// Not subject to timeout monitoring until this instant.
    pub watch_exempt_until: Option<Instant>,
}

impl Channel {
    fn new(kind: ChannelType, pes_type: PesType, pid: u16, now: Instant) -> Self {
        Self {
            kind,
            pes_type,
            pid,
            refs: 1,
            filter_count: 0,
            sw_filter_count: 0,
            feed: None,
            dvr_feed: None,
            last_activity: now,
            stalled: false,
            watch_exempt_until: None,
        }
    }

    /// Number of consumers sharing this channel.
    pub fn refs(&self) -> u32 {
        self.refs
    }

    /// Whether the timeout policy applies to this channel right now.
    pub fn is_watched(&self, ch_disable: u32, now: Instant) -> bool {
        if ch_disable & self.pes_type.bit() == 0 || self.stalled {
            return false;
        }
        match self.watch_exempt_until {
            Some(until) => now >= until,
            None => true,
        }
    }

    /// Record data arrival.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
        self.stalled = false;
    }
}

/// What the channel-ignore memory does when a remembered PID comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IgnoreMode {
    /// Nothing is remembered.
    Disabled,
    /// Allocate, but keep the channel out of timeout monitoring for the window.
    #[default]
    Unwatched,
    /// Refuse the allocation for the window.
    Suppress,
}

/// Channel-ignore policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IgnorePolicy {
    pub mode: IgnoreMode,
    pub window: Duration,
}

impl Default for IgnorePolicy {
    fn default() -> Self {
        Self {
            mode: IgnoreMode::Unwatched,
            window: Duration::from_secs(2),
        }
    }
}

/// Snapshot of a torn-down channel's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelIgnore {
    pub kind: ChannelType,
    pub pes_type: PesType,
    pub pid: u16,
    pub recorded_at: Instant,
}

/// Bounded list of [`ChannelIgnore`] entries, oldest evicted first.
#[derive(Debug, Default)]
pub struct ChannelIgnoreList {
    entries: VecDeque<ChannelIgnore>,
}

impl ChannelIgnoreList {
    pub fn record(&mut self, entry: ChannelIgnore) {
        self.entries.retain(|e| e.pid != entry.pid);
        if self.entries.len() >= CHANNEL_COUNT {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Drop entries older than `window`.
    pub fn purge(&mut self, now: Instant, window: Duration) {
        self.entries
            .retain(|e| now.saturating_duration_since(e.recorded_at) < window);
    }

    pub fn find(&self, pid: u16) -> Option<&ChannelIgnore> {
        self.entries.iter().find(|e| e.pid == pid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelIgnore> {
        self.entries.iter()
    }
}

/// Outcome of [`ChannelTable::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// A free slot was taken; the hardware must be armed for it.
    New(ChannelId),
    /// The PID already had a channel; its reference count was raised.
    Shared(ChannelId),
}

impl Allocation {
    pub fn id(self) -> ChannelId {
        match self {
            Allocation::New(id) | Allocation::Shared(id) => id,
        }
    }
}

/// Outcome of [`ChannelTable::release`].
#[derive(Debug, Clone)]
pub enum Release {
    /// Other consumers remain.
    Shared { remaining: u32 },
    /// Last reference dropped; the slot is free.
    Freed(Channel),
}

/// Fixed-capacity channel table.
#[derive(Debug)]
pub struct ChannelTable {
    slots: SlotTable<Channel>,
    by_pid: HashMap<u16, ChannelId>,
    ignore: ChannelIgnoreList,
    policy: IgnorePolicy,
}

impl ChannelTable {
    pub fn new(policy: IgnorePolicy) -> Self {
        Self::with_capacity(CHANNEL_COUNT, policy)
    }

    pub fn with_capacity(capacity: usize, policy: IgnorePolicy) -> Self {
        Self {
            slots: SlotTable::with_capacity(capacity),
            by_pid: HashMap::new(),
            ignore: ChannelIgnoreList::default(),
            policy,
        }
    }

    /// Allocate a channel for `pid`, sharing an existing one if present.
    pub fn allocate(
        &mut self,
        kind: ChannelType,
        pes_type: PesType,
        pid: u16,
        now: Instant,
    ) -> Result<Allocation, DemuxError> {
        if pid > MAX_PID {
            return Err(DemuxError::InvalidState(format!("PID 0x{:X} out of range", pid)));
        }

        if let Some(&id) = self.by_pid.get(&pid) {
            if let Some(channel) = self.slots.get_mut(id.0) {
                channel.refs += 1;
                trace!("channel {} pid 0x{:04X} shared, refs={}", id.index(), pid, channel.refs);
                return Ok(Allocation::Shared(id));
            }
        }

        let mut exempt_until = None;
        if self.policy.mode != IgnoreMode::Disabled {
            self.ignore.purge(now, self.policy.window);
            if let Some(entry) = self.ignore.find(pid) {
                match self.policy.mode {
                    IgnoreMode::Suppress => {
                        debug!("pid 0x{:04X} suppressed by channel-ignore list", pid);
                        return Err(DemuxError::Suppressed { pid });
                    }
                    IgnoreMode::Unwatched => {
                        exempt_until = Some(entry.recorded_at + self.policy.window);
                    }
                    IgnoreMode::Disabled => {}
                }
            }
        }

        let mut channel = Channel::new(kind, pes_type, pid, now);
        channel.watch_exempt_until = exempt_until;
        let key = self
            .slots
            .insert(channel)
            .ok_or(DemuxError::ResourceExhausted(Resource::Channel))?;
        let id = ChannelId(key);
        self.by_pid.insert(pid, id);
        debug!("channel {} allocated for pid 0x{:04X} ({:?}/{:?})", id.index(), pid, kind, pes_type);
        Ok(Allocation::New(id))
    }

    /// Drop one reference. At zero the slot is freed and, when `ch_disable`
    /// covers the channel's subtype, its identity is remembered.
    pub fn release(
        &mut self,
        id: ChannelId,
        ch_disable: u32,
        now: Instant,
    ) -> Result<Release, DemuxError> {
        let channel = self.slots.get_mut(id.0).ok_or(DemuxError::InvalidChannel)?;
        if channel.refs > 1 {
            channel.refs -= 1;
            return Ok(Release::Shared {
                remaining: channel.refs,
            });
        }

        let channel = self.slots.remove(id.0).map_err(|_| DemuxError::InvalidChannel)?;
        self.by_pid.remove(&channel.pid);
        if ch_disable & channel.pes_type.bit() != 0 {
            self.remember(&channel, now);
        }
        debug!("channel {} for pid 0x{:04X} freed", id.index(), channel.pid);
        Ok(Release::Freed(channel))
    }

    /// Snapshot a channel identity into the ignore list.
    pub fn remember(&mut self, channel: &Channel, now: Instant) {
        if self.policy.mode == IgnoreMode::Disabled {
            return;
        }
        self.ignore.record(ChannelIgnore {
            kind: channel.kind,
            pes_type: channel.pes_type,
            pid: channel.pid,
            recorded_at: now,
        });
    }

    pub fn check(&self, id: ChannelId) -> Result<(), Lookup> {
        self.slots.check(id.0)
    }

    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        self.slots.get(id.0)
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.slots.get_mut(id.0)
    }

    pub fn lookup_pid(&self, pid: u16) -> Option<ChannelId> {
        self.by_pid.get(&pid).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChannelId, &Channel)> {
        self.slots.iter().map(|(k, c)| (ChannelId(k), c))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ChannelId, &mut Channel)> {
        self.slots.iter_mut().map(|(k, c)| (ChannelId(k), c))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub fn ignore_list(&self) -> &ChannelIgnoreList {
        &self.ignore
    }

    pub fn policy(&self) -> IgnorePolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meson_dvb_types::DTO_CHDIS_VAS;

    fn table() -> ChannelTable {
        ChannelTable::new(IgnorePolicy::default())
    }

    #[test]
    fn test_same_pid_shares_one_slot() {
        let mut t = table();
        let now = Instant::now();
        let first = t.allocate(ChannelType::Section, PesType::Other, 0x12, now).unwrap();
        assert!(matches!(first, Allocation::New(_)));

        for _ in 0..4 {
            let again = t.allocate(ChannelType::Section, PesType::Other, 0x12, now).unwrap();
            assert_eq!(again, Allocation::Shared(first.id()));
        }
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(first.id()).unwrap().refs(), 5);

        for remaining in (1..5).rev() {
            match t.release(first.id(), 0, now).unwrap() {
                Release::Shared { remaining: r } => assert_eq!(r, remaining),
                Release::Freed(_) => panic!("freed too early"),
            }
            assert_eq!(t.len(), 1);
        }
        assert!(matches!(t.release(first.id(), 0, now).unwrap(), Release::Freed(_)));
        assert!(t.is_empty());
        assert_eq!(t.lookup_pid(0x12), None);
    }

    #[test]
    fn test_exhaustion() {
        let mut t = table();
        let now = Instant::now();
        for pid in 0..CHANNEL_COUNT as u16 {
            t.allocate(ChannelType::Section, PesType::Other, 0x100 + pid, now).unwrap();
        }
        let err = t.allocate(ChannelType::Section, PesType::Other, 0x500, now).unwrap_err();
        assert_eq!(err, DemuxError::ResourceExhausted(Resource::Channel));

        // Existing PIDs still share.
        assert!(t.allocate(ChannelType::Section, PesType::Other, 0x100, now).is_ok());
    }

    #[test]
    fn test_release_stale_id() {
        let mut t = table();
        let now = Instant::now();
        let id = t.allocate(ChannelType::Pes, PesType::Video, 0x100, now).unwrap().id();
        t.release(id, 0, now).unwrap();
        assert_eq!(t.release(id, 0, now).unwrap_err(), DemuxError::InvalidChannel);
    }

    #[test]
    fn test_release_records_ignore_for_masked_subtype() {
        let mut t = table();
        let now = Instant::now();
        let video = t.allocate(ChannelType::Pes, PesType::Video, 0x100, now).unwrap().id();
        let other = t.allocate(ChannelType::Pes, PesType::Other, 0x200, now).unwrap().id();

        t.release(video, DTO_CHDIS_VAS, now).unwrap();
        t.release(other, DTO_CHDIS_VAS, now).unwrap();

        assert_eq!(t.ignore_list().len(), 1);
        assert_eq!(t.ignore_list().find(0x100).unwrap().pes_type, PesType::Video);
    }

    #[test]
    fn test_unwatched_reallocation_within_window() {
        let mut t = table();
        let now = Instant::now();
        let id = t.allocate(ChannelType::Pes, PesType::Audio, 0x101, now).unwrap().id();
        t.release(id, DTO_CHDIS_VAS, now).unwrap();

        let later = now + Duration::from_millis(500);
        let id = t.allocate(ChannelType::Pes, PesType::Audio, 0x101, later).unwrap().id();
        let channel = t.get(id).unwrap();
        assert!(!channel.is_watched(DTO_CHDIS_VAS, later));
        assert!(channel.is_watched(DTO_CHDIS_VAS, now + Duration::from_secs(3)));
    }

    #[test]
    fn test_suppress_mode() {
        let mut t = ChannelTable::new(IgnorePolicy {
            mode: IgnoreMode::Suppress,
            window: Duration::from_secs(1),
        });
        let now = Instant::now();
        let id = t.allocate(ChannelType::Pes, PesType::Video, 0x100, now).unwrap().id();
        t.release(id, DTO_CHDIS_VAS, now).unwrap();

        let err = t
            .allocate(ChannelType::Pes, PesType::Video, 0x100, now + Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err, DemuxError::Suppressed { pid: 0x100 });

        // Window elapsed.
        assert!(t
            .allocate(ChannelType::Pes, PesType::Video, 0x100, now + Duration::from_secs(2))
            .is_ok());
    }

    #[test]
    fn test_ignore_list_bounded() {
        let mut list = ChannelIgnoreList::default();
        let now = Instant::now();
        for pid in 0..(CHANNEL_COUNT as u16 + 5) {
            list.record(ChannelIgnore {
                kind: ChannelType::Pes,
                pes_type: PesType::Video,
                pid,
                recorded_at: now,
            });
        }
        assert_eq!(list.len(), CHANNEL_COUNT);
        assert!(list.find(0).is_none());
        assert!(list.find(CHANNEL_COUNT as u16 + 4).is_some());
    }

    #[test]
    fn test_pid_range() {
        let mut t = table();
        assert!(t
            .allocate(ChannelType::Section, PesType::Other, 0x2000, Instant::now())
            .is_err());
    }
}
