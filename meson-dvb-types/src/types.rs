//! Constants, identifiers and source enums shared by the demux core.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DemuxError;

/// Number of physical TS inputs.
pub const TS_IN_COUNT: usize = 3;
/// Number of serial-to-parallel converters.
pub const S2P_COUNT: usize = 2;
/// Number of hardware demux engines.
pub const DMX_DEV_COUNT: usize = 3;
/// Channel (PID) slots per engine.
pub const CHANNEL_COUNT: usize = 31;
/// Hardware section filters per engine.
pub const FILTER_COUNT: usize = 31;
/// Section filter pattern length in bytes.
pub const FILTER_LEN: usize = 15;
/// Section buffer groups.
pub const SEC_BUF_GRP_COUNT: usize = 4;
/// Words in the section busy bitmap.
pub const SEC_BUF_BUSY_SIZE: usize = 4;
/// Section buffers per engine.
pub const SEC_BUF_COUNT: usize = SEC_BUF_GRP_COUNT * 8;
/// Number of async capture FIFOs.
pub const ASYNCFIFO_COUNT: usize = 2;

/// Default small-section buffer size (16KB).
pub const SS_BUFSIZE_DEF: usize = 16 * 4 * 256;
/// Default channel inactivity timeout in milliseconds.
pub const DTO_TIMEOUT_DEF_MS: u64 = 500;
/// Default software filter ring buffer size.
pub const SF_BUFFER_SIZE: usize = 10 * 188 * 1024;

/// TS packet size.
pub const TS_PACKET_SIZE: usize = 188;
/// TS sync byte.
pub const SYNC_BYTE: u8 = 0x47;
/// Largest PSI section (3 header bytes + 4093 bytes of body).
pub const MAX_SECTION_SIZE: usize = 4096;

/// Hardware demux engine index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DmxId(u8);

impl DmxId {
    /// Create an id, checking it addresses an existing engine.
    pub fn new(index: usize) -> Result<Self, DemuxError> {
        if index < DMX_DEV_COUNT {
            Ok(Self(index as u8))
        } else {
            Err(DemuxError::InvalidSource(format!("demux {} out of range", index)))
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// All engine ids in order.
    pub fn all() -> impl Iterator<Item = DmxId> {
        (0..DMX_DEV_COUNT as u8).map(DmxId)
    }
}

impl fmt::Display for DmxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dmx{}", self.0)
    }
}

/// Async FIFO index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AfifoId(u8);

impl AfifoId {
    pub fn new(index: usize) -> Result<Self, DemuxError> {
        if index < ASYNCFIFO_COUNT {
            Ok(Self(index as u8))
        } else {
            Err(DemuxError::InvalidSource(format!("async fifo {} out of range", index)))
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn all() -> impl Iterator<Item = AfifoId> {
        (0..ASYNCFIFO_COUNT as u8).map(AfifoId)
    }
}

impl fmt::Display for AfifoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "afifo{}", self.0)
    }
}

/// Hardware-level TS source feeding a demux engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TsSource {
    /// Parallel input 0.
    Ts0,
    Ts1,
    Ts2,
    /// Serial input through S2P converter 0.
    STs0,
    STs1,
    STs2,
    /// Memory (host) input.
    Hiu,
    /// Cascade from demux engine 0.
    Dmx0,
    Dmx1,
    Dmx2,
}

impl TsSource {
    /// Parallel input `n`.
    pub fn parallel(n: usize) -> Option<Self> {
        [TsSource::Ts0, TsSource::Ts1, TsSource::Ts2].get(n).copied()
    }

    /// Serial input through S2P converter `n`.
    pub fn serial(n: usize) -> Option<Self> {
        [TsSource::STs0, TsSource::STs1, TsSource::STs2].get(n).copied()
    }

    /// Cascade from demux engine `id`.
    pub fn cascade(id: DmxId) -> Self {
        match id.index() {
            0 => TsSource::Dmx0,
            1 => TsSource::Dmx1,
            _ => TsSource::Dmx2,
        }
    }

    /// Whether the source reaches the engine through an S2P converter.
    pub fn is_serial(self) -> bool {
        matches!(self, TsSource::STs0 | TsSource::STs1 | TsSource::STs2)
    }

    /// Physical input or converter index for `Ts*`/`STs*` sources.
    pub fn port_index(self) -> Option<usize> {
        match self {
            TsSource::Ts0 | TsSource::STs0 => Some(0),
            TsSource::Ts1 | TsSource::STs1 => Some(1),
            TsSource::Ts2 | TsSource::STs2 => Some(2),
            _ => None,
        }
    }

    /// Upstream engine for `Dmx*` sources.
    pub fn cascade_dmx(self) -> Option<DmxId> {
        match self {
            TsSource::Dmx0 => Some(DmxId(0)),
            TsSource::Dmx1 => Some(DmxId(1)),
            TsSource::Dmx2 => Some(DmxId(2)),
            _ => None,
        }
    }
}

impl fmt::Display for TsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TsSource::Ts0 => "ts0",
            TsSource::Ts1 => "ts1",
            TsSource::Ts2 => "ts2",
            TsSource::STs0 => "s_ts0",
            TsSource::STs1 => "s_ts1",
            TsSource::STs2 => "s_ts2",
            TsSource::Hiu => "hiu",
            TsSource::Dmx0 => "dmx0",
            TsSource::Dmx1 => "dmx1",
            TsSource::Dmx2 => "dmx2",
        };
        f.write_str(name)
    }
}

/// User-facing demux source selector (DVB `dmx_source_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmxSource {
    /// Frontend `n` (0..=3).
    Front(u8),
    /// DVR/memory input `n` (0..=3).
    Dvr(u8),
    /// Output of demux `n` (0..=2).
    FrontOffset(u8),
}

impl DmxSource {
    /// Decode the raw DVB numbering: 0..=3, 16..=19, 100..=102.
    pub fn from_raw(raw: i32) -> Result<Self, DemuxError> {
        match raw {
            0..=3 => Ok(DmxSource::Front(raw as u8)),
            16..=19 => Ok(DmxSource::Dvr((raw - 16) as u8)),
            100..=102 => Ok(DmxSource::FrontOffset((raw - 100) as u8)),
            _ => Err(DemuxError::InvalidSource(format!("dmx_source {}", raw))),
        }
    }

    pub fn to_raw(self) -> i32 {
        match self {
            DmxSource::Front(n) => n as i32,
            DmxSource::Dvr(n) => 16 + n as i32,
            DmxSource::FrontOffset(n) => 100 + n as i32,
        }
    }
}

impl std::str::FromStr for DmxSource {
    type Err = DemuxError;

    /// Parse `front0`, `dvr1`, `front2_offset` or a raw number.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if let Ok(raw) = s.parse::<i32>() {
            return DmxSource::from_raw(raw);
        }
        let parse_index = |digits: &str| {
            digits
                .parse::<u8>()
                .map_err(|_| DemuxError::InvalidSource(s.clone()))
        };
        if let Some(rest) = s.strip_prefix("front") {
            if let Some(n) = rest.strip_suffix("_offset") {
                return DmxSource::from_raw(100 + parse_index(n)? as i32);
            }
            return DmxSource::from_raw(parse_index(rest)? as i32);
        }
        if let Some(rest) = s.strip_prefix("dvr") {
            return DmxSource::from_raw(16 + parse_index(rest)? as i32);
        }
        Err(DemuxError::InvalidSource(s))
    }
}

/// Physical input wiring mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TsInputMode {
    #[default]
    Disabled,
    Parallel,
    Serial,
}

/// Channel type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Section,
    Pes,
    Pcr,
}

/// PES subtype (DVB `dmx_ts_pes` order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PesType {
    Audio = 0,
    Video = 1,
    Teletext = 2,
    Subtitle = 3,
    Pcr = 4,
    Other = 5,
}

impl PesType {
    /// Bit of this subtype in timeout channel masks.
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// Whether units of this subtype go to the subtitle pool.
    pub fn uses_subtitle_pool(self) -> bool {
        matches!(self, PesType::Subtitle | PesType::Teletext)
    }
}

/// Channel-disable mask covering video, audio and subtitle.
pub const DTO_CHDIS_VAS: u32 = (1 << PesType::Video as u32)
    | (1 << PesType::Audio as u32)
    | (1 << PesType::Subtitle as u32);

/// Where a section was extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionOrigin {
    /// Hardware filter path.
    Hw = 0,
    /// Software fallback filter.
    Sw = 1,
    /// Small-section fast path.
    SmallSection = 2,
}

/// Number of section origin classes.
pub const SEC_CNT_MAX: usize = 3;

impl SectionOrigin {
    pub fn index(self) -> usize {
        self as usize
    }
}
