//! Transport stream packet header, PCR and PTS parsing.

use meson_dvb_types::{SYNC_BYTE, TS_PACKET_SIZE};

/// Header fields of one 188-byte packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsHeader {
    pub transport_error: bool,
    pub payload_unit_start: bool,
    /// Packet Identifier (13 bits).
    pub pid: u16,
    pub scrambling_control: u8,
    pub adaptation_field_control: u8,
    pub continuity_counter: u8,
}

impl TsHeader {
    pub fn has_adaptation_field(&self) -> bool {
        self.adaptation_field_control & 0x02 != 0
    }

    pub fn has_payload(&self) -> bool {
        self.adaptation_field_control & 0x01 != 0
    }
}

/// A packet split into header, optional PCR and payload.
#[derive(Debug, Clone, Copy)]
pub struct TsPacket<'a> {
    pub header: TsHeader,
    /// PCR in 27 MHz units, when the adaptation field carries one.
    pub pcr: Option<u64>,
    pub discontinuity: bool,
    pub payload: &'a [u8],
    pub raw: &'a [u8],
}

impl<'a> TsPacket<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < TS_PACKET_SIZE || data[0] != SYNC_BYTE {
            return None;
        }
        let raw = &data[..TS_PACKET_SIZE];

        let header = TsHeader {
            transport_error: raw[1] & 0x80 != 0,
            payload_unit_start: raw[1] & 0x40 != 0,
            pid: ((raw[1] as u16 & 0x1F) << 8) | raw[2] as u16,
            scrambling_control: (raw[3] >> 6) & 0x03,
            adaptation_field_control: (raw[3] >> 4) & 0x03,
            continuity_counter: raw[3] & 0x0F,
        };

        let mut offset = 4;
        let mut pcr = None;
        let mut discontinuity = false;
        if header.has_adaptation_field() {
            let af_len = raw[4] as usize;
            if af_len > 0 {
                let flags = raw[5];
                discontinuity = flags & 0x80 != 0;
                if flags & 0x10 != 0 && af_len >= 7 {
                    pcr = Some(parse_pcr(&raw[6..12]));
                }
            }
            offset = 5 + af_len;
        }

        let payload = if header.has_payload() && offset < TS_PACKET_SIZE {
            &raw[offset..]
        } else {
            &[]
        };

        Some(Self {
            header,
            pcr,
            discontinuity,
            payload,
            raw,
        })
    }
}

/// PCR base * 300 + extension.
fn parse_pcr(b: &[u8]) -> u64 {
    let base = ((b[0] as u64) << 25)
        | ((b[1] as u64) << 17)
        | ((b[2] as u64) << 9)
        | ((b[3] as u64) << 1)
        | ((b[4] as u64) >> 7);
    let ext = (((b[4] as u64) & 0x01) << 8) | b[5] as u64;
    base * 300 + ext
}

/// Read the 33-bit PTS from the start of a PES packet.
pub fn parse_pes_pts(pes: &[u8]) -> Option<u64> {
    if pes.len() < 14 || pes[0] != 0 || pes[1] != 0 || pes[2] != 1 {
        return None;
    }
    // PTS_DTS_flags
    if pes[7] & 0x80 == 0 {
        return None;
    }
    let p = &pes[9..14];
    Some(
        (((p[0] as u64) >> 1) & 0x07) << 30
            | (p[1] as u64) << 22
            | ((p[2] as u64) >> 1) << 15
            | (p[3] as u64) << 7
            | (p[4] as u64) >> 1,
    )
}

/// Split a byte stream into aligned packets, resynchronising on the sync
/// byte. Returns the number of bytes consumed; any trailing partial packet
/// is left for the caller to carry.
pub fn for_each_packet<'a>(data: &'a [u8], mut f: impl FnMut(&'a [u8])) -> usize {
    let mut pos = 0;
    while pos + TS_PACKET_SIZE <= data.len() {
        if data[pos] != SYNC_BYTE {
            pos += 1;
            continue;
        }
        f(&data[pos..pos + TS_PACKET_SIZE]);
        pos += TS_PACKET_SIZE;
    }
    // Keep a partial packet only if it starts at a sync byte.
    while pos < data.len() && data[pos] != SYNC_BYTE {
        pos += 1;
    }
    pos
}
