//! Section and PES unit reassembly from packet payloads.

use crc::{Crc, CRC_32_MPEG_2};
use meson_dvb_types::MAX_SECTION_SIZE;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Total section length (header included) announced by the first 3 bytes.
pub fn section_total_len(section: &[u8]) -> Option<usize> {
    if section.len() < 3 {
        return None;
    }
    Some(3 + (((section[1] as usize & 0x0F) << 8) | section[2] as usize))
}

/// Whether the long-form syntax (and therefore a CRC32) is present.
pub fn has_syntax_indicator(section: &[u8]) -> bool {
    section.len() > 1 && section[1] & 0x80 != 0
}

/// Verify the trailing CRC32 of a long-form section.
pub fn crc_ok(section: &[u8]) -> bool {
    if section.len() < 7 {
        return false;
    }
    let end = section.len();
    let expected = u32::from_be_bytes([
        section[end - 4],
        section[end - 3],
        section[end - 2],
        section[end - 1],
    ]);
    CRC32.checksum(&section[..end - 4]) == expected
}

/// Append a correct CRC32 to `section`.
pub fn append_crc(section: &mut Vec<u8>) {
    let crc = CRC32.checksum(section);
    section.extend_from_slice(&crc.to_be_bytes());
}

/// Per-PID section reassembler.
///
/// Handles the pointer field, several sections in one packet, sections
/// spanning packets, 0xFF stuffing and continuity-counter gaps.
#[derive(Debug, Default)]
pub struct SectionAssembler {
    buffer: Vec<u8>,
    last_cc: Option<u8>,
    /// A section start has been seen since the last discontinuity.
    synced: bool,
    discontinuities: u64,
}

impl SectionAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any partial section and forget the continuity state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.last_cc = None;
        self.synced = false;
    }

    pub fn discontinuities(&self) -> u64 {
        self.discontinuities
    }

    /// Feed one packet payload; `emit` receives every completed section.
    pub fn push(&mut self, payload: &[u8], cc: u8, pusi: bool, mut emit: impl FnMut(&[u8])) {
        if let Some(last) = self.last_cc {
            if cc == last {
                // Duplicate packet.
                return;
            }
            if cc != (last + 1) & 0x0F {
                self.discontinuities += 1;
                self.buffer.clear();
                self.synced = false;
            }
        }
        self.last_cc = Some(cc);

        if payload.is_empty() {
            return;
        }

        if pusi {
            let pointer = payload[0] as usize;
            let start = 1 + pointer;
            if start > payload.len() {
                self.buffer.clear();
                self.synced = false;
                return;
            }
            if self.synced && !self.buffer.is_empty() {
                self.buffer.extend_from_slice(&payload[1..start]);
                self.drain(&mut emit);
            }
            self.buffer.clear();
            self.synced = true;
            self.buffer.extend_from_slice(&payload[start..]);
        } else if self.synced {
            self.buffer.extend_from_slice(payload);
        } else {
            return;
        }
        self.drain(&mut emit);
    }

    fn drain(&mut self, emit: &mut impl FnMut(&[u8])) {
        loop {
            if self.buffer.first() == Some(&0xFF) {
                // Stuffing until the next section start.
                self.buffer.clear();
                self.synced = false;
                return;
            }
            let Some(total) = section_total_len(&self.buffer) else {
                return;
            };
            if total > MAX_SECTION_SIZE {
                self.buffer.clear();
                self.synced = false;
                return;
            }
            if self.buffer.len() < total {
                return;
            }
            emit(&self.buffer[..total]);
            self.buffer.drain(..total);
        }
    }
}

/// Per-PID PES unit reassembler.
///
/// A unit ends at the next payload-unit start, when a bounded
/// PES_packet_length is reached, or when it fills `limit` bytes (the
/// buffer slot size).
#[derive(Debug)]
pub struct PesAssembler {
    buffer: Vec<u8>,
    started: bool,
    limit: usize,
}

impl PesAssembler {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            started: false,
            limit: limit.max(1),
        }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.started = false;
    }

    pub fn push(&mut self, payload: &[u8], pusi: bool, mut emit: impl FnMut(&[u8])) {
        if pusi {
            if self.started && !self.buffer.is_empty() {
                emit(&self.buffer);
            }
            self.buffer.clear();
            self.started = true;
        }
        if !self.started {
            return;
        }

        let mut rest = payload;
        while !rest.is_empty() {
            let room = self.limit - self.buffer.len();
            let n = room.min(rest.len());
            self.buffer.extend_from_slice(&rest[..n]);
            rest = &rest[n..];
            if self.buffer.len() >= self.limit {
                emit(&self.buffer);
                self.buffer.clear();
            }
        }

        if let Some(total) = self.bounded_len() {
            if self.buffer.len() >= total {
                emit(&self.buffer[..total]);
                self.buffer.clear();
                self.started = false;
            }
        }
    }

    /// Full unit length when the header carries a non-zero PES_packet_length.
    fn bounded_len(&self) -> Option<usize> {
        if self.buffer.len() < 6 || self.buffer[..3] != [0, 0, 1] {
            return None;
        }
        let len = ((self.buffer[4] as usize) << 8) | self.buffer[5] as usize;
        (len != 0).then_some(6 + len)
    }
}
