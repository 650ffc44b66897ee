//! PM4 packet headers and a word-stream decoder.
//!
//! Only the packet types the driver emits itself are modelled: type-0
//! register writes, type-2 fillers and the handful of type-3 opcodes used by
//! submission framing and page-table synchronisation.

use thiserror::Error;

pub const PM4_TYPE0: u32 = 0 << 30;
pub const PM4_TYPE2: u32 = 2 << 30;
pub const PM4_TYPE3: u32 = 3 << 30;

/// Single-dword filler. The CP skips it without side effects.
pub const PM4_TYPE2_FILLER: u32 = PM4_TYPE2;

/// Type-0 count field is 14 bits wide (stored as `count - 1`).
pub const PM4_MAX_COUNT: u32 = 0x4000;

/// Event id for [`Pm4Opcode::EventWrite`] that flushes caches and then writes
/// a timestamp to memory.
pub const CACHE_FLUSH_TS: u32 = 4;

/// Mask for [`Pm4Opcode::InvalidateState`] covering every state group.
pub const INVALIDATE_ALL_STATE: u32 = 0x7FFF;

/// Offset subtracted from a register number when it is addressed through
/// [`Pm4Opcode::SetConstant`].
pub const SET_CONSTANT_REG_BASE: u32 = 0x2000;
const SET_CONSTANT_TYPE_REGISTER: u32 = 0x4 << 16;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Pm4Opcode {
    Nop = 0x10,
    WaitForIdle = 0x26,
    SetConstant = 0x2D,
    DrawIndxBin = 0x34,
    IndirectBufferPfd = 0x37,
    InvalidateState = 0x3B,
    MemWrite = 0x3D,
    Interrupt = 0x40,
    EventWrite = 0x46,
    SetBinBaseOffset = 0x4B,
    SetProtectedMode = 0x5F,
}

impl Pm4Opcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x10 => Self::Nop,
            0x26 => Self::WaitForIdle,
            0x2D => Self::SetConstant,
            0x34 => Self::DrawIndxBin,
            0x37 => Self::IndirectBufferPfd,
            0x3B => Self::InvalidateState,
            0x3D => Self::MemWrite,
            0x40 => Self::Interrupt,
            0x46 => Self::EventWrite,
            0x4B => Self::SetBinBaseOffset,
            0x5F => Self::SetProtectedMode,
            _ => return None,
        })
    }
}

/// Header for a type-0 packet writing `count` consecutive registers starting
/// at `reg`.
pub const fn type0_packet(reg: u32, count: u32) -> u32 {
    PM4_TYPE0 | ((count - 1) << 16) | (reg & 0x7FFF)
}

/// Header for a type-3 packet carrying `count` payload dwords.
pub const fn type3_packet(opcode: Pm4Opcode, count: u32) -> u32 {
    PM4_TYPE3 | ((count - 1) << 16) | ((opcode as u32 & 0xFF) << 8)
}

/// `SET_CONSTANT` selector addressing register `reg`.
pub const fn set_constant_reg(reg: u32) -> u32 {
    SET_CONSTANT_TYPE_REGISTER | (reg - SET_CONSTANT_REG_BASE)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pm4Header {
    Type0 { reg: u32, count: u32 },
    Type2,
    /// `opcode` is the raw opcode byte; see [`Pm4Header::opcode`].
    Type3 { opcode: u8, count: u32 },
}

impl Pm4Header {
    pub fn payload_len(self) -> usize {
        match self {
            Self::Type0 { count, .. } | Self::Type3 { count, .. } => count as usize,
            Self::Type2 => 0,
        }
    }

    pub fn opcode(self) -> Option<Pm4Opcode> {
        match self {
            Self::Type3 { opcode, .. } => Pm4Opcode::from_u8(opcode),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Pm4DecodeError {
    #[error("unsupported packet type in header {word:#010x}")]
    UnsupportedType { word: u32 },
    #[error("packet at dword {offset} needs {needed} dwords but only {available} remain")]
    PacketOverrunsStream {
        offset: usize,
        needed: usize,
        available: usize,
    },
}

pub fn decode_header(word: u32) -> Result<Pm4Header, Pm4DecodeError> {
    let count = ((word >> 16) & 0x3FFF) + 1;
    match word >> 30 {
        0 => Ok(Pm4Header::Type0 {
            reg: word & 0x7FFF,
            count,
        }),
        2 => Ok(Pm4Header::Type2),
        3 => Ok(Pm4Header::Type3 {
            opcode: ((word >> 8) & 0xFF) as u8,
            count,
        }),
        _ => Err(Pm4DecodeError::UnsupportedType { word }),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pm4Packet<'a> {
    /// Dword offset of the header within the decoded stream.
    pub offset: usize,
    pub header: Pm4Header,
    pub payload: &'a [u32],
}

impl Pm4Packet<'_> {
    /// Total size of the packet including its header.
    pub fn size_dwords(&self) -> usize {
        1 + self.payload.len()
    }

    pub fn is_opcode(&self, opcode: Pm4Opcode) -> bool {
        self.header.opcode() == Some(opcode)
    }
}

/// Walks a dword stream packet by packet. Stops after the first error.
pub struct Pm4PacketIter<'a> {
    words: &'a [u32],
    offset: usize,
    done: bool,
}

impl<'a> Pm4PacketIter<'a> {
    pub fn new(words: &'a [u32]) -> Self {
        Self {
            words,
            offset: 0,
            done: false,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for Pm4PacketIter<'a> {
    type Item = Result<Pm4Packet<'a>, Pm4DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.words.len() {
            return None;
        }

        let header = match decode_header(self.words[self.offset]) {
            Ok(header) => header,
            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        };

        let start = self.offset + 1;
        let end = start + header.payload_len();
        if end > self.words.len() {
            self.done = true;
            return Some(Err(Pm4DecodeError::PacketOverrunsStream {
                offset: self.offset,
                needed: 1 + header.payload_len(),
                available: self.words.len() - self.offset,
            }));
        }

        let packet = Pm4Packet {
            offset: self.offset,
            header,
            payload: &self.words[start..end],
        };
        self.offset = end;
        Some(Ok(packet))
    }
}
