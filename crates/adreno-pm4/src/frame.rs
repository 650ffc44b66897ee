//! Submission framing.
//!
//! Every submission the driver places in the ring is wrapped in a frame:
//!
//! ```text
//! NOP [CMD_IDENTIFIER, context_id]
//! [SET_PROTECTED_MODE 0]          (internal commands only)
//! payload...
//! [SET_PROTECTED_MODE 1]
//! type0 CP_TIMESTAMP <- ts
//! EVENT_WRITE [CACHE_FLUSH_TS, eop_gpuaddr, ts]
//! ```
//!
//! The leading identifier lets recovery find frame boundaries in a ring whose
//! contents may start mid-frame, and the trailing event write gives each
//! frame its timestamp.

use core::ops::Range;

use crate::packets::{
    decode_header, type3_packet, Pm4Opcode, Pm4PacketIter, CACHE_FLUSH_TS,
};
use crate::regs;
use crate::writer::Pm4Writer;

/// Marker placed in the leading NOP of every frame.
pub const CMD_IDENTIFIER: u32 = 0xFEED_FACE;

/// Context id used for frames not owned by any client context.
pub const CONTEXT_NONE: u32 = u32::MAX;

const FRAME_HEADER_DWORDS: usize = 3;
const PMODE_DWORDS: usize = 4;
const FRAME_TRAILER_DWORDS: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameParams {
    pub context_id: u32,
    pub timestamp: u32,
    /// GPU address the retired timestamp is written to.
    pub eop_gpuaddr: u32,
    /// Drop out of protected mode around the payload.
    pub unprotected: bool,
}

/// Number of dwords a frame around `payload_dwords` of payload occupies.
pub fn frame_size(payload_dwords: usize, unprotected: bool) -> usize {
    FRAME_HEADER_DWORDS
        + payload_dwords
        + if unprotected { PMODE_DWORDS } else { 0 }
        + FRAME_TRAILER_DWORDS
}

pub fn encode_frame(w: &mut Pm4Writer, params: &FrameParams, payload: &[u32]) {
    w.nop(&[CMD_IDENTIFIER, params.context_id]);
    if params.unprotected {
        w.set_protected_mode(false);
    }
    w.append_raw(payload);
    if params.unprotected {
        w.set_protected_mode(true);
    }
    w.write_reg(regs::CP_TIMESTAMP, params.timestamp);
    w.event_write_timestamp(params.eop_gpuaddr, params.timestamp);
}

/// A complete frame located in a linear word stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub range: Range<usize>,
    pub context_id: u32,
    pub timestamp: u32,
    /// GPU addresses of indirect buffers the frame jumps to.
    pub ib_addrs: Vec<u32>,
}

impl Frame {
    pub fn words<'a>(&self, stream: &'a [u32]) -> &'a [u32] {
        &stream[self.range.clone()]
    }

    pub fn references_ib(&self, gpuaddr: u32) -> bool {
        self.ib_addrs.contains(&gpuaddr)
    }
}

fn is_frame_start(words: &[u32], at: usize) -> bool {
    words.len() >= at + FRAME_HEADER_DWORDS
        && words[at] == type3_packet(Pm4Opcode::Nop, 2)
        && words[at + 1] == CMD_IDENTIFIER
}

/// Finds complete frames in `words`, in stream order.
///
/// Words outside any complete frame (fillers, partially overwritten frames,
/// a frame cut off by the end of the stream) are skipped.
pub struct FrameScanner<'a> {
    words: &'a [u32],
    pos: usize,
}

impl<'a> FrameScanner<'a> {
    pub fn new(words: &'a [u32]) -> Self {
        Self { words, pos: 0 }
    }

    fn parse_at(&self, start: usize) -> Option<Frame> {
        let context_id = self.words[start + 2];
        let mut ib_addrs = Vec::new();
        let body = &self.words[start + FRAME_HEADER_DWORDS..];
        for packet in Pm4PacketIter::new(body) {
            let packet = packet.ok()?;
            let abs = start + FRAME_HEADER_DWORDS + packet.offset;
            // A new identifier before the trailer means this frame was cut
            // short by a later write.
            if is_frame_start(self.words, abs) {
                return None;
            }
            match packet.header.opcode() {
                Some(Pm4Opcode::IndirectBufferPfd) if packet.payload.len() >= 2 => {
                    ib_addrs.push(packet.payload[0]);
                }
                Some(Pm4Opcode::EventWrite)
                    if packet.payload.len() == 3 && packet.payload[0] == CACHE_FLUSH_TS =>
                {
                    return Some(Frame {
                        range: start..abs + packet.size_dwords(),
                        context_id,
                        timestamp: packet.payload[2],
                        ib_addrs,
                    });
                }
                _ => {}
            }
        }
        None
    }
}

impl Iterator for FrameScanner<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        while self.pos < self.words.len() {
            let at = self.pos;
            if is_frame_start(self.words, at) {
                if let Some(frame) = self.parse_at(at) {
                    self.pos = frame.range.end;
                    return Some(frame);
                }
            }
            self.pos = match decode_header(self.words[at]) {
                // Skip fillers and padding NOPs whole so that their payload
                // is never mistaken for a frame start.
                Ok(h) if !is_frame_start(self.words, at) && h.opcode() == Some(Pm4Opcode::Nop) => {
                    (at + 1 + h.payload_len()).min(self.words.len())
                }
                _ => at + 1,
            };
        }
        None
    }
}
