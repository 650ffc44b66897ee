//! Builder for PM4 dword streams.

use crate::packets::{
    set_constant_reg, type0_packet, type3_packet, Pm4Opcode, CACHE_FLUSH_TS,
    INVALIDATE_ALL_STATE,
};

/// `DRAW_INDX_BIN` initiator for a zero-vertex, auto-index, point-list draw.
/// Used as a benign no-op draw by the MMU update erratum workaround.
pub const NULL_DRAW_INITIATOR: u32 = 0x0003_C004;

/// Appends PM4 packets to a growable dword buffer.
#[derive(Debug, Default, Clone)]
pub struct Pm4Writer {
    buf: Vec<u32>,
}

impl Pm4Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(dwords: usize) -> Self {
        Self {
            buf: Vec::with_capacity(dwords),
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn finish(self) -> Vec<u32> {
        self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn as_words(&self) -> &[u32] {
        &self.buf
    }

    /// Append already-encoded words verbatim.
    pub fn append_raw(&mut self, words: &[u32]) -> &mut Self {
        self.buf.extend_from_slice(words);
        self
    }

    pub fn type3(&mut self, opcode: Pm4Opcode, payload: &[u32]) -> &mut Self {
        debug_assert!(!payload.is_empty());
        self.buf.push(type3_packet(opcode, payload.len() as u32));
        self.buf.extend_from_slice(payload);
        self
    }

    pub fn write_reg(&mut self, reg: u32, value: u32) -> &mut Self {
        self.buf.push(type0_packet(reg, 1));
        self.buf.push(value);
        self
    }

    pub fn nop(&mut self, payload: &[u32]) -> &mut Self {
        self.type3(Pm4Opcode::Nop, payload)
    }

    pub fn wait_for_idle(&mut self) -> &mut Self {
        self.type3(Pm4Opcode::WaitForIdle, &[0])
    }

    pub fn invalidate_state(&mut self, mask: u32) -> &mut Self {
        self.type3(Pm4Opcode::InvalidateState, &[mask])
    }

    pub fn invalidate_all_state(&mut self) -> &mut Self {
        self.invalidate_state(INVALIDATE_ALL_STATE)
    }

    pub fn set_protected_mode(&mut self, enabled: bool) -> &mut Self {
        self.type3(Pm4Opcode::SetProtectedMode, &[enabled as u32])
    }

    pub fn indirect_buffer(&mut self, gpuaddr: u32, size_dwords: u32) -> &mut Self {
        self.type3(Pm4Opcode::IndirectBufferPfd, &[gpuaddr, size_dwords])
    }

    pub fn mem_write(&mut self, gpuaddr: u32, value: u32) -> &mut Self {
        self.type3(Pm4Opcode::MemWrite, &[gpuaddr, value])
    }

    /// Flush caches, then write `timestamp` to `gpuaddr`.
    pub fn event_write_timestamp(&mut self, gpuaddr: u32, timestamp: u32) -> &mut Self {
        self.type3(Pm4Opcode::EventWrite, &[CACHE_FLUSH_TS, gpuaddr, timestamp])
    }

    pub fn set_constant_register(&mut self, reg: u32, value: u32) -> &mut Self {
        self.type3(Pm4Opcode::SetConstant, &[set_constant_reg(reg), value])
    }

    pub fn set_bin_base_offset(&mut self, offset: u32) -> &mut Self {
        self.type3(Pm4Opcode::SetBinBaseOffset, &[offset])
    }

    /// A draw that renders nothing but still walks the binning pipeline,
    /// sourcing its (unused) indices from `index_gpuaddr`.
    pub fn null_binned_draw(&mut self, index_gpuaddr: u32) -> &mut Self {
        self.type3(
            Pm4Opcode::DrawIndxBin,
            &[0, NULL_DRAW_INITIATOR, 0, 3, index_gpuaddr, 6],
        )
    }
}
