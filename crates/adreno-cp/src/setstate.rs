//! In-band GPU/MMU state synchronisation.
//!
//! Switching page tables while the pipeline is busy is done by appending a
//! command sequence to the active context's stream, so the switch lands in
//! order with that context's work instead of stalling the CPU on an idle
//! wait.

use adreno_pm4::regs;
use adreno_pm4::Pm4Writer;
use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct MmuFlags: u32 {
        const PT_UPDATE = 1 << 0;
        const TLB_FLUSH = 1 << 1;
    }
}

/// `MH_MMU_INVALIDATE` value flushing the TLB and the TC cache.
pub const MH_MMU_INVALIDATE_ALL_AND_TC: u32 =
    regs::MH_MMU_INVALIDATE_INVALIDATE_ALL | regs::MH_MMU_INVALIDATE_INVALIDATE_TC;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSyncCommandBuilder {
    /// Hardware page-table base to load.
    pub pt_base: u32,
    /// Silicon needs the VGT prefetch workaround after a PT update.
    pub pt_update_workaround: bool,
    /// Scratch memory the workaround's null draws read from.
    pub scratch_gpuaddr: u32,
    /// Bin base offset of the context the sequence is appended to, restored
    /// after the workaround repoints it.
    pub context_bin_base_offset: Option<u32>,
}

impl StateSyncCommandBuilder {
    pub fn build(&self, flags: MmuFlags) -> Vec<u32> {
        let mut w = Pm4Writer::with_capacity(32);

        if flags.contains(MmuFlags::PT_UPDATE) {
            w.wait_for_idle();
            w.write_reg(regs::MH_MMU_PT_BASE, self.pt_base);
        }

        if flags.contains(MmuFlags::TLB_FLUSH) {
            if !flags.contains(MmuFlags::PT_UPDATE) {
                w.wait_for_idle();
            }
            w.write_reg(regs::MH_MMU_INVALIDATE, MH_MMU_INVALIDATE_ALL_AND_TC);
        }

        if flags.contains(MmuFlags::PT_UPDATE | MmuFlags::TLB_FLUSH) && self.pt_update_workaround {
            // Fill the VGT DMA request FIFO with two null binned draws so it
            // cannot prefetch vertex or bin data through the old page table,
            // then wait for them to drain.
            w.set_constant_register(regs::PA_SU_SC_MODE_CNTL, 0);
            w.set_bin_base_offset(self.scratch_gpuaddr);
            w.null_binned_draw(self.scratch_gpuaddr);
            w.null_binned_draw(self.scratch_gpuaddr);
            w.wait_for_idle();
            if let Some(offset) = self.context_bin_base_offset {
                w.set_bin_base_offset(offset);
            }
        }

        if !flags.is_empty() {
            w.invalidate_all_state();
        }

        w.finish()
    }
}
