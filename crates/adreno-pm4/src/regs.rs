//! A2xx register map (dword offsets, as written into type-0 packets and used
//! for direct MMIO access).

pub const RBBM_PATCH_RELEASE: u32 = 0x0001;
pub const RBBM_CNTL: u32 = 0x003B;
pub const RBBM_SOFT_RESET: u32 = 0x003C;
pub const RBBM_DEBUG: u32 = 0x039B;
pub const RBBM_PM_OVERRIDE1: u32 = 0x039C;
pub const RBBM_PM_OVERRIDE2: u32 = 0x039D;
pub const RBBM_INT_CNTL: u32 = 0x03B4;
pub const RBBM_INT_STATUS: u32 = 0x03B5;
pub const RBBM_INT_ACK: u32 = 0x03B6;
pub const MASTER_INT_SIGNAL: u32 = 0x03B7;
pub const RBBM_PERIPHID1: u32 = 0x03F9;
pub const RBBM_PERIPHID2: u32 = 0x03FA;
pub const RBBM_STATUS: u32 = 0x05D0;
pub const RBBM_PERFCOUNTER1_SELECT: u32 = 0x0395;
pub const RBBM_PERFCOUNTER1_LO: u32 = 0x0397;

pub const CP_RB_BASE: u32 = 0x01C0;
pub const CP_RB_CNTL: u32 = 0x01C1;
pub const CP_RB_RPTR_ADDR: u32 = 0x01C3;
pub const CP_RB_RPTR: u32 = 0x01C4;
pub const CP_RB_WPTR: u32 = 0x01C5;
pub const CP_INT_CNTL: u32 = 0x01F2;
pub const CP_INT_STATUS: u32 = 0x01F3;
pub const CP_INT_ACK: u32 = 0x01F4;
pub const CP_ME_CNTL: u32 = 0x01F6;
pub const CP_PERFMON_CNTL: u32 = 0x0444;
pub const CP_IB1_BASE: u32 = 0x0458;
pub const CP_IB1_BUFSZ: u32 = 0x0459;
pub const CP_IB2_BASE: u32 = 0x045A;
pub const CP_IB2_BUFSZ: u32 = 0x045B;
/// Scratch register 0, repurposed as the consumed timestamp.
pub const CP_TIMESTAMP: u32 = 0x0578;

pub const MH_MMU_CONFIG: u32 = 0x0040;
pub const MH_MMU_PT_BASE: u32 = 0x0042;
pub const MH_MMU_INVALIDATE: u32 = 0x0045;
pub const MH_MMU_MPU_BASE: u32 = 0x0046;
pub const MH_MMU_MPU_END: u32 = 0x0047;
pub const MH_ARBITER_CONFIG: u32 = 0x0A40;
pub const MH_CLNT_INTF_CTRL_CONFIG1: u32 = 0x0A54;
pub const MH_CLNT_INTF_CTRL_CONFIG2: u32 = 0x0A55;

pub const SQ_FLOW_CONTROL: u32 = 0x0D01;
pub const SQ_INT_CNTL: u32 = 0x0D34;
pub const RB_EDRAM_INFO: u32 = 0x0F02;
pub const SQ_PS_PROGRAM: u32 = 0x21F6;
pub const SQ_VS_PROGRAM: u32 = 0x21F7;
pub const PA_SU_SC_MODE_CNTL: u32 = 0x2205;

/// Value of `RBBM_STATUS` when every block reports idle.
pub const RBBM_STATUS_IDLE: u32 = 0x0000_0110;

/// `MH_MMU_INVALIDATE` bits: flush the TLB and the TC cache.
pub const MH_MMU_INVALIDATE_INVALIDATE_ALL: u32 = 0x1;
pub const MH_MMU_INVALIDATE_INVALIDATE_TC: u32 = 0x2;

pub const CP_INT_CNTL_SW_INT_MASK: u32 = 0x0008_0000;
pub const CP_INT_CNTL_T0_PACKET_IN_IB_MASK: u32 = 0x0080_0000;
pub const CP_INT_CNTL_OPCODE_ERROR_MASK: u32 = 0x0100_0000;
pub const CP_INT_CNTL_PROTECTED_MODE_ERROR_MASK: u32 = 0x0200_0000;
pub const CP_INT_CNTL_RESERVED_BIT_ERROR_MASK: u32 = 0x0400_0000;
pub const CP_INT_CNTL_IB_ERROR_MASK: u32 = 0x0800_0000;
pub const CP_INT_CNTL_IB2_INT_MASK: u32 = 0x2000_0000;
pub const CP_INT_CNTL_IB1_INT_MASK: u32 = 0x4000_0000;
pub const CP_INT_CNTL_RB_INT_MASK: u32 = 0x8000_0000;

/// Error sources among the `CP_INT_STATUS` bits.
pub const CP_INT_ERROR_MASK: u32 = CP_INT_CNTL_T0_PACKET_IN_IB_MASK
    | CP_INT_CNTL_OPCODE_ERROR_MASK
    | CP_INT_CNTL_PROTECTED_MODE_ERROR_MASK
    | CP_INT_CNTL_RESERVED_BIT_ERROR_MASK
    | CP_INT_CNTL_IB_ERROR_MASK;

/// Every error source the CP can flag, plus the ring-buffer timestamp bit.
pub const CP_INT_MASK: u32 = CP_INT_ERROR_MASK | CP_INT_CNTL_IB1_INT_MASK | CP_INT_CNTL_RB_INT_MASK;

/// `MASTER_INT_SIGNAL` source bits.
pub const MASTER_INT_SIGNAL_MH_INT_STAT: u32 = 0x0000_0020;
pub const MASTER_INT_SIGNAL_SQ_INT_STAT: u32 = 0x0400_0000;
pub const MASTER_INT_SIGNAL_CP_INT_STAT: u32 = 0x4000_0000;
pub const MASTER_INT_SIGNAL_RBBM_INT_STAT: u32 = 0x8000_0000;

// CP_PERFMON_CNTL fields.
pub const PERFMON_STATE_RESET: u32 = 0x0;
pub const PERFMON_STATE_ENABLE: u32 = 0x1;
pub const PERFMON_STATE_FREEZE: u32 = 0x2;
pub const PERFMON_MODE_COUNT: u32 = 0x0;

/// `RBBM_PERFCOUNTER1_SELECT` event counting busy cycles.
pub const RBBM_PERF_EVENT_BUSY: u32 = 0x1;
/// `RBBM_PM_OVERRIDE2` bit keeping the performance counters clocked.
pub const RBBM_PM_OVERRIDE2_PERF_CLK: u32 = 0x40;

/// Value written to `RBBM_CNTL` after reset.
pub const RBBM_CNTL_DEFAULT: u32 = 0x0000_4442;
/// `RBBM_DEBUG` bit that ignores the RTR (ready-to-receive) signal from the
/// memory hub during bus arbitration.
pub const RBBM_DEBUG_IGNORE_RTR: u32 = 0x0008_0000;
/// Large-instruction-store split used on A225.
pub const SQ_FLOW_CONTROL_A225: u32 = 0x1800_0000;

/// Default memory-hub arbiter programming.
pub const MH_ARBITER_CONFIG_DEFAULT: u32 = 0x10 // same page limit
    | (1 << 7) // L1 arbiter enable
    | (1 << 8) // L1 arbiter TC enable
    | (1 << 10) // page-hit bit
    | (1 << 13) // TC reorder
    | (1 << 14) // TC arbiter hold
    | (8 << 16) // TC arbiter hold limit
    | (1 << 22) // CP client enable
    | (1 << 23) // VGT client enable
    | (1 << 24) // TC client enable
    | (1 << 25) // RB client enable
    | (1 << 26); // PA client enable

/// Encode the `RB_EDRAM_INFO` register for a GMEM of `size_bytes` at `base`.
///
/// `size_bytes` is expected to be a power-of-two multiple of 16 KiB.
pub fn rb_edram_info(size_bytes: u32, base: u32) -> u32 {
    let size_field = (size_bytes >> 14).max(1).trailing_zeros() & 0xF;
    // Mode 0: single-bank.
    let mode = 0u32;
    size_field | (mode << 4) | ((base >> 14) << 14)
}
