//! GPU identification and per-family behaviour.

use std::fmt;

use adreno_pm4::regs;
use bitflags::bitflags;
use tracing::{error, warn};

use crate::backend::RegisterIo;
use crate::config::PlatformQuirks;

/// Wildcard in the GPU table.
pub const ANY_ID: u32 = !0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuRev {
    A200,
    A205,
    A220,
    A225,
}

impl GpuRev {
    /// Numeric revision, as reported in the client GPU id.
    pub fn as_u32(self) -> u32 {
        match self {
            GpuRev::A200 => 200,
            GpuRev::A205 => 205,
            GpuRev::A220 => 220,
            GpuRev::A225 => 225,
        }
    }

    pub fn is_a20x(self) -> bool {
        matches!(self, GpuRev::A200 | GpuRev::A205)
    }

    pub fn is_a22x(self) -> bool {
        matches!(self, GpuRev::A220 | GpuRev::A225)
    }

    pub fn is_a225(self) -> bool {
        self == GpuRev::A225
    }
}

/// `core << 24 | major << 16 | minor << 8 | patch`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChipId(pub u32);

impl ChipId {
    pub fn new(core: u32, major: u32, minor: u32, patch: u32) -> Self {
        Self(
            ((core & 0xFF) << 24)
                | ((major & 0xFF) << 16)
                | ((minor & 0xFF) << 8)
                | (patch & 0xFF),
        )
    }

    pub fn core(self) -> u32 {
        (self.0 >> 24) & 0xFF
    }

    pub fn major(self) -> u32 {
        (self.0 >> 16) & 0xFF
    }

    pub fn minor(self) -> u32 {
        (self.0 >> 8) & 0xFF
    }

    pub fn patch(self) -> u32 {
        self.0 & 0xFF
    }

    /// Assemble the chip id from the peripheral id and patch release
    /// registers.
    pub fn read(regs: &dyn RegisterIo, quirks: &PlatformQuirks) -> Self {
        let coreid = regs.read(regs::RBBM_PERIPHID1);
        let majorid = regs.read(regs::RBBM_PERIPHID2);
        let revid = regs.read(regs::RBBM_PATCH_RELEASE);

        let core = match quirks.core_id_override {
            Some(core) => u32::from(core),
            None => coreid & 0xF,
        };
        let major = (majorid >> 4) & 0xF;
        let minor = revid & 0xFF;
        let patch = match quirks.patch_id_override {
            Some(patch) => u32::from(patch),
            None => (revid >> 16) & 0xFF,
        };
        Self::new(core, major, minor, patch)
    }
}

impl fmt::Debug for ChipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChipId({:#010x})", self.0)
    }
}

/// Static description of one supported GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuInfo {
    pub rev: GpuRev,
    pub pm4_fw: &'static str,
    pub pfp_fw: &'static str,
    pub istore_size: u32,
    pub pix_shader_start: u32,
}

struct GpuListEntry {
    core: u32,
    major: u32,
    minor: u32,
    patch: u32,
    info: GpuInfo,
}

const fn entry(
    rev: GpuRev,
    ids: [u32; 4],
    pm4_fw: &'static str,
    pfp_fw: &'static str,
    istore_size: u32,
    pix_shader_start: u32,
) -> GpuListEntry {
    GpuListEntry {
        core: ids[0],
        major: ids[1],
        minor: ids[2],
        patch: ids[3],
        info: GpuInfo {
            rev,
            pm4_fw,
            pfp_fw,
            istore_size,
            pix_shader_start,
        },
    }
}

static GPU_LIST: [GpuListEntry; 6] = [
    entry(GpuRev::A200, [0, 2, ANY_ID, ANY_ID], "yamato_pm4.fw", "yamato_pfp.fw", 512, 384),
    entry(GpuRev::A205, [0, 1, 0, ANY_ID], "yamato_pm4.fw", "yamato_pfp.fw", 512, 384),
    entry(GpuRev::A220, [2, 1, ANY_ID, ANY_ID], "leia_pm4_470.fw", "leia_pfp_470.fw", 512, 384),
    // Patch level 5 parts need their own PM4 microcode.
    entry(GpuRev::A225, [2, 2, 0, 5], "a225p5_pm4.fw", "a225_pfp.fw", 1536, 768),
    entry(GpuRev::A225, [2, 2, 0, 6], "a225_pm4.fw", "a225_pfp.fw", 1536, 768),
    entry(GpuRev::A225, [2, 2, ANY_ID, ANY_ID], "a225_pm4.fw", "a225_pfp.fw", 1536, 768),
];

fn rev_match(id: u32, entry: u32) -> bool {
    entry == ANY_ID || entry == id
}

/// First table entry matching `chip`.
pub fn lookup_gpu(chip: ChipId) -> Option<GpuInfo> {
    GPU_LIST
        .iter()
        .find(|e| {
            chip.core() == e.core
                && rev_match(chip.major(), e.major)
                && rev_match(chip.minor(), e.minor)
                && rev_match(chip.patch(), e.patch)
        })
        .map(|e| e.info)
}

bitflags! {
    /// What an interrupt turned out to be about.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct IrqEvents: u32 {
        /// The CP passed `ref_wait_ts` with comparison enabled.
        const TIMESTAMP = 1 << 0;
        const CP_ERROR = 1 << 1;
        const MMU = 1 << 2;
        const RBBM = 1 << 3;
    }
}

/// Behaviour that differs between GPU families.
pub trait GpuFamily: Send + Sync + fmt::Debug {
    fn rev(&self) -> GpuRev;

    /// Registers whose values together indicate forward progress.
    fn hang_detect_regs(&self) -> &[u32];

    /// `RBBM_STATUS` value of a fully idle core.
    fn idle_status(&self) -> u32 {
        regs::RBBM_STATUS_IDLE
    }

    /// Whether page-table updates must be followed by the VGT prefetch
    /// workaround.
    fn needs_pt_update_workaround(&self) -> bool;

    fn gmem_size(&self) -> u32;

    fn irq_control(&self, regs: &dyn RegisterIo, enable: bool);

    /// Read, decode and acknowledge pending interrupt sources.
    fn irq_handler(&self, regs: &dyn RegisterIo) -> IrqEvents;
}

const A2XX_HANG_DETECT_REGS: [u32; 6] = [
    regs::RBBM_STATUS,
    regs::CP_RB_RPTR,
    regs::CP_IB1_BASE,
    regs::CP_IB1_BUFSZ,
    regs::CP_IB2_BASE,
    regs::CP_IB2_BUFSZ,
];

const RBBM_INT_MASK: u32 = 0x1;

#[derive(Debug, Clone, Copy)]
pub struct A2xxFamily {
    rev: GpuRev,
}

impl A2xxFamily {
    pub fn new(rev: GpuRev) -> Self {
        Self { rev }
    }

    fn cp_irq(&self, regs: &dyn RegisterIo) -> IrqEvents {
        let status = regs.read(regs::CP_INT_STATUS);
        let mut events = IrqEvents::empty();

        if status & regs::CP_INT_ERROR_MASK != 0 {
            error!(cp_int_status = format_args!("{status:#010x}"), "CP error interrupt");
            events |= IrqEvents::CP_ERROR;
        }
        if status & regs::CP_INT_CNTL_RB_INT_MASK != 0 {
            events |= IrqEvents::TIMESTAMP;
        }

        regs.write(regs::CP_INT_ACK, status & regs::CP_INT_MASK);
        events
    }
}

impl GpuFamily for A2xxFamily {
    fn rev(&self) -> GpuRev {
        self.rev
    }

    fn hang_detect_regs(&self) -> &[u32] {
        &A2XX_HANG_DETECT_REGS
    }

    fn needs_pt_update_workaround(&self) -> bool {
        self.rev.is_a20x()
    }

    fn gmem_size(&self) -> u32 {
        if self.rev.is_a22x() {
            512 * 1024
        } else {
            256 * 1024
        }
    }

    fn irq_control(&self, regs: &dyn RegisterIo, enable: bool) {
        if enable {
            regs.write(regs::RBBM_INT_CNTL, RBBM_INT_MASK);
            regs.write(regs::CP_INT_CNTL, regs::CP_INT_MASK);
        } else {
            regs.write(regs::RBBM_INT_CNTL, 0);
            regs.write(regs::CP_INT_CNTL, 0);
        }
    }

    fn irq_handler(&self, regs: &dyn RegisterIo) -> IrqEvents {
        let master = regs.read(regs::MASTER_INT_SIGNAL);
        let mut events = IrqEvents::empty();

        if master & regs::MASTER_INT_SIGNAL_CP_INT_STAT != 0 {
            events |= self.cp_irq(regs);
        }
        if master & regs::MASTER_INT_SIGNAL_MH_INT_STAT != 0 {
            events |= IrqEvents::MMU;
        }
        if master & regs::MASTER_INT_SIGNAL_RBBM_INT_STAT != 0 {
            let status = regs.read(regs::RBBM_INT_STATUS);
            warn!(rbbm_int_status = format_args!("{status:#010x}"), "RBBM interrupt");
            regs.write(regs::RBBM_INT_ACK, status);
            events |= IrqEvents::RBBM;
        }
        events
    }
}

/// Family implementation for a table entry.
pub fn family_for(info: &GpuInfo) -> Box<dyn GpuFamily> {
    Box::new(A2xxFamily::new(info.rev))
}
