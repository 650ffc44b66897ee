//! Boundaries between the supervision layer and the rest of the driver.
//!
//! Fallible backends report failures as `Err(String)`; the device wraps them
//! into [`crate::CpError`] and logs them.

use bitflags::bitflags;

/// Register window of the GPU.
///
/// Both methods may be called concurrently from waiter threads sampling hang
/// registers and from the interrupt path.
pub trait RegisterIo: Send + Sync {
    fn read(&self, offset: u32) -> u32;
    fn write(&self, offset: u32, value: u32);
}

/// A GPU-visible memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemDesc {
    pub gpuaddr: u32,
    pub physaddr: u64,
    pub size: u32,
}

impl MemDesc {
    pub fn contains(&self, gpuaddr: u32, size: u32) -> bool {
        let start = u64::from(self.gpuaddr);
        let end = start + u64::from(self.size);
        let addr = u64::from(gpuaddr);
        addr >= start && addr + u64::from(size) <= end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PagetableId(pub u32);

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// Page-table and TLB management.
pub trait MmuBackend: Send {
    fn enabled(&self) -> bool;

    /// Program the MMU after a reset.
    fn start(&mut self, regs: &dyn RegisterIo) -> Result<(), String>;

    fn stop(&mut self, regs: &dyn RegisterIo);

    /// Make `pagetable` the current page table.
    ///
    /// Returns `true` when the hardware page table changed and the GPU must
    /// be told about it.
    fn switch(&mut self, pagetable: PagetableId) -> Result<bool, String>;

    /// Base address of the hardware page table currently selected.
    fn hw_pagetable_base(&self) -> u32;

    /// Drop any TLB state cached on the CPU side after a flush.
    fn invalidate(&mut self);

    fn map_global(
        &mut self,
        pagetable: PagetableId,
        mem: &MemDesc,
        flags: MapFlags,
    ) -> Result<(), String>;

    fn unmap(&mut self, pagetable: PagetableId, mem: &MemDesc);
}

/// Low-power states the core may ask the power controller for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PowerState {
    #[default]
    None,
    Nap,
    Sleep,
    Slumber,
}

pub trait PowerControl: Send {
    /// Turn on clocks and rails.
    fn enable(&mut self) -> Result<(), String>;

    fn disable(&mut self);

    fn request_state(&mut self, state: PowerState);

    /// Gate the interrupt line at the interrupt controller.
    fn irq(&mut self, enabled: bool);
}

/// State captured when a hang is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaultInfo {
    /// Indirect buffer being fetched at the time of the hang, 0 if none.
    pub ib1: u32,
    pub context_id: u32,
    /// Last timestamp the GPU retired.
    pub global_eop: u32,
    pub rptr: u32,
    pub wptr: u32,
    /// Last timestamp software submitted.
    pub timestamp: u32,
}

/// Postmortem reporting. Both hooks are best-effort.
pub trait DiagnosticSink: Send {
    fn dump_postmortem(&mut self, fault: &FaultInfo, regs: &dyn RegisterIo) -> Result<(), String>;

    /// Richer structured snapshot, given the ring contents in submission order.
    fn snapshot(&mut self, fault: &FaultInfo, ring: &[u32]) -> Result<(), String>;
}

/// MMU backend for configurations with the MMU disabled: every context runs
/// on the physical address space.
#[derive(Debug, Default)]
pub struct NoMmu;

impl MmuBackend for NoMmu {
    fn enabled(&self) -> bool {
        false
    }

    fn start(&mut self, _regs: &dyn RegisterIo) -> Result<(), String> {
        Ok(())
    }

    fn stop(&mut self, _regs: &dyn RegisterIo) {}

    fn switch(&mut self, _pagetable: PagetableId) -> Result<bool, String> {
        Ok(false)
    }

    fn hw_pagetable_base(&self) -> u32 {
        0
    }

    fn invalidate(&mut self) {}

    fn map_global(
        &mut self,
        _pagetable: PagetableId,
        _mem: &MemDesc,
        _flags: MapFlags,
    ) -> Result<(), String> {
        Ok(())
    }

    fn unmap(&mut self, _pagetable: PagetableId, _mem: &MemDesc) {}
}

/// Power controller for always-on parts.
#[derive(Debug, Default)]
pub struct NullPowerControl;

impl PowerControl for NullPowerControl {
    fn enable(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn disable(&mut self) {}

    fn request_state(&mut self, _state: PowerState) {}

    fn irq(&mut self, _enabled: bool) {}
}

/// Diagnostic sink that only logs the fault summary.
#[derive(Debug, Default)]
pub struct LogDiagnosticSink;

impl DiagnosticSink for LogDiagnosticSink {
    fn dump_postmortem(&mut self, fault: &FaultInfo, _regs: &dyn RegisterIo) -> Result<(), String> {
        tracing::error!(
            ib1 = format_args!("{:#x}", fault.ib1),
            context_id = fault.context_id,
            global_eop = fault.global_eop,
            rptr = fault.rptr,
            wptr = fault.wptr,
            timestamp = fault.timestamp,
            "GPU postmortem"
        );
        Ok(())
    }

    fn snapshot(&mut self, _fault: &FaultInfo, ring: &[u32]) -> Result<(), String> {
        tracing::debug!(ring_dwords = ring.len(), "GPU snapshot captured");
        Ok(())
    }
}
