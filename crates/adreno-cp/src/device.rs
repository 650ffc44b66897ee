//! The supervised GPU.
//!
//! All mutable device state lives in [`DeviceInner`] behind one mutex. Paths
//! that must drop the lock while blocked take the guard by value and hand it
//! back. A recovery pass keeps the lock for its whole run; entrants that find
//! one in progress wait on the recovery gate before taking the lock.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use adreno_pm4::{regs, Pm4Writer, CONTEXT_NONE};
use bitflags::bitflags;
use tracing::{debug, error, info, warn};

use crate::backend::{
    DiagnosticSink, MapFlags, MemDesc, MmuBackend, PagetableId, PowerControl, PowerState,
    RegisterIo,
};
use crate::config::CpConfig;
use crate::context::{ContextFlags, ContextTable, ResetStatus};
use crate::error::{CpError, CpResult};
use crate::events::{EventCallback, TimestampEvents};
use crate::family::{family_for, lookup_gpu, ChipId, GpuFamily, GpuInfo, IrqEvents};
use crate::memstore::{MemstoreField, SharedStatusBlock, MEMSTORE_SIZE};
use crate::property::{
    DeviceInfo, DeviceRequest, Property, PropertyRequest, ShadowProp, DEVICE_3D0_ID,
    SHADOW_FLAGS_INITIALIZED,
};
use crate::ring::{RingBuffer, RingMemory};
use crate::setstate::{MmuFlags, StateSyncCommandBuilder, MH_MMU_INVALIDATE_ALL_AND_TC};
use crate::stats::{CpStats, CpStatsSnapshot};
use crate::timestamp::{read_timestamp, timestamp_cmp, TimestampKind};
use crate::wake::WakeList;

pub(crate) type DeviceGuard<'a> = MutexGuard<'a, DeviceInner>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Init,
    Active,
    DumpAndRecover,
    Hung,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct CmdFlags: u32 {
        /// Run the payload with memory protection off.
        const PMODE = 1 << 0;
    }
}

/// One client indirect buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IbDesc {
    pub gpuaddr: u32,
    pub size_dwords: u32,
}

/// Device-owned memory every page table maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlobalRegion {
    RingBuffer,
    ReadPointer,
    Memstore,
    Setstate,
}

/// Busy time accumulated since the previous sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PowerStats {
    pub total_time: Duration,
    pub busy_time: Duration,
}

/// Collaborators a device is built from.
pub struct DeviceResources {
    pub regs: Arc<dyn RegisterIo>,
    pub ring: Arc<RingMemory>,
    pub memstore: Arc<SharedStatusBlock>,
    /// Scratch memory for in-band MMU workarounds.
    pub setstate_memory: MemDesc,
    pub mmu: Box<dyn MmuBackend>,
    pub power: Box<dyn PowerControl>,
    pub diagnostics: Box<dyn DiagnosticSink>,
}

pub(crate) struct DeviceInner {
    pub(crate) state: DeviceState,
    pub(crate) requested_state: PowerState,
    pub(crate) ring: RingBuffer,
    pub(crate) contexts: ContextTable,
    pub(crate) active_context: Option<u32>,
    pub(crate) mmu: Box<dyn MmuBackend>,
    pub(crate) power: Box<dyn PowerControl>,
    pub(crate) diagnostics: Box<dyn DiagnosticSink>,
    pub(crate) chip_id: ChipId,
    pub(crate) gpu: Option<GpuInfo>,
    pub(crate) soft_reset_done: bool,
    /// Outcome of the most recent recovery pass.
    pub(crate) last_recovery: CpResult<()>,
    perf_epoch: Option<Instant>,
}

pub struct Device {
    pub(crate) config: CpConfig,
    pub(crate) regs: Arc<dyn RegisterIo>,
    pub(crate) memstore: Arc<SharedStatusBlock>,
    setstate_memory: MemDesc,
    inner: Mutex<DeviceInner>,
    family: RwLock<Option<Arc<dyn GpuFamily>>>,
    pub(crate) timestamp_waiters: WakeList,
    pub(crate) recovery_gate: WakeList,
    /// Set for the duration of a pass so that entrants can wait on the gate
    /// without queueing on the device lock.
    pub(crate) recovering: AtomicBool,
    pub(crate) recovery_generation: AtomicU64,
    pub(crate) events: TimestampEvents,
    pub(crate) stats: CpStats,
    active_count: AtomicU32,
    pub(crate) io_count: AtomicU32,
    pub(crate) wait_timeout_ms: AtomicU32,
    pub(crate) fast_hang_detect: AtomicBool,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("state", &self.state())
            .field("family", &self.family())
            .finish_non_exhaustive()
    }
}

/// Marks a public operation as in progress for [`Device::is_idle`].
pub(crate) struct ActiveGuard<'a>(&'a AtomicU32);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Device {
    pub fn new(config: CpConfig, resources: DeviceResources) -> CpResult<Self> {
        config.validate()?;
        if resources.ring.size_dwords() != config.ring_size_dwords {
            return Err(CpError::InvalidArgument(format!(
                "ring memory holds {} dwords, config expects {}",
                resources.ring.size_dwords(),
                config.ring_size_dwords
            )));
        }
        if resources.memstore.desc().size < MEMSTORE_SIZE {
            return Err(CpError::InvalidArgument(format!(
                "shared status block of {} bytes is too small",
                resources.memstore.desc().size
            )));
        }

        let ring = RingBuffer::new(
            resources.ring,
            resources.regs.clone(),
            resources.memstore.field_gpuaddr(MemstoreField::EopTimestamp),
            config.idle_timeout(),
        );

        Ok(Self {
            wait_timeout_ms: AtomicU32::new(config.wait_timeout_ms),
            fast_hang_detect: AtomicBool::new(config.fast_hang_detect),
            config,
            regs: resources.regs,
            memstore: resources.memstore,
            setstate_memory: resources.setstate_memory,
            inner: Mutex::new(DeviceInner {
                state: DeviceState::Init,
                requested_state: PowerState::None,
                ring,
                contexts: ContextTable::new(),
                active_context: None,
                mmu: resources.mmu,
                power: resources.power,
                diagnostics: resources.diagnostics,
                chip_id: ChipId(0),
                gpu: None,
                soft_reset_done: false,
                last_recovery: Ok(()),
                perf_epoch: None,
            }),
            family: RwLock::new(None),
            timestamp_waiters: WakeList::new(),
            recovery_gate: WakeList::new(),
            recovering: AtomicBool::new(false),
            recovery_generation: AtomicU64::new(0),
            events: TimestampEvents::default(),
            stats: CpStats::new(),
            active_count: AtomicU32::new(0),
            io_count: AtomicU32::new(0),
        })
    }

    pub(crate) fn lock(&self) -> DeviceGuard<'_> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn family(&self) -> Option<Arc<dyn GpuFamily>> {
        let family = match self.family.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        family.clone()
    }

    fn set_family(&self, family: Arc<dyn GpuFamily>) {
        let mut slot = match self.family.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(family);
    }

    pub(crate) fn begin_active(&self) -> ActiveGuard<'_> {
        self.active_count.fetch_add(1, Ordering::AcqRel);
        ActiveGuard(&self.active_count)
    }

    pub fn config(&self) -> &CpConfig {
        &self.config
    }

    pub fn state(&self) -> DeviceState {
        self.lock().state
    }

    pub fn stats(&self) -> CpStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn memstore(&self) -> &Arc<SharedStatusBlock> {
        &self.memstore
    }

    /// Number of recovery passes run so far, successful or not.
    pub fn recovery_generation(&self) -> u64 {
        self.recovery_generation.load(Ordering::Acquire)
    }

    pub fn wait_timeout_ms(&self) -> u32 {
        self.wait_timeout_ms.load(Ordering::Relaxed)
    }

    /// Default budget for [`Device::wait_timestamp`]; 0 waits until the
    /// timestamp retires or a hang is detected.
    pub fn set_wait_timeout_ms(&self, ms: u32) {
        self.wait_timeout_ms.store(ms, Ordering::Relaxed);
    }

    pub fn fast_hang_detect(&self) -> bool {
        self.fast_hang_detect.load(Ordering::Relaxed)
    }

    pub fn set_fast_hang_detect(&self, enabled: bool) {
        self.fast_hang_detect.store(enabled, Ordering::Relaxed);
    }

    // ---------------------------------------------------------------------
    // Start / stop

    /// Power up, identify and reset the GPU, then start the ring.
    ///
    /// Starting a hung device stops it first, which is the only way out of
    /// [`DeviceState::Hung`].
    pub fn start(&self, init_ram: bool) -> CpResult<()> {
        let mut inner = self.lock();
        match inner.state {
            DeviceState::Active if inner.ring.is_started() => return Ok(()),
            DeviceState::Hung => self.stop_locked(&mut inner),
            _ => {}
        }
        self.start_locked(&mut inner, init_ram)
    }

    pub fn stop(&self) {
        let mut inner = self.lock();
        self.stop_locked(&mut inner);
    }

    pub(crate) fn start_locked(&self, inner: &mut DeviceInner, init_ram: bool) -> CpResult<()> {
        let regs = &*self.regs;
        if inner.state != DeviceState::DumpAndRecover {
            inner.state = DeviceState::Init;
        }

        inner.power.enable().map_err(CpError::Power)?;

        let chip_id = ChipId::read(regs, &self.config.platform);
        let Some(gpu) = lookup_gpu(chip_id) else {
            error!(?chip_id, "unknown chip id");
            inner.power.disable();
            return Err(CpError::UnknownChip { chip_id: chip_id.0 });
        };
        let family: Arc<dyn GpuFamily> = Arc::from(family_for(&gpu));
        self.set_family(family.clone());
        inner.chip_id = chip_id;
        inner.gpu = Some(gpu);

        regs.write(regs::MH_ARBITER_CONFIG, regs::MH_ARBITER_CONFIG_DEFAULT);
        if !gpu.rev.is_a20x() {
            if self.config.mh_intf_cfg1 != 0 {
                regs.write(regs::MH_CLNT_INTF_CTRL_CONFIG1, self.config.mh_intf_cfg1);
            }
            if self.config.mh_intf_cfg2 != 0 {
                regs.write(regs::MH_CLNT_INTF_CTRL_CONFIG2, self.config.mh_intf_cfg2);
            }
        }
        regs.write(regs::MH_MMU_MPU_BASE, self.config.mpu_base);
        regs.write(
            regs::MH_MMU_MPU_END,
            self.config.mpu_base.wrapping_add(self.config.mpu_range),
        );

        if let Err(err) = inner.mmu.start(regs) {
            error!(%err, "MMU start failed");
            inner.power.disable();
            return Err(CpError::Mmu(err));
        }

        regs.write(regs::RBBM_PM_OVERRIDE1, 0xFFFF_FFFE);
        regs.write(regs::RBBM_PM_OVERRIDE2, 0xFFFF_FFFF);

        // A22x parts only get a full reset the first time; afterwards the CP
        // alone is reset.
        if !inner.soft_reset_done || !gpu.rev.is_a22x() {
            regs.write(regs::RBBM_SOFT_RESET, 0xFFFF_FFFF);
            inner.soft_reset_done = true;
        } else {
            regs.write(regs::RBBM_SOFT_RESET, 0x0000_0001);
        }
        thread::sleep(self.config.soft_reset_settle());
        regs.write(regs::RBBM_SOFT_RESET, 0);

        regs.write(regs::RBBM_CNTL, regs::RBBM_CNTL_DEFAULT);
        if gpu.rev.is_a225() {
            regs.write(regs::SQ_FLOW_CONTROL, regs::SQ_FLOW_CONTROL_A225);
        }
        regs.write(regs::SQ_VS_PROGRAM, 0);
        regs.write(regs::SQ_PS_PROGRAM, 0);

        regs.write(regs::RBBM_PM_OVERRIDE1, self.config.platform.pm_override1);
        regs.write(
            regs::RBBM_PM_OVERRIDE2,
            if gpu.rev.is_a22x() { 0x80 } else { 0 },
        );

        self.memstore.reset();

        regs.write(regs::RBBM_DEBUG, regs::RBBM_DEBUG_IGNORE_RTR);
        regs.write(regs::RBBM_INT_CNTL, 0);
        regs.write(regs::CP_INT_CNTL, 0);
        regs.write(regs::SQ_INT_CNTL, 0);

        let gmem_size = family.gmem_size();
        if self.config.gmem_base & (gmem_size - 1) != 0 {
            error!(
                gmem_base = format_args!("{:#x}", self.config.gmem_base),
                gmem_size, "GMEM base is not aligned to its size"
            );
            inner.mmu.stop(regs);
            inner.power.disable();
            return Err(CpError::InvalidArgument(format!(
                "gmem_base {:#x} not aligned to {gmem_size:#x}",
                self.config.gmem_base
            )));
        }
        regs.write(
            regs::RB_EDRAM_INFO,
            regs::rb_edram_info(gmem_size, self.config.gmem_base),
        );

        inner.power.irq(true);
        family.irq_control(regs, true);

        inner.ring.start(init_ram);

        if inner.state != DeviceState::DumpAndRecover {
            inner.state = DeviceState::Active;
        }
        info!(?chip_id, rev = gpu.rev.as_u32(), "GPU started");
        Ok(())
    }

    pub(crate) fn stop_locked(&self, inner: &mut DeviceInner) {
        inner.active_context = None;
        inner.ring.stop();
        inner.mmu.stop(&*self.regs);
        if let Some(family) = self.family() {
            family.irq_control(&*self.regs, false);
        }
        inner.power.irq(false);
        inner.power.disable();
        if inner.state != DeviceState::DumpAndRecover {
            inner.state = DeviceState::Init;
        }
    }

    // ---------------------------------------------------------------------
    // Submission

    pub(crate) fn issue_cmds_locked(
        &self,
        inner: &mut DeviceInner,
        context_id: u32,
        flags: CmdFlags,
        payload: &[u32],
    ) -> CpResult<u32> {
        if inner.state == DeviceState::Hung {
            return Err(CpError::DeviceHung);
        }
        let timestamp = inner
            .ring
            .enqueue(context_id, flags.contains(CmdFlags::PMODE), payload)?;
        self.memstore.write(MemstoreField::SopTimestamp, timestamp);
        self.stats.inc_doorbells();
        Ok(timestamp)
    }

    /// Submit driver-generated commands on behalf of the active context.
    pub fn issue_cmds(&self, flags: CmdFlags, payload: &[u32]) -> CpResult<u32> {
        let mut inner = self.lock();
        let context_id = inner.active_context.unwrap_or(CONTEXT_NONE);
        self.issue_cmds_locked(&mut inner, context_id, flags, payload)
    }

    /// Submit client indirect buffers. Returns the timestamp that retires
    /// once they have executed.
    pub fn issue_ib_cmds(&self, context_id: u32, ibs: &[IbDesc]) -> CpResult<u32> {
        if ibs.is_empty() {
            return Err(CpError::InvalidArgument("no indirect buffers".into()));
        }
        let _active = self.begin_active();
        let mut inner = self.lock();
        match inner.state {
            DeviceState::Hung => return Err(CpError::DeviceHung),
            DeviceState::Init => return Err(CpError::NotStarted),
            DeviceState::Active | DeviceState::DumpAndRecover => {}
        }
        let ctx = inner
            .contexts
            .get(context_id)
            .ok_or_else(|| CpError::InvalidArgument(format!("unknown context {context_id}")))?;
        if ctx.is_hung() {
            warn!(context_id, "rejecting submission from hung context");
            return Err(CpError::ContextHung { context_id });
        }

        self.drawctxt_switch(&mut inner, Some(context_id))?;

        let mut w = Pm4Writer::with_capacity(ibs.len() * 3);
        for ib in ibs {
            w.indirect_buffer(ib.gpuaddr, ib.size_dwords);
        }
        let timestamp =
            self.issue_cmds_locked(&mut inner, context_id, CmdFlags::empty(), w.as_words())?;
        self.stats.inc_submissions();
        debug!(context_id, timestamp, ibs = ibs.len(), "issued indirect buffers");
        Ok(timestamp)
    }

    // ---------------------------------------------------------------------
    // Contexts

    pub fn create_context(&self, pagetable: PagetableId) -> CpResult<u32> {
        let mut inner = self.lock();
        if inner.state == DeviceState::Hung {
            return Err(CpError::DeviceHung);
        }
        let id = inner.contexts.create(pagetable);
        debug!(context_id = id, pagetable = pagetable.0, "created context");
        Ok(id)
    }

    pub fn destroy_context(&self, context_id: u32) -> CpResult<()> {
        let mut inner = self.lock();
        if inner.contexts.get(context_id).is_none() {
            return Err(CpError::InvalidArgument(format!("unknown context {context_id}")));
        }
        if inner.active_context == Some(context_id) {
            if let Err(err) = self.drawctxt_switch(&mut inner, None) {
                warn!(context_id, %err, "failed to switch away from destroyed context");
                inner.active_context = None;
            }
        }
        inner.contexts.destroy(context_id);
        drop(inner);

        self.events.cancel_owner(context_id, self.read_timestamp(TimestampKind::Retired));
        debug!(context_id, "destroyed context");
        Ok(())
    }

    pub fn context_reset_status(&self, context_id: u32) -> CpResult<ResetStatus> {
        self.lock()
            .contexts
            .get(context_id)
            .map(|ctx| ctx.reset_status)
            .ok_or_else(|| CpError::InvalidArgument(format!("unknown context {context_id}")))
    }

    pub fn context_flags(&self, context_id: u32) -> CpResult<ContextFlags> {
        self.lock()
            .contexts
            .get(context_id)
            .map(|ctx| ctx.flags)
            .ok_or_else(|| CpError::InvalidArgument(format!("unknown context {context_id}")))
    }

    /// Make `target` the active context, switching page tables as needed and
    /// publishing it in the shared status block in ring order.
    pub(crate) fn drawctxt_switch(
        &self,
        inner: &mut DeviceInner,
        target: Option<u32>,
    ) -> CpResult<()> {
        if inner.active_context == target {
            return Ok(());
        }
        let current_context = self.memstore.field_gpuaddr(MemstoreField::CurrentContext);

        match target {
            Some(id) => {
                let ctx = inner
                    .contexts
                    .get(id)
                    .ok_or_else(|| CpError::InvalidArgument(format!("unknown context {id}")))?;
                let (pagetable, bin_base_offset) = (ctx.pagetable, ctx.bin_base_offset);

                inner.active_context = Some(id);
                if inner.mmu.switch(pagetable).map_err(CpError::Mmu)? {
                    self.setstate_locked(inner, MmuFlags::PT_UPDATE | MmuFlags::TLB_FLUSH)?;
                }

                let mut w = Pm4Writer::with_capacity(8);
                w.mem_write(current_context, id);
                if let Some(offset) = bin_base_offset {
                    w.set_bin_base_offset(offset);
                }
                self.issue_cmds_locked(inner, id, CmdFlags::empty(), w.as_words())?;
            }
            None => {
                inner.active_context = None;
                if inner.mmu.switch(PagetableId::default()).map_err(CpError::Mmu)? {
                    self.setstate_locked(inner, MmuFlags::PT_UPDATE | MmuFlags::TLB_FLUSH)?;
                }

                let mut w = Pm4Writer::with_capacity(4);
                w.mem_write(current_context, 0);
                self.issue_cmds_locked(inner, CONTEXT_NONE, CmdFlags::empty(), w.as_words())?;
            }
        }
        Ok(())
    }

    /// Switch to no context and wait for the GPU to go idle.
    pub fn suspend_context(&self) -> CpResult<()> {
        let _active = self.begin_active();
        let mut inner = self.lock();
        if inner.state != DeviceState::Active {
            return Ok(());
        }
        self.drawctxt_switch(&mut inner, None)?;
        let (_inner, res) = self.idle_locked(inner);
        res
    }

    // ---------------------------------------------------------------------
    // MMU state

    /// Tell the GPU about a page-table change.
    pub fn setstate(&self, flags: MmuFlags) -> CpResult<()> {
        let mut inner = self.lock();
        self.setstate_locked(&mut inner, flags)
    }

    pub(crate) fn setstate_locked(&self, inner: &mut DeviceInner, flags: MmuFlags) -> CpResult<()> {
        if flags.is_empty() {
            return Ok(());
        }
        let family = self.family().ok_or(CpError::NotStarted)?;
        let pt_base = inner.mmu.hw_pagetable_base();

        match inner.active_context {
            Some(context_id) if !self.config.direct_register_setstate => {
                let builder = StateSyncCommandBuilder {
                    pt_base,
                    pt_update_workaround: family.needs_pt_update_workaround(),
                    scratch_gpuaddr: self.setstate_memory.gpuaddr,
                    context_bin_base_offset: inner
                        .contexts
                        .get(context_id)
                        .and_then(|ctx| ctx.bin_base_offset),
                };
                let words = builder.build(flags);
                self.issue_cmds_locked(inner, context_id, CmdFlags::PMODE, &words)?;
            }
            _ => {
                // Nothing may be in flight while the MMU is reprogrammed
                // underneath it.
                if let Err(err) = self.idle_once(inner, &*family) {
                    error!(%err, "GPU did not idle before MMU update");
                    return Err(CpError::Timeout);
                }
                if flags.contains(MmuFlags::PT_UPDATE) {
                    self.regs.write(regs::MH_MMU_PT_BASE, pt_base);
                }
                if flags.contains(MmuFlags::TLB_FLUSH) {
                    self.regs
                        .write(regs::MH_MMU_INVALIDATE, MH_MMU_INVALIDATE_ALL_AND_TC);
                }
            }
        }

        if flags.contains(MmuFlags::TLB_FLUSH) {
            inner.mmu.invalidate();
        }
        Ok(())
    }

    fn global_mappings(&self, inner: &DeviceInner) -> [(GlobalRegion, MemDesc, MapFlags); 4] {
        let ring = inner.ring.memory();
        [
            (GlobalRegion::RingBuffer, *ring.buffer_desc(), MapFlags::READ),
            (
                GlobalRegion::ReadPointer,
                *ring.memptrs_desc(),
                MapFlags::READ | MapFlags::WRITE,
            ),
            (
                GlobalRegion::Memstore,
                *self.memstore.desc(),
                MapFlags::READ | MapFlags::WRITE,
            ),
            (
                GlobalRegion::Setstate,
                self.setstate_memory,
                MapFlags::READ | MapFlags::WRITE,
            ),
        ]
    }

    /// Map device-owned memory into a new page table.
    pub fn setup_pt(&self, pagetable: PagetableId) -> CpResult<()> {
        let mut inner = self.lock();
        let mappings = self.global_mappings(&inner);
        for (i, (region, mem, flags)) in mappings.iter().enumerate() {
            if let Err(err) = inner.mmu.map_global(pagetable, mem, *flags) {
                error!(pagetable = pagetable.0, ?region, %err, "global mapping failed");
                for (_, mapped, _) in mappings[..i].iter().rev() {
                    inner.mmu.unmap(pagetable, mapped);
                }
                return Err(CpError::Mmu(err));
            }
        }
        Ok(())
    }

    pub fn cleanup_pt(&self, pagetable: PagetableId) {
        let mut inner = self.lock();
        let mappings = self.global_mappings(&inner);
        for (_, mem, _) in mappings.iter().rev() {
            inner.mmu.unmap(pagetable, mem);
        }
    }

    /// Device-owned region fully containing `[gpuaddr, gpuaddr + size)`.
    pub fn find_region(&self, gpuaddr: u32, size: u32) -> Option<GlobalRegion> {
        let inner = self.lock();
        self.global_mappings(&inner)
            .into_iter()
            .find(|(_, mem, _)| mem.contains(gpuaddr, size))
            .map(|(region, _, _)| region)
    }

    // ---------------------------------------------------------------------
    // Timestamps and events

    pub fn read_timestamp(&self, kind: TimestampKind) -> u32 {
        read_timestamp(&*self.regs, &self.memstore, kind)
    }

    pub(crate) fn timestamp_retired(&self, timestamp: u32) -> bool {
        timestamp_cmp(self.read_timestamp(TimestampKind::Retired), timestamp) >= 0
    }

    /// Last timestamp handed out to a submission.
    pub fn last_submitted_timestamp(&self) -> u32 {
        self.lock().ring.timestamp()
    }

    /// Run `callback` once `timestamp` retires. Events owned by a context are
    /// fired early when it is destroyed.
    pub fn add_event(
        &self,
        timestamp: u32,
        owner: Option<u32>,
        callback: EventCallback,
    ) -> CpResult<()> {
        let last = self.last_submitted_timestamp();
        if timestamp_cmp(timestamp, last) > 0 {
            return Err(CpError::InvalidArgument(format!(
                "event timestamp {timestamp} is newer than last submitted {last}"
            )));
        }
        self.events.add(timestamp, owner, callback);
        // Arms the interrupt if the timestamp is still pending.
        if self.check_interrupt_timestamp(timestamp) {
            self.events.process(self.read_timestamp(TimestampKind::Retired));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Interrupts

    /// Service the GPU interrupt line. Must not be called with the device
    /// lock held by the calling thread.
    pub fn handle_irq(&self) -> IrqEvents {
        let Some(family) = self.family() else {
            return IrqEvents::empty();
        };
        let events = family.irq_handler(&*self.regs);
        self.stats.inc_interrupts();

        if events.contains(IrqEvents::TIMESTAMP) {
            self.memstore.write(MemstoreField::TsCmpEnable, 0);
            self.timestamp_waiters.wake_all();
            self.events.process(self.read_timestamp(TimestampKind::Retired));
        }
        events
    }

    // ---------------------------------------------------------------------
    // Queries

    /// `0x0003 << 16 | rev` once the GPU has been identified.
    pub fn gpu_id(&self) -> u32 {
        self.lock()
            .gpu
            .map(|gpu| (0x0003 << 16) | gpu.rev.as_u32())
            .unwrap_or(0)
    }

    pub fn is_idle(&self) -> bool {
        let inner = self.lock();
        if inner.state != DeviceState::Active {
            return true;
        }
        if self.active_count.load(Ordering::Acquire) != 0 || !inner.ring.is_drained() {
            return false;
        }
        match self.family() {
            Some(family) => self.regs.read(regs::RBBM_STATUS) == family.idle_status(),
            None => true,
        }
    }

    pub fn get_property(&self, request: PropertyRequest) -> Property {
        let inner = self.lock();
        match request {
            PropertyRequest::DeviceInfo => Property::DeviceInfo(DeviceInfo {
                device_id: DEVICE_3D0_ID,
                chip_id: inner.chip_id.0,
                mmu_enabled: inner.mmu.enabled(),
                gpu_id: inner.gpu.map(|gpu| gpu.rev.as_u32()).unwrap_or(0),
                gmem_gpubaseaddr: self.config.gmem_base,
                gmem_sizebytes: self.family().map(|f| f.gmem_size()).unwrap_or(0),
            }),
            PropertyRequest::DeviceShadow => {
                let desc = self.memstore.desc();
                Property::DeviceShadow(ShadowProp {
                    gpuaddr: desc.physaddr,
                    size: desc.size,
                    flags: SHADOW_FLAGS_INITIALIZED,
                })
            }
            PropertyRequest::MmuEnable => Property::MmuEnable(inner.mmu.enabled()),
            PropertyRequest::InterruptWaits => Property::InterruptWaits(true),
        }
    }

    pub fn ioctl(&self, request: DeviceRequest) -> CpResult<()> {
        match request {
            DeviceRequest::SetBinBaseOffset { context_id, offset } => {
                let mut inner = self.lock();
                let ctx = inner.contexts.get_mut(context_id).ok_or_else(|| {
                    CpError::InvalidArgument(format!("unknown context {context_id}"))
                })?;
                ctx.bin_base_offset = Some(offset);
                Ok(())
            }
        }
    }

    pub fn request_state(&self, state: PowerState) {
        let mut inner = self.lock();
        inner.requested_state = state;
        inner.power.request_state(state);
    }

    pub fn requested_state(&self) -> PowerState {
        self.lock().requested_state
    }

    /// Sample the busy-cycle counter and restart it.
    ///
    /// The first call only arms the counter and reports zero.
    pub fn power_stats(&self, gpu_freq_hz: u32) -> PowerStats {
        let regs = &*self.regs;
        let mut inner = self.lock();
        let now = Instant::now();

        let stats = match inner.perf_epoch {
            Some(epoch) => {
                regs.write(
                    regs::CP_PERFMON_CNTL,
                    regs::PERFMON_MODE_COUNT | regs::PERFMON_STATE_FREEZE,
                );
                let cycles = u64::from(regs.read(regs::RBBM_PERFCOUNTER1_LO));
                regs.write(
                    regs::CP_PERFMON_CNTL,
                    regs::PERFMON_MODE_COUNT | regs::PERFMON_STATE_RESET,
                );
                let mhz = u64::from((gpu_freq_hz / 1_000_000).max(1));
                PowerStats {
                    total_time: now.duration_since(epoch),
                    busy_time: Duration::from_micros(cycles / mhz),
                }
            }
            None => PowerStats::default(),
        };
        inner.perf_epoch = Some(now);

        let override2 = regs.read(regs::RBBM_PM_OVERRIDE2);
        regs.write(
            regs::RBBM_PM_OVERRIDE2,
            override2 | regs::RBBM_PM_OVERRIDE2_PERF_CLK,
        );
        regs.write(regs::RBBM_PERFCOUNTER1_SELECT, regs::RBBM_PERF_EVENT_BUSY);
        regs.write(
            regs::CP_PERFMON_CNTL,
            regs::PERFMON_MODE_COUNT | regs::PERFMON_STATE_ENABLE,
        );
        stats
    }
}
