//! Shared helpers for `adreno-cp` integration tests.
//!
//! [`SimGpu`] stands in for the register window and the command processor.
//! It executes ring frames on a worker thread as the doorbell advances
//! `CP_RB_WPTR`, writes timestamps into the shared status block and raises
//! the timestamp interrupt into the attached device. An indirect buffer
//! registered with [`SimGpu::hang_on_ib`] freezes it until the next soft
//! reset.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::Duration;

use adreno_cp::{
    timestamp_cmp, CpConfig, CpResult, Device, DeviceResources, FaultInfo, IbDesc, MapFlags,
    MemDesc, MemstoreField, MmuBackend, NoMmu, NullPowerControl, PagetableId, RegisterIo,
    RingMemory, SharedStatusBlock,
};
use adreno_pm4::packets::CACHE_FLUSH_TS;
use adreno_pm4::{decode_header, regs, Pm4Header, Pm4Opcode};
use crossbeam_channel::{unbounded, Receiver, Sender};

pub const RING_GPUADDR: u32 = 0x0010_0000;
pub const MEMPTRS_GPUADDR: u32 = 0x0020_0000;
pub const MEMSTORE_GPUADDR: u32 = 0x0030_0000;
pub const SETSTATE_GPUADDR: u32 = 0x0040_0000;
pub const RING_DWORDS: u32 = 1024;

const BUSY_STATUS: u32 = 0x8000_0110;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Short intervals so hang detection fires within tens of milliseconds.
pub fn test_config() -> CpConfig {
    CpConfig {
        idle_timeout_ms: 2_000,
        timeout_part_ms: 10,
        first_wait_ms: 20,
        short_wait_ms: 5,
        soft_reset_settle_ms: 1,
        ring_size_dwords: RING_DWORDS,
        ..CpConfig::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chip {
    A205,
    A225,
}

#[derive(Debug, Default)]
struct CpState {
    halted: bool,
    frozen: bool,
    recoverable: bool,
    hang_ibs: HashSet<u32>,
    exec_delay: Duration,
    executed_ibs: Vec<u32>,
    soft_resets: u32,
}

pub struct SimGpu {
    regs: Mutex<HashMap<u32, u32>>,
    cp: Mutex<CpState>,
    ring: Arc<RingMemory>,
    memstore: Arc<SharedStatusBlock>,
    device: Mutex<Weak<Device>>,
    doorbell: Sender<()>,
    accesses: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SimGpu {
    pub fn new(chip: Chip, ring: Arc<RingMemory>, memstore: Arc<SharedStatusBlock>) -> Arc<Self> {
        let mut regs = HashMap::new();
        match chip {
            Chip::A205 => {
                regs.insert(regs::RBBM_PERIPHID1, 0);
                regs.insert(regs::RBBM_PERIPHID2, 1 << 4);
                regs.insert(regs::RBBM_PATCH_RELEASE, 0);
            }
            Chip::A225 => {
                regs.insert(regs::RBBM_PERIPHID1, 2);
                regs.insert(regs::RBBM_PERIPHID2, 2 << 4);
                regs.insert(regs::RBBM_PATCH_RELEASE, 6 << 16);
            }
        }

        let (tx, rx) = unbounded();
        let sim = Arc::new(Self {
            regs: Mutex::new(regs),
            cp: Mutex::new(CpState {
                recoverable: true,
                ..CpState::default()
            }),
            ring,
            memstore,
            device: Mutex::new(Weak::new()),
            doorbell: tx,
            accesses: AtomicU64::new(0),
        });
        let weak = Arc::downgrade(&sim);
        thread::spawn(move || worker(weak, rx));
        sim
    }

    pub fn attach(&self, device: &Arc<Device>) {
        *lock(&self.device) = Arc::downgrade(device);
    }

    /// Freeze the CP when it reaches an indirect buffer at `gpuaddr`.
    pub fn hang_on_ib(&self, gpuaddr: u32) {
        lock(&self.cp).hang_ibs.insert(gpuaddr);
    }

    /// Whether a soft reset unfreezes the CP.
    pub fn set_recoverable(&self, recoverable: bool) {
        lock(&self.cp).recoverable = recoverable;
    }

    /// Time each indirect buffer takes to execute.
    pub fn set_exec_delay(&self, delay: Duration) {
        lock(&self.cp).exec_delay = delay;
    }

    pub fn is_frozen(&self) -> bool {
        lock(&self.cp).frozen
    }

    pub fn executed_ibs(&self) -> Vec<u32> {
        lock(&self.cp).executed_ibs.clone()
    }

    pub fn soft_resets(&self) -> u32 {
        lock(&self.cp).soft_resets
    }

    pub fn reg(&self, offset: u32) -> u32 {
        lock(&self.regs).get(&offset).copied().unwrap_or(0)
    }

    /// Register accesses made through [`RegisterIo`].
    pub fn accesses(&self) -> u64 {
        self.accesses.load(Ordering::SeqCst)
    }

    /// Set a register behind the device's back.
    pub fn poke(&self, offset: u32, value: u32) {
        self.set_reg(offset, value);
    }

    fn set_reg(&self, offset: u32, value: u32) {
        lock(&self.regs).insert(offset, value);
    }

    fn soft_reset(&self) {
        let mut cp = lock(&self.cp);
        cp.soft_resets += 1;
        if cp.frozen && cp.recoverable {
            cp.frozen = false;
            drop(cp);
            let mut regs = lock(&self.regs);
            for reg in [
                regs::CP_IB1_BASE,
                regs::CP_IB1_BUFSZ,
                regs::CP_IB2_BASE,
                regs::CP_IB2_BUFSZ,
            ] {
                regs.insert(reg, 0);
            }
        }
    }

    fn raise_timestamp_irq(&self) {
        {
            let mut regs = lock(&self.regs);
            if regs.get(&regs::CP_INT_CNTL).copied().unwrap_or(0) & regs::CP_INT_CNTL_RB_INT_MASK
                == 0
            {
                return;
            }
            *regs.entry(regs::CP_INT_STATUS).or_insert(0) |= regs::CP_INT_CNTL_RB_INT_MASK;
            *regs.entry(regs::MASTER_INT_SIGNAL).or_insert(0) |=
                regs::MASTER_INT_SIGNAL_CP_INT_STAT;
        }
        let device = lock(&self.device).upgrade();
        if let Some(device) = device {
            device.handle_irq();
        }
    }

    /// Execute packets until the ring is empty, the CP halts or it freezes.
    fn run(&self) {
        let mask = self.ring.size_dwords() - 1;
        loop {
            let wptr = self.reg(regs::CP_RB_WPTR) & mask;
            let rptr = self.ring.rptr();
            {
                let cp = lock(&self.cp);
                if cp.halted || cp.frozen || rptr == wptr {
                    return;
                }
            }

            let Ok(header) = decode_header(self.ring.word(rptr)) else {
                // Not a packet header; step over it.
                self.ring.set_rptr(rptr + 1);
                continue;
            };
            let len = header.payload_len() as u32;
            let payload = self.ring.read_range(rptr + 1, rptr + 1 + len);

            if !self.execute(header, &payload) {
                return;
            }
            self.ring.set_rptr(rptr + 1 + len);
        }
    }

    /// Returns `false` if the CP froze on this packet.
    fn execute(&self, header: Pm4Header, payload: &[u32]) -> bool {
        match header {
            Pm4Header::Type0 { reg, .. } => {
                for (i, value) in payload.iter().enumerate() {
                    self.set_reg(reg + i as u32, *value);
                }
            }
            Pm4Header::Type2 => {}
            Pm4Header::Type3 { .. } => match header.opcode() {
                Some(Pm4Opcode::IndirectBufferPfd) => {
                    let (addr, size) = (payload[0], payload[1]);
                    self.set_reg(regs::CP_IB1_BASE, addr);
                    self.set_reg(regs::CP_IB1_BUFSZ, size);
                    let mut cp = lock(&self.cp);
                    if cp.hang_ibs.contains(&addr) {
                        cp.frozen = true;
                        return false;
                    }
                    cp.executed_ibs.push(addr);
                    let delay = cp.exec_delay;
                    drop(cp);
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    self.set_reg(regs::CP_IB1_BASE, 0);
                    self.set_reg(regs::CP_IB1_BUFSZ, 0);
                }
                Some(Pm4Opcode::MemWrite) => {
                    if let Some(field) = self.memstore.field_at(payload[0]) {
                        self.memstore.write(field, payload[1]);
                    }
                }
                Some(Pm4Opcode::EventWrite) if payload.first() == Some(&CACHE_FLUSH_TS) => {
                    let timestamp = payload[2];
                    if let Some(field) = self.memstore.field_at(payload[1]) {
                        self.memstore.write(field, timestamp);
                    }
                    let enabled = self.memstore.read(MemstoreField::TsCmpEnable) != 0;
                    let reference = self.memstore.read(MemstoreField::RefWaitTs);
                    if enabled && timestamp_cmp(timestamp, reference) >= 0 {
                        self.raise_timestamp_irq();
                    }
                }
                _ => {}
            },
        }
        true
    }
}

fn worker(sim: Weak<SimGpu>, doorbell: Receiver<()>) {
    while doorbell.recv().is_ok() {
        let Some(sim) = sim.upgrade() else {
            return;
        };
        sim.run();
    }
}

impl RegisterIo for SimGpu {
    fn read(&self, offset: u32) -> u32 {
        self.accesses.fetch_add(1, Ordering::SeqCst);
        match offset {
            regs::CP_RB_RPTR => self.ring.rptr(),
            regs::RBBM_STATUS => {
                let busy = {
                    let cp = lock(&self.cp);
                    cp.frozen
                        || (!cp.halted
                            && self.ring.rptr()
                                != self.reg(regs::CP_RB_WPTR) & (self.ring.size_dwords() - 1))
                };
                if busy {
                    BUSY_STATUS
                } else {
                    regs::RBBM_STATUS_IDLE
                }
            }
            _ => self.reg(offset),
        }
    }

    fn write(&self, offset: u32, value: u32) {
        self.accesses.fetch_add(1, Ordering::SeqCst);
        match offset {
            regs::CP_RB_WPTR => {
                self.set_reg(offset, value);
                let _ = self.doorbell.send(());
            }
            regs::CP_ME_CNTL => {
                lock(&self.cp).halted = value & 0x1000_0000 != 0;
                self.set_reg(offset, value);
                let _ = self.doorbell.send(());
            }
            regs::RBBM_SOFT_RESET => {
                if value != 0 {
                    self.soft_reset();
                }
                self.set_reg(offset, value);
            }
            regs::CP_INT_ACK => {
                let mut regs = lock(&self.regs);
                let status = regs.get(&regs::CP_INT_STATUS).copied().unwrap_or(0) & !value;
                regs.insert(regs::CP_INT_STATUS, status);
                if status == 0 {
                    *regs.entry(regs::MASTER_INT_SIGNAL).or_insert(0) &=
                        !regs::MASTER_INT_SIGNAL_CP_INT_STAT;
                }
            }
            _ => self.set_reg(offset, value),
        }
    }
}

/// MMU backend that records what the device asks of it.
#[derive(Debug, Default)]
pub struct MmuLog {
    pub switches: Vec<PagetableId>,
    pub invalidations: u32,
    pub mapped: Vec<(PagetableId, MemDesc, MapFlags)>,
    pub unmapped: Vec<(PagetableId, MemDesc)>,
}

pub struct RecordingMmu {
    log: Arc<Mutex<MmuLog>>,
    current: Option<PagetableId>,
    fail_map_at: Option<usize>,
}

impl RecordingMmu {
    pub fn new(log: Arc<Mutex<MmuLog>>) -> Self {
        Self {
            log,
            current: None,
            fail_map_at: None,
        }
    }

    /// Fail the `n`th global mapping.
    pub fn failing_map(log: Arc<Mutex<MmuLog>>, n: usize) -> Self {
        Self {
            fail_map_at: Some(n),
            ..Self::new(log)
        }
    }
}

/// Page-table base programmed for a page table.
pub fn pt_base(pagetable: PagetableId) -> u32 {
    0x0800_0000 + pagetable.0 * 0x1000
}

impl MmuBackend for RecordingMmu {
    fn enabled(&self) -> bool {
        true
    }

    fn start(&mut self, _regs: &dyn RegisterIo) -> Result<(), String> {
        self.current = None;
        Ok(())
    }

    fn stop(&mut self, _regs: &dyn RegisterIo) {}

    fn switch(&mut self, pagetable: PagetableId) -> Result<bool, String> {
        lock(&self.log).switches.push(pagetable);
        let changed = self.current != Some(pagetable);
        self.current = Some(pagetable);
        Ok(changed)
    }

    fn hw_pagetable_base(&self) -> u32 {
        pt_base(self.current.unwrap_or_default())
    }

    fn invalidate(&mut self) {
        lock(&self.log).invalidations += 1;
    }

    fn map_global(
        &mut self,
        pagetable: PagetableId,
        mem: &MemDesc,
        flags: MapFlags,
    ) -> Result<(), String> {
        let mut log = lock(&self.log);
        if Some(log.mapped.len()) == self.fail_map_at {
            return Err(format!("no room for {:#x}", mem.gpuaddr));
        }
        log.mapped.push((pagetable, *mem, flags));
        Ok(())
    }

    fn unmap(&mut self, pagetable: PagetableId, mem: &MemDesc) {
        lock(&self.log).unmapped.push((pagetable, *mem));
    }
}

/// Diagnostic sink that keeps every fault it is shown.
#[derive(Clone, Default)]
pub struct FaultLog(pub Arc<Mutex<Vec<FaultInfo>>>);

impl FaultLog {
    pub fn faults(&self) -> Vec<FaultInfo> {
        lock(&self.0).clone()
    }
}

impl adreno_cp::DiagnosticSink for FaultLog {
    fn dump_postmortem(&mut self, fault: &FaultInfo, _regs: &dyn RegisterIo) -> Result<(), String> {
        lock(&self.0).push(*fault);
        Ok(())
    }

    fn snapshot(&mut self, _fault: &FaultInfo, _ring: &[u32]) -> Result<(), String> {
        Ok(())
    }
}

pub struct Harness {
    pub sim: Arc<SimGpu>,
    pub device: Arc<Device>,
    pub ring: Arc<RingMemory>,
    pub faults: FaultLog,
}

impl Harness {
    /// Submit one 16-dword indirect buffer at `gpuaddr`.
    pub fn submit(&self, context_id: u32, gpuaddr: u32) -> CpResult<u32> {
        self.device.issue_ib_cmds(
            context_id,
            &[IbDesc {
                gpuaddr,
                size_dwords: 16,
            }],
        )
    }

    /// Ring words the CP has consumed since the ring was last started.
    pub fn consumed_words(&self) -> Vec<u32> {
        self.ring.read_range(0, self.ring.rptr())
    }
}

pub struct HarnessBuilder {
    config: CpConfig,
    chip: Chip,
    mmu: Option<Box<dyn MmuBackend>>,
    start: bool,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            config: test_config(),
            chip: Chip::A225,
            mmu: None,
            start: true,
        }
    }

    pub fn config(mut self, f: impl FnOnce(&mut CpConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn chip(mut self, chip: Chip) -> Self {
        self.chip = chip;
        self
    }

    pub fn mmu(mut self, mmu: impl MmuBackend + 'static) -> Self {
        self.mmu = Some(Box::new(mmu));
        self
    }

    pub fn unstarted(mut self) -> Self {
        self.start = false;
        self
    }

    pub fn build(self) -> Harness {
        init_tracing();
        let ring = Arc::new(
            RingMemory::new(self.config.ring_size_dwords, RING_GPUADDR, MEMPTRS_GPUADDR).unwrap(),
        );
        let memstore = Arc::new(SharedStatusBlock::new(MemDesc {
            gpuaddr: MEMSTORE_GPUADDR,
            physaddr: u64::from(MEMSTORE_GPUADDR),
            size: 4096,
        }));
        let sim = SimGpu::new(self.chip, ring.clone(), memstore.clone());
        let faults = FaultLog::default();

        let device = Arc::new(
            Device::new(
                self.config,
                DeviceResources {
                    regs: sim.clone(),
                    ring: ring.clone(),
                    memstore,
                    setstate_memory: MemDesc {
                        gpuaddr: SETSTATE_GPUADDR,
                        physaddr: u64::from(SETSTATE_GPUADDR),
                        size: 4096,
                    },
                    mmu: self.mmu.unwrap_or_else(|| Box::new(NoMmu)),
                    power: Box::new(NullPowerControl),
                    diagnostics: Box::new(faults.clone()),
                },
            )
            .unwrap(),
        );
        sim.attach(&device);
        if self.start {
            device.start(true).unwrap();
        }
        Harness {
            sim,
            device,
            ring,
            faults,
        }
    }
}

pub fn harness() -> Harness {
    HarnessBuilder::new().build()
}
