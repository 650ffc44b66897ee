//! Status block shared between the driver and the CP.
//!
//! The CP writes `eoptimestamp` (end-of-pipe event) and `current_context`
//! (from the context switch stream) and reads `ts_cmp_enable`/`ref_wait_ts`
//! to decide when to raise the timestamp interrupt. Software writes use
//! release ordering and reads use acquire ordering so that either side
//! observes the other's prior memory writes.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::backend::MemDesc;

/// Initial `ref_wait_ts`. Far enough ahead that no timestamp compares past it
/// until a waiter arms the interrupt.
pub const INIT_REF_WAIT_TS: u32 = 0x7FFF_FFFF;

/// Fields of the status block, at their byte offsets within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemstoreField {
    SopTimestamp,
    EopTimestamp,
    TsCmpEnable,
    RefWaitTs,
    CurrentContext,
}

impl MemstoreField {
    pub const ALL: [MemstoreField; 5] = [
        MemstoreField::SopTimestamp,
        MemstoreField::EopTimestamp,
        MemstoreField::TsCmpEnable,
        MemstoreField::RefWaitTs,
        MemstoreField::CurrentContext,
    ];

    pub fn offset(self) -> u32 {
        match self {
            MemstoreField::SopTimestamp => 0,
            MemstoreField::EopTimestamp => 8,
            MemstoreField::TsCmpEnable => 16,
            MemstoreField::RefWaitTs => 24,
            MemstoreField::CurrentContext => 32,
        }
    }
}

/// Minimum size of the block's backing allocation.
pub const MEMSTORE_SIZE: u32 = 40;

#[derive(Debug)]
pub struct SharedStatusBlock {
    desc: MemDesc,
    soptimestamp: AtomicU32,
    eoptimestamp: AtomicU32,
    ts_cmp_enable: AtomicU32,
    ref_wait_ts: AtomicU32,
    current_context: AtomicU32,
}

impl SharedStatusBlock {
    pub fn new(desc: MemDesc) -> Self {
        Self {
            desc,
            soptimestamp: AtomicU32::new(0),
            eoptimestamp: AtomicU32::new(0),
            ts_cmp_enable: AtomicU32::new(0),
            ref_wait_ts: AtomicU32::new(0),
            current_context: AtomicU32::new(0),
        }
    }

    pub fn desc(&self) -> &MemDesc {
        &self.desc
    }

    pub fn field_gpuaddr(&self, field: MemstoreField) -> u32 {
        self.desc.gpuaddr + field.offset()
    }

    /// Field mapped at `gpuaddr`, if any.
    pub fn field_at(&self, gpuaddr: u32) -> Option<MemstoreField> {
        MemstoreField::ALL
            .into_iter()
            .find(|f| self.field_gpuaddr(*f) == gpuaddr)
    }

    fn slot(&self, field: MemstoreField) -> &AtomicU32 {
        match field {
            MemstoreField::SopTimestamp => &self.soptimestamp,
            MemstoreField::EopTimestamp => &self.eoptimestamp,
            MemstoreField::TsCmpEnable => &self.ts_cmp_enable,
            MemstoreField::RefWaitTs => &self.ref_wait_ts,
            MemstoreField::CurrentContext => &self.current_context,
        }
    }

    pub fn read(&self, field: MemstoreField) -> u32 {
        self.slot(field).load(Ordering::Acquire)
    }

    pub fn write(&self, field: MemstoreField, value: u32) {
        self.slot(field).store(value, Ordering::Release);
    }

    pub fn eoptimestamp(&self) -> u32 {
        self.read(MemstoreField::EopTimestamp)
    }

    pub fn current_context(&self) -> u32 {
        self.read(MemstoreField::CurrentContext)
    }

    /// Zero every field, then park `ref_wait_ts` at [`INIT_REF_WAIT_TS`].
    pub fn reset(&self) {
        for field in MemstoreField::ALL {
            self.write(field, 0);
        }
        self.write(MemstoreField::RefWaitTs, INIT_REF_WAIT_TS);
    }
}
