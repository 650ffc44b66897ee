//! The 32-bit completion counter.

use std::sync::atomic::{fence, Ordering};

use adreno_pm4::regs;

use crate::backend::RegisterIo;
use crate::memstore::SharedStatusBlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimestampKind {
    /// Last timestamp the CP has read past (`CP_TIMESTAMP`).
    Consumed,
    /// Last timestamp whose work has fully retired (`eoptimestamp`).
    Retired,
}

/// Signed distance from `b` to `a` on the wrapping counter.
///
/// Positive when `a` is newer than `b`. Meaningful for values less than half
/// the counter range apart.
pub fn timestamp_cmp(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

pub fn read_timestamp(
    regs: &dyn RegisterIo,
    memstore: &SharedStatusBlock,
    kind: TimestampKind,
) -> u32 {
    let ts = match kind {
        TimestampKind::Consumed => regs.read(regs::CP_TIMESTAMP),
        TimestampKind::Retired => memstore.eoptimestamp(),
    };
    // Pairs with the CP's cache flush before the end-of-pipe write.
    fence(Ordering::Acquire);
    ts
}
