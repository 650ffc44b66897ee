//! Hang recovery.
//!
//! One pass at a time per device. The pass snapshots the ring, splits the
//! unretired frames into those that can be replayed and those belonging to
//! the hung context, restarts the GPU and replays the former. Everything
//! submitted before the hang counts as retired afterwards, whether it ran or
//! was dropped.

use std::sync::atomic::{fence, Ordering};

use adreno_pm4::{regs, FrameScanner};
use tracing::{debug, error, info, warn};

use crate::backend::FaultInfo;
use crate::device::{Device, DeviceGuard, DeviceInner, DeviceState};
use crate::error::{CpError, CpResult};
use crate::memstore::MemstoreField;
use crate::timestamp::timestamp_cmp;

/// Frame counts from splitting a ring snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extraction {
    pub good_frames: usize,
    pub bad_frames: usize,
    pub retired_frames: usize,
}

/// Scratch memory for one pass: a copy of the ring plus room for the good
/// and bad frames, allocated up front in one piece.
#[derive(Debug)]
pub struct RecoveryArena {
    words: Vec<u32>,
    ring_dwords: usize,
    good_len: usize,
    bad_len: usize,
}

impl RecoveryArena {
    pub fn allocate(ring_dwords: usize, limit_bytes: Option<usize>) -> CpResult<Self> {
        let total = ring_dwords
            .checked_mul(3)
            .ok_or(CpError::AllocationFailure { bytes: usize::MAX })?;
        let bytes = total.saturating_mul(4);
        if limit_bytes.is_some_and(|limit| bytes > limit) {
            return Err(CpError::AllocationFailure { bytes });
        }

        let mut words = Vec::new();
        words
            .try_reserve_exact(total)
            .map_err(|_| CpError::AllocationFailure { bytes })?;
        words.resize(total, 0);
        Ok(Self {
            words,
            ring_dwords,
            good_len: 0,
            bad_len: 0,
        })
    }

    pub fn ring(&self) -> &[u32] {
        &self.words[..self.ring_dwords]
    }

    pub fn ring_mut(&mut self) -> &mut [u32] {
        &mut self.words[..self.ring_dwords]
    }

    /// Frames to replay, in submission order.
    pub fn good(&self) -> &[u32] {
        let start = self.ring_dwords;
        &self.words[start..start + self.good_len]
    }

    /// Frames dropped as belonging to the hang.
    pub fn bad(&self) -> &[u32] {
        let start = 2 * self.ring_dwords;
        &self.words[start..start + self.bad_len]
    }

    /// Sort every unretired frame of the linearised ring into the good or
    /// bad region.
    ///
    /// A frame is bad if it belongs to `hung_context` or fetches `fault_ib`.
    pub fn extract(&mut self, global_eop: u32, hung_context: u32, fault_ib: u32) -> Extraction {
        let (ring, rest) = self.words.split_at_mut(self.ring_dwords);
        let (good, bad) = rest.split_at_mut(self.ring_dwords);
        let ring: &[u32] = ring;

        let mut ex = Extraction::default();
        let (mut good_len, mut bad_len) = (0, 0);
        for frame in FrameScanner::new(ring) {
            if timestamp_cmp(frame.timestamp, global_eop) <= 0 {
                ex.retired_frames += 1;
                continue;
            }
            let words = frame.words(ring);
            let guilty = frame.context_id == hung_context
                || (fault_ib != 0 && frame.references_ib(fault_ib));
            if guilty {
                bad[bad_len..bad_len + words.len()].copy_from_slice(words);
                bad_len += words.len();
                ex.bad_frames += 1;
            } else {
                good[good_len..good_len + words.len()].copy_from_slice(words);
                good_len += words.len();
                ex.good_frames += 1;
            }
        }
        self.good_len = good_len;
        self.bad_len = bad_len;
        ex
    }
}

/// Device state captured at the start of a pass.
#[derive(Debug)]
pub struct RecoverySnapshot {
    pub fault: FaultInfo,
    pub arena: RecoveryArena,
}

impl Device {
    fn capture_snapshot(&self, inner: &DeviceInner) -> CpResult<RecoverySnapshot> {
        let regs = &*self.regs;
        let ib_active =
            regs.read(regs::CP_IB1_BUFSZ) != 0 || regs.read(regs::CP_IB2_BUFSZ) != 0;
        let fault = FaultInfo {
            ib1: if ib_active { regs.read(regs::CP_IB1_BASE) } else { 0 },
            context_id: self.memstore.current_context(),
            global_eop: self.memstore.eoptimestamp(),
            rptr: inner.ring.read_cursor(),
            wptr: inner.ring.write_cursor(),
            timestamp: inner.ring.timestamp(),
        };

        let mut arena = RecoveryArena::allocate(
            inner.ring.size_dwords() as usize,
            self.config.recovery_memory_limit,
        )?;
        inner.ring.copy_contents(arena.ring_mut());
        Ok(RecoverySnapshot { fault, arena })
    }

    /// Block while another thread runs a recovery pass. Must be called
    /// without the device lock.
    pub(crate) fn wait_for_recovery(&self) {
        while self.recovering.load(Ordering::Acquire) {
            let gate = self.recovery_gate.register();
            // The pass may have signalled between the load and registering.
            if !self.recovering.load(Ordering::Acquire) {
                break;
            }
            gate.wait();
        }
    }

    /// Nothing queued and the core idle: there is no hang to recover from.
    fn nothing_outstanding(&self, inner: &DeviceInner) -> bool {
        let Some(family) = self.family() else {
            return true;
        };
        inner.ring.is_drained() && self.regs.read(regs::RBBM_STATUS) == family.idle_status()
    }

    /// Run a recovery pass for a hang observed while the recovery generation
    /// was `seen`.
    ///
    /// Entered with the device lock held; the pass keeps it throughout. If a
    /// pass has completed since `seen`, the hang was that pass's to handle and
    /// its outcome is returned instead of starting another.
    pub(crate) fn dump_and_recover<'a>(
        &'a self,
        mut inner: DeviceGuard<'a>,
        seen: u64,
    ) -> (DeviceGuard<'a>, CpResult<()>) {
        if self.recovery_generation() != seen {
            debug!(seen, "hang already handled by another recovery pass");
            let res = inner.last_recovery.clone();
            return (inner, res);
        }
        match inner.state {
            DeviceState::Hung => return (inner, Err(CpError::RecoveryFailed)),
            // Re-entered from inside the pass itself.
            DeviceState::DumpAndRecover => return (inner, Err(CpError::Timeout)),
            DeviceState::Init | DeviceState::Active => {}
        }

        inner.state = DeviceState::DumpAndRecover;
        self.recovering.store(true, Ordering::Release);
        self.stats.inc_recoveries_attempted();
        let result = match self.recover_hang(&mut inner) {
            Ok(()) => {
                inner.state = DeviceState::Active;
                self.stats.inc_recoveries_succeeded();
                info!("recovered from GPU hang");
                Ok(())
            }
            Err(err) => {
                inner.state = DeviceState::Hung;
                self.stats.inc_recoveries_failed();
                error!(%err, "GPU hang recovery failed; device is hung");
                match err {
                    CpError::AllocationFailure { .. } => Err(err),
                    _ => Err(CpError::RecoveryFailed),
                }
            }
        };
        inner.last_recovery = result.clone();
        self.recovery_generation.fetch_add(1, Ordering::AcqRel);
        self.recovering.store(false, Ordering::Release);
        self.recovery_gate.wake_all();
        // Anyone still sleeping on a timestamp has either retired or will
        // never retire now.
        self.timestamp_waiters.wake_all();
        (inner, result)
    }

    /// Trigger recovery from outside a wait, e.g. after a fault interrupt.
    ///
    /// Callers racing on the same hang share one pass and its outcome. A GPU
    /// with nothing outstanding is left alone.
    pub fn recover(&self) -> CpResult<()> {
        let seen = self.recovery_generation();
        self.wait_for_recovery();
        let inner = self.lock();
        if self.recovery_generation() == seen
            && inner.state == DeviceState::Active
            && self.nothing_outstanding(&inner)
        {
            debug!("recovery requested on an idle GPU; nothing to do");
            return Ok(());
        }
        let (_inner, res) = self.dump_and_recover(inner, seen);
        res
    }

    fn recover_hang(&self, inner: &mut DeviceInner) -> CpResult<()> {
        let mut snapshot = match self.capture_snapshot(inner) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                error!(%err, "cannot snapshot the ring for recovery");
                inner.contexts.mark_reset_status(0, true);
                return Err(err);
            }
        };
        let fault = snapshot.fault;
        error!(
            ib1 = format_args!("{:#010x}", fault.ib1),
            context_id = fault.context_id,
            global_eop = fault.global_eop,
            rptr = fault.rptr,
            wptr = fault.wptr,
            timestamp = fault.timestamp,
            "GPU hang"
        );

        if let Err(err) = inner.diagnostics.dump_postmortem(&fault, &*self.regs) {
            warn!(%err, "postmortem dump failed");
        }
        if let Err(err) = inner.diagnostics.snapshot(&fault, snapshot.arena.ring()) {
            warn!(%err, "hang snapshot failed");
        }

        let mut hung_context = fault.context_id;
        if !inner.contexts.mark_hung(hung_context) {
            warn!(context_id = hung_context, "hung context unknown; not blaming any context");
            hung_context = 0;
        }

        let result = self.replay(inner, &mut snapshot, hung_context);

        let timestamp = inner.ring.timestamp();
        self.memstore.write(MemstoreField::EopTimestamp, timestamp);
        self.memstore.write(MemstoreField::SopTimestamp, timestamp);
        inner.contexts.mark_reset_status(hung_context, result.is_err());
        result
    }

    fn replay(
        &self,
        inner: &mut DeviceInner,
        snapshot: &mut RecoverySnapshot,
        hung_context: u32,
    ) -> CpResult<()> {
        let fault = snapshot.fault;
        let ex = snapshot
            .arena
            .extract(fault.global_eop, hung_context, fault.ib1);
        self.stats.add_frames_replayed(ex.good_frames as u64);
        self.stats.add_frames_discarded(ex.bad_frames as u64);
        info!(
            good = ex.good_frames,
            bad = ex.bad_frames,
            retired = ex.retired_frames,
            "split ring contents"
        );

        let timestamp = inner.ring.timestamp();
        fence(Ordering::SeqCst);

        self.stop_locked(inner);
        self.start_locked(inner, true)?;

        inner.ring.restore(snapshot.arena.good())?;
        inner.ring.set_timestamp(timestamp);

        let family = self.family().ok_or(CpError::NotStarted)?;
        if let Err(err) = self.idle_once(inner, &*family) {
            error!(%err, "GPU did not idle after replay");
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adreno_pm4::{encode_frame, FrameParams, Pm4Writer, CONTEXT_NONE};
    use pretty_assertions::assert_eq;

    const EOP: u32 = 0x1000;

    fn ring_with(frames: &[(u32, u32, Option<u32>)], size: usize) -> Vec<u32> {
        let mut w = Pm4Writer::new();
        for &(context_id, timestamp, ib) in frames {
            let mut payload = Pm4Writer::new();
            if let Some(addr) = ib {
                payload.indirect_buffer(addr, 16);
            }
            encode_frame(
                &mut w,
                &FrameParams {
                    context_id,
                    timestamp,
                    eop_gpuaddr: EOP,
                    unprotected: false,
                },
                payload.as_words(),
            );
        }
        let mut words = w.finish();
        words.resize(size, 0xAAAA_AAAA);
        words
    }

    fn contexts(stream: &[u32]) -> Vec<(u32, u32)> {
        FrameScanner::new(stream)
            .map(|f| (f.context_id, f.timestamp))
            .collect()
    }

    #[test]
    fn extract_splits_by_context_and_fault_ib() {
        let ring = ring_with(
            &[
                (1, 4, Some(0x100)),
                (2, 5, Some(0x200)),
                (1, 6, Some(0x300)),
                (3, 7, Some(0x200)),
                (CONTEXT_NONE, 8, None),
                (3, 9, Some(0x400)),
            ],
            256,
        );
        let mut arena = RecoveryArena::allocate(256, None).unwrap();
        arena.ring_mut().copy_from_slice(&ring);

        let ex = arena.extract(4, 2, 0x200);
        assert_eq!(
            ex,
            Extraction {
                good_frames: 3,
                bad_frames: 2,
                retired_frames: 1,
            }
        );
        assert_eq!(contexts(arena.good()), vec![(1, 6), (CONTEXT_NONE, 8), (3, 9)]);
        assert_eq!(contexts(arena.bad()), vec![(2, 5), (3, 7)]);
    }

    #[test]
    fn retired_frames_are_dropped_across_wrap() {
        let ring = ring_with(&[(1, u32::MAX - 1, None), (1, u32::MAX, None), (1, 0, None)], 64);
        let mut arena = RecoveryArena::allocate(64, None).unwrap();
        arena.ring_mut().copy_from_slice(&ring);

        let ex = arena.extract(u32::MAX, 7, 0);
        assert_eq!(ex.retired_frames, 2);
        assert_eq!(contexts(arena.good()), vec![(1, 0)]);
        assert!(arena.bad().is_empty());
    }

    #[test]
    fn arena_respects_memory_limit() {
        assert_eq!(
            RecoveryArena::allocate(1024, Some(4096)).unwrap_err(),
            CpError::AllocationFailure { bytes: 3 * 1024 * 4 }
        );
        assert!(RecoveryArena::allocate(1024, Some(3 * 1024 * 4)).is_ok());
    }

    mod gate {
        use super::super::*;
        use crate::backend::{LogDiagnosticSink, MemDesc, NoMmu, NullPowerControl, RegisterIo};
        use crate::config::CpConfig;
        use crate::device::DeviceResources;
        use crate::memstore::SharedStatusBlock;
        use crate::ring::RingMemory;
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        struct Dead;

        impl RegisterIo for Dead {
            fn read(&self, _offset: u32) -> u32 {
                0
            }

            fn write(&self, _offset: u32, _value: u32) {}
        }

        fn device() -> Device {
            let config = CpConfig {
                ring_size_dwords: 64,
                ..CpConfig::default()
            };
            Device::new(
                config,
                DeviceResources {
                    regs: Arc::new(Dead),
                    ring: Arc::new(RingMemory::new(64, 0x1000, 0x2000).unwrap()),
                    memstore: Arc::new(SharedStatusBlock::new(MemDesc {
                        gpuaddr: 0x3000,
                        physaddr: 0x3000,
                        size: 64,
                    })),
                    setstate_memory: MemDesc {
                        gpuaddr: 0x4000,
                        physaddr: 0x4000,
                        size: 64,
                    },
                    mmu: Box::new(NoMmu),
                    power: Box::new(NullPowerControl),
                    diagnostics: Box::new(LogDiagnosticSink),
                },
            )
            .unwrap()
        }

        /// Stand in for a pass running on another thread: publish it the
        /// way `dump_and_recover` does, without holding the device lock.
        fn begin_pass(dev: &Device) {
            dev.lock().state = DeviceState::DumpAndRecover;
            dev.recovering.store(true, Ordering::Release);
        }

        fn finish_pass(dev: &Device, state: DeviceState, outcome: CpResult<()>) {
            let mut inner = dev.lock();
            inner.state = state;
            inner.last_recovery = outcome;
            dev.recovery_generation.fetch_add(1, Ordering::AcqRel);
            dev.recovering.store(false, Ordering::Release);
            dev.recovery_gate.wake_all();
        }

        #[test]
        fn entrant_during_a_pass_waits_on_the_gate_not_the_lock() {
            let dev = device();
            begin_pass(&dev);

            thread::scope(|s| {
                let entrant = s.spawn(|| dev.recover());
                while dev.recovery_gate.is_empty() {
                    thread::sleep(Duration::from_millis(1));
                }
                // The entrant is parked on the gate, so the lock is free.
                assert_eq!(dev.state(), DeviceState::DumpAndRecover);
                finish_pass(&dev, DeviceState::Active, Ok(()));
                assert_eq!(entrant.join().unwrap(), Ok(()));
            });
            assert_eq!(dev.stats().recoveries_attempted, 0);
            assert_eq!(dev.recovery_generation(), 1);
        }

        #[test]
        fn entrant_shares_the_outcome_of_a_failed_pass() {
            let dev = device();
            begin_pass(&dev);

            thread::scope(|s| {
                let entrants: Vec<_> = (0..3).map(|_| s.spawn(|| dev.recover())).collect();
                while dev.recovery_gate.len() < 3 {
                    thread::sleep(Duration::from_millis(1));
                }
                finish_pass(
                    &dev,
                    DeviceState::Hung,
                    Err(CpError::AllocationFailure { bytes: 768 }),
                );
                for entrant in entrants {
                    assert_eq!(
                        entrant.join().unwrap(),
                        Err(CpError::AllocationFailure { bytes: 768 })
                    );
                }
            });
            assert_eq!(dev.stats().recoveries_attempted, 0);
        }

        #[test]
        fn hung_device_does_not_recover_again() {
            let dev = device();
            dev.lock().state = DeviceState::Hung;
            assert_eq!(dev.recover(), Err(CpError::RecoveryFailed));
            assert_eq!(dev.recovery_generation(), 0);
        }
    }
}
