//! Waiting for the GPU: ring drain, core idle and timestamp retirement.
//!
//! Every wait doubles as a hang check. A wait that sees no progress hands
//! over to recovery and reports the outcome of the pass.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use adreno_pm4::{regs, Pm4Writer, CONTEXT_NONE};
use tracing::{debug, error, warn};

use crate::device::{CmdFlags, Device, DeviceGuard, DeviceInner, DeviceState};
use crate::error::{CpError, CpResult};
use crate::family::GpuFamily;
use crate::hang::{HangDetector, HangSample, HangVerdict};
use crate::memstore::MemstoreField;
use crate::timestamp::{timestamp_cmp, TimestampKind};
use crate::wake::WakeToken;

const POLL_INTERVAL: Duration = Duration::from_micros(100);
const POLLED_WAIT_INTERVAL: Duration = Duration::from_millis(1);

impl Device {
    fn hang_detector<'a>(&'a self, family: &'a dyn GpuFamily) -> HangDetector<'a> {
        HangDetector::new(
            &*self.regs,
            family.hang_detect_regs(),
            self.fast_hang_detect.load(Ordering::Relaxed),
        )
    }

    /// Wait for the CP to consume everything written to the ring.
    fn drain(
        &self,
        inner: &DeviceInner,
        family: &dyn GpuFamily,
        sample: &mut HangSample,
    ) -> CpResult<()> {
        let ring = &inner.ring;
        if !ring.is_started() {
            return Ok(());
        }
        let detector = self.hang_detector(family);
        let start = Instant::now();
        let deadline = start + self.config.idle_timeout();
        let mut next_kick = start + self.config.first_wait();

        ring.issue_doorbell();
        loop {
            if ring.is_drained() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= next_kick {
                ring.issue_doorbell();
                if detector.sample(sample) == HangVerdict::HangSuspected {
                    error!(
                        rptr = ring.read_cursor(),
                        wptr = ring.write_cursor(),
                        "ring stopped draining"
                    );
                    return Err(CpError::HangConfirmed);
                }
                next_kick = now + self.config.timeout_part();
            }
            if now >= deadline {
                error!(
                    rptr = ring.read_cursor(),
                    wptr = ring.write_cursor(),
                    "timed out draining the ring"
                );
                return Err(CpError::Timeout);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Drain the ring, then wait for the core to report idle. Never
    /// recovers; a stall comes back as [`CpError::HangConfirmed`].
    pub(crate) fn idle_once(&self, inner: &DeviceInner, family: &dyn GpuFamily) -> CpResult<()> {
        let mut sample = HangSample::new();
        self.drain(inner, family, &mut sample)?;

        let detector = self.hang_detector(family);
        let idle = family.idle_status();
        let start = Instant::now();
        let deadline = start + self.config.idle_timeout();
        let mut next_sample = start + self.config.timeout_part();
        loop {
            let status = self.regs.read(regs::RBBM_STATUS);
            if status == idle {
                return Ok(());
            }
            let now = Instant::now();
            if now >= next_sample {
                if detector.sample(&mut sample) == HangVerdict::HangSuspected {
                    error!(
                        rbbm_status = format_args!("{status:#010x}"),
                        "core stopped making progress"
                    );
                    return Err(CpError::HangConfirmed);
                }
                next_sample = now + self.config.timeout_part();
            }
            if now >= deadline {
                error!(
                    rbbm_status = format_args!("{status:#010x}"),
                    "timed out waiting for the core to idle"
                );
                return Err(CpError::Timeout);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Idle the device, recovering from hangs along the way.
    pub(crate) fn idle_locked<'a>(
        &'a self,
        mut inner: DeviceGuard<'a>,
    ) -> (DeviceGuard<'a>, CpResult<()>) {
        loop {
            match inner.state {
                DeviceState::Hung => return (inner, Err(CpError::Timeout)),
                DeviceState::Init if !inner.ring.is_started() => return (inner, Ok(())),
                _ => {}
            }
            let Some(family) = self.family() else {
                return (inner, Ok(()));
            };

            // The lock is held from here to the verdict, so any hang found
            // belongs to this generation.
            let seen = self.recovery_generation();
            let err = match self.idle_once(&inner, &*family) {
                Ok(()) => return (inner, Ok(())),
                Err(err) => err,
            };
            if err == CpError::HangConfirmed {
                self.stats.inc_hangs_detected();
            }
            // Already inside a recovery pass: report instead of recursing.
            if inner.state == DeviceState::DumpAndRecover {
                return (inner, Err(CpError::Timeout));
            }

            let (guard, res) = self.dump_and_recover(inner, seen);
            inner = guard;
            if res.is_err() {
                return (inner, Err(CpError::Timeout));
            }
            debug!("recovered while idling; retrying");
        }
    }

    /// Block until the ring is drained and the core is idle.
    pub fn idle(&self) -> CpResult<()> {
        let _active = self.begin_active();
        self.wait_for_recovery();
        let inner = self.lock();
        let (inner, res) = self.idle_locked(inner);
        drop(inner);
        self.events.process(self.read_timestamp(TimestampKind::Retired));
        res
    }

    /// Arm the timestamp interrupt for `timestamp`. Returns `true` if it has
    /// already retired and nothing was armed.
    pub(crate) fn check_interrupt_timestamp(&self, timestamp: u32) -> bool {
        if self.timestamp_retired(timestamp) {
            return true;
        }
        let mut inner = self.lock();
        if inner.state != DeviceState::Active {
            return false;
        }

        if self.memstore.read(MemstoreField::TsCmpEnable) != 0 {
            // Keep the earliest pending reference.
            let reference = self.memstore.read(MemstoreField::RefWaitTs);
            if timestamp_cmp(reference, timestamp) >= 0 {
                self.memstore.write(MemstoreField::RefWaitTs, timestamp);
            }
        } else {
            self.memstore.write(MemstoreField::RefWaitTs, timestamp);
            self.memstore.write(MemstoreField::TsCmpEnable, 1);
            // Push a frame through so that its end-of-pipe write re-evaluates
            // the comparison even if the ring is otherwise idle.
            let mut w = Pm4Writer::with_capacity(2);
            w.nop(&[0]);
            if let Err(err) =
                self.issue_cmds_locked(&mut inner, CONTEXT_NONE, CmdFlags::empty(), w.as_words())
            {
                warn!(timestamp, %err, "failed to arm the timestamp interrupt");
            }
        }
        false
    }

    fn next_wait_is_polled(&self) -> bool {
        let prev = self
            .io_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some((n + 1) % 100))
            .unwrap_or(0);
        (prev + 1) % 100 >= self.config.io_fraction
    }

    /// Sleep up to `interval` for `timestamp` to retire. `token` must have
    /// been registered before the device lock was dropped.
    fn sleep_until_retired<'a>(
        &'a self,
        mut token: WakeToken<'a>,
        timestamp: u32,
        interval: Duration,
        polled: bool,
    ) -> bool {
        let deadline = Instant::now() + interval;
        loop {
            if self.check_interrupt_timestamp(timestamp) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let left = deadline - now;
            if polled {
                thread::sleep(left.min(POLLED_WAIT_INTERVAL));
                continue;
            }
            if !token.wait_timeout(left) {
                return self.timestamp_retired(timestamp);
            }
            token = self.timestamp_waiters.register();
        }
    }

    pub(crate) fn wait_timestamp_locked<'a>(
        &'a self,
        mut inner: DeviceGuard<'a>,
        timestamp: u32,
        timeout_ms: Option<u32>,
    ) -> (DeviceGuard<'a>, CpResult<()>) {
        let last = inner.ring.timestamp();
        if timestamp_cmp(timestamp, last) > 0 {
            error!(timestamp, last_submitted = last, "waiting on a timestamp never submitted");
            return (
                inner,
                Err(CpError::InvalidArgument(format!(
                    "timestamp {timestamp} is newer than last submitted {last}"
                ))),
            );
        }

        let budget = timeout_ms.unwrap_or_else(|| self.wait_timeout_ms.load(Ordering::Relaxed));
        let budget_dur = Duration::from_millis(budget.into());
        let mut interval = if budget != 0 && budget < self.config.first_wait_ms {
            self.config.short_wait()
        } else {
            self.config.first_wait()
        };
        let mut waited = Duration::ZERO;
        let mut iterations = 0u32;
        let mut sample = HangSample::new();
        let seen = self.recovery_generation();

        loop {
            // A hung device fails every wait, so that all waiters on a failed
            // pass see the same outcome even though it marks their
            // timestamps retired.
            if inner.state == DeviceState::Hung {
                return (inner, Err(CpError::Timeout));
            }
            if self.timestamp_retired(timestamp) {
                return (inner, Ok(()));
            }
            let Some(family) = self.family() else {
                return (inner, Err(CpError::NotStarted));
            };

            inner.ring.issue_doorbell();
            let polled = self.next_wait_is_polled();

            if iterations > 0
                && self.hang_detector(&*family).sample(&mut sample) == HangVerdict::HangSuspected
            {
                self.stats.inc_hangs_detected();
                error!(timestamp, "GPU hang while waiting for timestamp");
                break;
            }

            let token = self.timestamp_waiters.register();
            drop(inner);
            let retired = self.sleep_until_retired(token, timestamp, interval, polled);
            self.wait_for_recovery();
            inner = self.lock();
            if retired {
                return match inner.state {
                    DeviceState::Hung => (inner, Err(CpError::Timeout)),
                    _ => (inner, Ok(())),
                };
            }

            waited += interval;
            interval = self.config.timeout_part();
            iterations += 1;
            if budget != 0 && waited >= budget_dur {
                self.stats.inc_timestamp_wait_timeouts();
                error!(
                    timestamp,
                    retired = self.read_timestamp(TimestampKind::Retired),
                    timeout_ms = budget,
                    "timestamp wait budget exhausted"
                );
                break;
            }
        }

        // It may have retired between the last check and the verdict.
        if inner.state != DeviceState::Hung && self.timestamp_retired(timestamp) {
            return (inner, Ok(()));
        }
        let (inner, res) = self.dump_and_recover(inner, seen);
        match res {
            Ok(()) => (inner, Ok(())),
            Err(_) => (inner, Err(CpError::Timeout)),
        }
    }

    /// Block until `timestamp` retires.
    ///
    /// `timeout_ms` overrides the device default; `Some(0)` waits without a
    /// budget and only gives up on a hang. A hang or an exhausted budget runs
    /// recovery; the wait succeeds if recovery does.
    pub fn wait_timestamp(&self, timestamp: u32, timeout_ms: Option<u32>) -> CpResult<()> {
        let _active = self.begin_active();
        self.wait_for_recovery();
        let inner = self.lock();
        let (inner, res) = self.wait_timestamp_locked(inner, timestamp, timeout_ms);
        drop(inner);
        if res.is_ok() {
            self.events.process(self.read_timestamp(TimestampKind::Retired));
        }
        res
    }
}
