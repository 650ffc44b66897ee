use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for hang handling and ring traffic.
///
/// Updated from waiter threads and the interrupt path without taking the
/// device lock.
#[derive(Debug, Default)]
pub struct CpStats {
    submissions: AtomicU64,
    doorbells: AtomicU64,
    interrupts: AtomicU64,
    hangs_detected: AtomicU64,
    timestamp_wait_timeouts: AtomicU64,
    recoveries_attempted: AtomicU64,
    recoveries_succeeded: AtomicU64,
    recoveries_failed: AtomicU64,
    frames_replayed: AtomicU64,
    frames_discarded: AtomicU64,
}

impl CpStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_submissions(&self) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_doorbells(&self) {
        self.doorbells.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_interrupts(&self) {
        self.interrupts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_hangs_detected(&self) {
        self.hangs_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_timestamp_wait_timeouts(&self) {
        self.timestamp_wait_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_recoveries_attempted(&self) {
        self.recoveries_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_recoveries_succeeded(&self) {
        self.recoveries_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_recoveries_failed(&self) {
        self.recoveries_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_frames_replayed(&self, n: u64) {
        self.frames_replayed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_frames_discarded(&self, n: u64) {
        self.frames_discarded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CpStatsSnapshot {
        CpStatsSnapshot {
            submissions: self.submissions.load(Ordering::Relaxed),
            doorbells: self.doorbells.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            hangs_detected: self.hangs_detected.load(Ordering::Relaxed),
            timestamp_wait_timeouts: self.timestamp_wait_timeouts.load(Ordering::Relaxed),
            recoveries_attempted: self.recoveries_attempted.load(Ordering::Relaxed),
            recoveries_succeeded: self.recoveries_succeeded.load(Ordering::Relaxed),
            recoveries_failed: self.recoveries_failed.load(Ordering::Relaxed),
            frames_replayed: self.frames_replayed.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpStatsSnapshot {
    pub submissions: u64,
    pub doorbells: u64,
    pub interrupts: u64,
    pub hangs_detected: u64,
    pub timestamp_wait_timeouts: u64,
    pub recoveries_attempted: u64,
    pub recoveries_succeeded: u64,
    pub recoveries_failed: u64,
    pub frames_replayed: u64,
    pub frames_discarded: u64,
}
