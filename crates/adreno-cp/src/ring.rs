//! The command ring.
//!
//! [`RingMemory`] is the buffer shared with the CP plus the read pointer the
//! CP writes back. [`RingBuffer`] is the software producer: it owns the write
//! pointer and the timestamp counter, frames submissions and rings the
//! doorbell.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use adreno_pm4::packets::PM4_TYPE2_FILLER;
use adreno_pm4::{encode_frame, frame_size, regs, FrameParams, Pm4Writer};
use tracing::error;

use crate::backend::{MemDesc, RegisterIo};
use crate::error::{CpError, CpResult};

/// Pattern the ring is filled with on start. Decodes as type-2 fillers.
pub const RING_FILL_PATTERN: u32 = 0xAAAA_AAAA;

/// Fetch block size programmed into `CP_RB_CNTL`.
pub const RB_BLKSIZE_DWORDS: u32 = 16;

const CP_ME_CNTL_HALT: u32 = 0x1000_0000;
const WAITSPACE_POLL: Duration = Duration::from_micros(200);

#[derive(Debug)]
pub struct RingMemory {
    words: Mutex<Vec<u32>>,
    rptr: AtomicU32,
    buffer: MemDesc,
    memptrs: MemDesc,
}

impl RingMemory {
    /// `size_dwords` must be a power of two.
    pub fn new(size_dwords: u32, buffer_gpuaddr: u32, memptrs_gpuaddr: u32) -> CpResult<Self> {
        if !size_dwords.is_power_of_two() {
            return Err(CpError::InvalidArgument(format!(
                "ring size {size_dwords} is not a power of two"
            )));
        }
        Ok(Self {
            words: Mutex::new(vec![0; size_dwords as usize]),
            rptr: AtomicU32::new(0),
            buffer: MemDesc {
                gpuaddr: buffer_gpuaddr,
                physaddr: u64::from(buffer_gpuaddr),
                size: size_dwords * 4,
            },
            memptrs: MemDesc {
                gpuaddr: memptrs_gpuaddr,
                physaddr: u64::from(memptrs_gpuaddr),
                size: 8,
            },
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u32>> {
        match self.words.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn size_dwords(&self) -> u32 {
        self.buffer.size / 4
    }

    pub fn buffer_desc(&self) -> &MemDesc {
        &self.buffer
    }

    /// Location of the read pointer the CP writes back.
    pub fn memptrs_desc(&self) -> &MemDesc {
        &self.memptrs
    }

    pub fn rptr(&self) -> u32 {
        self.rptr.load(Ordering::Acquire)
    }

    /// Written by the CP as it consumes the ring.
    pub fn set_rptr(&self, rptr: u32) {
        self.rptr.store(rptr & (self.size_dwords() - 1), Ordering::Release);
    }

    pub fn word(&self, index: u32) -> u32 {
        self.lock()[(index & (self.size_dwords() - 1)) as usize]
    }

    /// Words from `start` up to (not including) `end`, following the wrap.
    pub fn read_range(&self, start: u32, end: u32) -> Vec<u32> {
        let words = self.lock();
        let mask = self.size_dwords() - 1;
        let mut out = Vec::new();
        let mut i = start & mask;
        while i != end & mask {
            out.push(words[i as usize]);
            i = (i + 1) & mask;
        }
        out
    }

    fn write_at(&self, at: u32, src: &[u32]) {
        let mut words = self.lock();
        let at = at as usize;
        words[at..at + src.len()].copy_from_slice(src);
    }

    fn fill(&self, value: u32) {
        self.lock().fill(value);
    }

    /// Copy the ring into `dst` starting at `from`, so that `dst` holds the
    /// oldest words first when `from` is the write pointer.
    fn copy_linear(&self, from: u32, dst: &mut [u32]) {
        let words = self.lock();
        let from = from as usize;
        let tail = words.len() - from;
        dst[..tail].copy_from_slice(&words[from..]);
        dst[tail..words.len()].copy_from_slice(&words[..from]);
    }
}

/// Software side of the ring.
pub struct RingBuffer {
    mem: Arc<RingMemory>,
    regs: Arc<dyn RegisterIo>,
    eop_gpuaddr: u32,
    space_timeout: Duration,
    wptr: u32,
    timestamp: u32,
    started: bool,
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("rptr", &self.read_cursor())
            .field("wptr", &self.wptr)
            .field("timestamp", &self.timestamp)
            .field("started", &self.started)
            .finish()
    }
}

impl RingBuffer {
    pub fn new(
        mem: Arc<RingMemory>,
        regs: Arc<dyn RegisterIo>,
        eop_gpuaddr: u32,
        space_timeout: Duration,
    ) -> Self {
        Self {
            mem,
            regs,
            eop_gpuaddr,
            space_timeout,
            wptr: 0,
            timestamp: 0,
            started: false,
        }
    }

    pub fn memory(&self) -> &Arc<RingMemory> {
        &self.mem
    }

    pub fn size_dwords(&self) -> u32 {
        self.mem.size_dwords()
    }

    pub fn read_cursor(&self) -> u32 {
        self.mem.rptr()
    }

    pub fn write_cursor(&self) -> u32 {
        self.wptr
    }

    /// Last timestamp enqueued.
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_drained(&self) -> bool {
        self.read_cursor() == self.wptr
    }

    /// Tell the CP about everything written up to the write pointer.
    pub fn issue_doorbell(&self) {
        self.regs.write(regs::CP_RB_WPTR, self.wptr);
    }

    /// Frame `payload` under the next timestamp, copy it into the ring and
    /// ring the doorbell. Returns the new timestamp.
    pub fn enqueue(
        &mut self,
        context_id: u32,
        unprotected: bool,
        payload: &[u32],
    ) -> CpResult<u32> {
        if !self.started {
            return Err(CpError::NotStarted);
        }
        let len = frame_size(payload.len(), unprotected);
        if len as u32 >= self.size_dwords() / 2 {
            return Err(CpError::InvalidArgument(format!(
                "submission of {len} dwords does not fit the ring"
            )));
        }

        let timestamp = self.timestamp.wrapping_add(1);
        let mut w = Pm4Writer::with_capacity(len);
        encode_frame(
            &mut w,
            &FrameParams {
                context_id,
                timestamp,
                eop_gpuaddr: self.eop_gpuaddr,
                unprotected,
            },
            payload,
        );
        let words = w.finish();

        self.waitspace(words.len() as u32)?;
        self.mem.write_at(self.wptr, &words);
        self.wptr = (self.wptr + words.len() as u32) & (self.size_dwords() - 1);
        self.timestamp = timestamp;
        self.issue_doorbell();
        Ok(timestamp)
    }

    fn wait_for_rptr(&self, mut ok: impl FnMut(u32) -> bool) -> CpResult<()> {
        let deadline = Instant::now() + self.space_timeout;
        loop {
            let rptr = self.read_cursor();
            if ok(rptr) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                error!(rptr, wptr = self.wptr, "timed out waiting for ring space");
                return Err(CpError::Timeout);
            }
            self.issue_doorbell();
            thread::sleep(WAITSPACE_POLL);
        }
    }

    /// Make room for `dwords` contiguous words at the write pointer, wrapping
    /// to the start of the ring if the tail is too short.
    fn waitspace(&mut self, dwords: u32) -> CpResult<()> {
        let size = self.size_dwords();
        let wptr = self.wptr;

        if wptr + dwords >= size {
            // The tail is filled and skipped; the CP must not be inside it
            // and must have left slot 0 so that wrapping does not look empty.
            self.wait_for_rptr(|rptr| rptr == wptr || (rptr < wptr && rptr != 0))?;
            let filler = vec![PM4_TYPE2_FILLER; (size - wptr) as usize];
            self.mem.write_at(wptr, &filler);
            self.wptr = 0;
            self.issue_doorbell();
        }

        let wptr = self.wptr;
        self.wait_for_rptr(|rptr| !(rptr > wptr && rptr <= wptr + dwords))
    }

    /// Reset the ring and point the CP at it. With `init_ram` the timestamp
    /// counter restarts from zero.
    pub fn start(&mut self, init_ram: bool) {
        if self.started {
            return;
        }
        if init_ram {
            self.timestamp = 0;
            self.regs.write(regs::CP_TIMESTAMP, 0);
        }

        self.mem.fill(RING_FILL_PATTERN);
        self.mem.set_rptr(0);
        self.wptr = 0;

        let bufsz = (self.size_dwords() >> 1).trailing_zeros();
        let blksz = (RB_BLKSIZE_DWORDS >> 3).trailing_zeros();
        self.regs.write(regs::CP_RB_CNTL, bufsz | (blksz << 8));
        self.regs.write(regs::CP_RB_BASE, self.mem.buffer_desc().gpuaddr);
        self.regs.write(regs::CP_RB_RPTR_ADDR, self.mem.memptrs_desc().gpuaddr);
        self.regs.write(regs::CP_RB_WPTR, 0);
        self.regs.write(regs::CP_ME_CNTL, 0);
        self.started = true;
    }

    pub fn stop(&mut self) {
        if self.started {
            self.regs.write(regs::CP_ME_CNTL, CP_ME_CNTL_HALT);
            self.started = false;
        }
    }

    /// Copy the whole ring into `dst`, oldest words first.
    pub fn copy_contents(&self, dst: &mut [u32]) {
        self.mem.copy_linear(self.wptr, dst);
    }

    /// Place previously salvaged words at the start of a freshly started ring
    /// and submit them.
    pub fn restore(&mut self, words: &[u32]) -> CpResult<()> {
        if words.len() as u32 >= self.size_dwords() {
            return Err(CpError::InvalidArgument(format!(
                "{} salvaged dwords do not fit the ring",
                words.len()
            )));
        }
        self.mem.write_at(0, words);
        self.wptr = words.len() as u32;
        self.issue_doorbell();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adreno_pm4::FrameScanner;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Regs(Mutex<HashMap<u32, u32>>);

    impl RegisterIo for Regs {
        fn read(&self, offset: u32) -> u32 {
            *self.0.lock().unwrap().get(&offset).unwrap_or(&0)
        }

        fn write(&self, offset: u32, value: u32) {
            self.0.lock().unwrap().insert(offset, value);
        }
    }

    fn ring(size: u32) -> (RingBuffer, Arc<RingMemory>, Arc<Regs>) {
        let mem = Arc::new(RingMemory::new(size, 0x10_0000, 0x20_0000).unwrap());
        let regs = Arc::new(Regs::default());
        let rb = RingBuffer::new(mem.clone(), regs.clone(), 0x30_0008, Duration::from_millis(20));
        (rb, mem, regs)
    }

    #[test]
    fn enqueue_advances_timestamp_and_rings_doorbell() {
        let (mut rb, _mem, regs) = ring(256);
        rb.start(true);
        assert_eq!(regs.read(regs::CP_RB_CNTL) & 0xFF, 7);

        let ts = rb.enqueue(1, false, &[PM4_TYPE2_FILLER]).unwrap();
        assert_eq!(ts, 1);
        assert_eq!(rb.timestamp(), 1);
        assert_eq!(regs.read(regs::CP_RB_WPTR), rb.write_cursor());
        assert_eq!(rb.write_cursor() as usize, frame_size(1, false));
    }

    #[test]
    fn enqueue_before_start_is_rejected() {
        let (mut rb, _mem, _regs) = ring(64);
        assert_eq!(rb.enqueue(1, false, &[]), Err(CpError::NotStarted));
    }

    #[test]
    fn wrap_fills_tail_and_restarts_at_zero() {
        let (mut rb, mem, _regs) = ring(64);
        rb.start(true);
        let frame = frame_size(8, false) as u32;
        let mut expected_wptr = 0;
        for _ in 0..(64 / frame) {
            rb.enqueue(1, false, &[PM4_TYPE2_FILLER; 8]).unwrap();
            expected_wptr += frame;
            // Pretend the CP consumed everything.
            mem.set_rptr(rb.write_cursor());
        }
        assert_eq!(rb.write_cursor(), expected_wptr);

        rb.enqueue(2, false, &[PM4_TYPE2_FILLER; 8]).unwrap();
        assert_eq!(rb.write_cursor(), frame);
        for i in expected_wptr..64 {
            assert_eq!(mem.word(i), PM4_TYPE2_FILLER);
        }
    }

    #[test]
    fn full_ring_times_out_instead_of_overwriting() {
        let (mut rb, _mem, _regs) = ring(64);
        rb.start(true);
        // The CP never consumes anything.
        let mut result = Ok(0);
        for _ in 0..8 {
            result = rb.enqueue(1, false, &[PM4_TYPE2_FILLER; 8]);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(CpError::Timeout));
    }

    #[test]
    fn copy_contents_starts_at_write_pointer() {
        let (mut rb, mem, _regs) = ring(64);
        rb.start(true);
        rb.enqueue(3, false, &[]).unwrap();
        mem.set_rptr(rb.write_cursor());

        let mut linear = vec![0; 64];
        rb.copy_contents(&mut linear);
        let frames: Vec<_> = FrameScanner::new(&linear).collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].range.end, 64);
        assert_eq!(frames[0].context_id, 3);
    }

    #[test]
    fn restore_places_words_at_start() {
        let (mut rb, mem, regs) = ring(64);
        rb.start(true);
        rb.restore(&[1, 2, 3]).unwrap();
        assert_eq!(rb.write_cursor(), 3);
        assert_eq!(mem.read_range(0, 3), vec![1, 2, 3]);
        assert_eq!(regs.read(regs::CP_RB_WPTR), 3);
        assert!(rb.restore(&[0; 64]).is_err());
    }
}
