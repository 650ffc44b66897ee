//! Register-sampling hang oracle.
//!
//! The detector keeps no state of its own. Callers own a [`HangSample`] per
//! detection window and decide how often to sample.

use crate::backend::RegisterIo;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HangSample {
    values: Vec<u32>,
    primed: bool,
}

impl HangSample {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the baseline; the next sample reports progress.
    pub fn reset(&mut self) {
        self.values.clear();
        self.primed = false;
    }

    pub fn values(&self) -> &[u32] {
        &self.values
    }

    pub fn is_primed(&self) -> bool {
        self.primed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangVerdict {
    Progress,
    HangSuspected,
}

#[derive(Clone, Copy)]
pub struct HangDetector<'a> {
    regs: &'a dyn RegisterIo,
    reg_set: &'a [u32],
    enabled: bool,
}

impl<'a> HangDetector<'a> {
    pub fn new(regs: &'a dyn RegisterIo, reg_set: &'a [u32], enabled: bool) -> Self {
        Self {
            regs,
            reg_set,
            enabled,
        }
    }

    /// Compare the register set against `prev`.
    ///
    /// Reports a hang only when every register still holds the value in
    /// `prev`, in which case `prev` is left as is. Otherwise `prev` takes the
    /// new values. An unprimed sample always reports progress.
    pub fn sample(&self, prev: &mut HangSample) -> HangVerdict {
        if !self.enabled {
            return HangVerdict::Progress;
        }

        let current: Vec<u32> = self.reg_set.iter().map(|reg| self.regs.read(*reg)).collect();

        if prev.primed && prev.values == current {
            return HangVerdict::HangSuspected;
        }

        prev.values = current;
        prev.primed = true;
        HangVerdict::Progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Regs(Mutex<HashMap<u32, u32>>);

    impl Regs {
        fn set(&self, reg: u32, v: u32) {
            self.0.lock().unwrap().insert(reg, v);
        }
    }

    impl RegisterIo for Regs {
        fn read(&self, offset: u32) -> u32 {
            *self.0.lock().unwrap().get(&offset).unwrap_or(&0)
        }

        fn write(&self, offset: u32, value: u32) {
            self.set(offset, value);
        }
    }

    const SET: [u32; 6] = [0x5D0, 0x1C4, 0x458, 0x459, 0x45A, 0x45B];

    #[test]
    fn first_sample_of_a_session_reports_progress_even_if_all_zero() {
        let regs = Regs::default();
        let det = HangDetector::new(&regs, &SET, true);
        let mut sample = HangSample::new();
        assert_eq!(det.sample(&mut sample), HangVerdict::Progress);
        assert!(sample.is_primed());
        assert_eq!(det.sample(&mut sample), HangVerdict::HangSuspected);
    }

    #[test]
    fn disabled_detector_never_reports_hang() {
        let regs = Regs::default();
        let det = HangDetector::new(&regs, &SET, false);
        let mut sample = HangSample::new();
        for _ in 0..3 {
            assert_eq!(det.sample(&mut sample), HangVerdict::Progress);
        }
        assert!(!sample.is_primed());
    }

    #[test]
    fn hang_leaves_sample_untouched() {
        let regs = Regs::default();
        regs.set(0x1C4, 7);
        let det = HangDetector::new(&regs, &SET, true);
        let mut sample = HangSample::new();
        det.sample(&mut sample);
        let before = sample.clone();
        assert_eq!(det.sample(&mut sample), HangVerdict::HangSuspected);
        assert_eq!(sample, before);
    }

    proptest! {
        #[test]
        fn hang_iff_every_register_is_unchanged(
            initial in proptest::array::uniform6(any::<u32>()),
            changed in proptest::option::of((0usize..6, 1u32..)),
        ) {
            let regs = Regs::default();
            for (reg, v) in SET.iter().zip(initial) {
                regs.set(*reg, v);
            }
            let det = HangDetector::new(&regs, &SET, true);
            let mut sample = HangSample::new();
            prop_assert_eq!(det.sample(&mut sample), HangVerdict::Progress);

            if let Some((idx, delta)) = changed {
                regs.set(SET[idx], initial[idx].wrapping_add(delta));
                prop_assert_eq!(det.sample(&mut sample), HangVerdict::Progress);
                prop_assert_eq!(sample.values()[idx], initial[idx].wrapping_add(delta));
            } else {
                prop_assert_eq!(det.sample(&mut sample), HangVerdict::HangSuspected);
                prop_assert_eq!(sample.values(), &initial[..]);
            }
        }
    }
}
