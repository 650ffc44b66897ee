//! Callbacks attached to timestamps.

use std::sync::{Mutex, MutexGuard};

use crate::timestamp::timestamp_cmp;

pub type EventCallback = Box<dyn FnOnce(u32) + Send>;

struct TimestampEvent {
    timestamp: u32,
    owner: Option<u32>,
    callback: EventCallback,
}

/// Pending callbacks, each fired once with the retired timestamp that covers
/// it.
#[derive(Default)]
pub struct TimestampEvents {
    pending: Mutex<Vec<TimestampEvent>>,
}

impl std::fmt::Debug for TimestampEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimestampEvents")
            .field("pending", &self.lock().len())
            .finish()
    }
}

impl TimestampEvents {
    fn lock(&self) -> MutexGuard<'_, Vec<TimestampEvent>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add(&self, timestamp: u32, owner: Option<u32>, callback: EventCallback) {
        self.lock().push(TimestampEvent {
            timestamp,
            owner,
            callback,
        });
    }

    /// Fire every callback whose timestamp is at or before `retired`.
    ///
    /// Callbacks run after the internal lock is released, in timestamp order.
    pub fn process(&self, retired: u32) -> usize {
        let mut due = {
            let mut pending = self.lock();
            let (due, keep): (Vec<_>, Vec<_>) = pending
                .drain(..)
                .partition(|ev| timestamp_cmp(retired, ev.timestamp) >= 0);
            *pending = keep;
            due
        };
        due.sort_by(|a, b| timestamp_cmp(a.timestamp, b.timestamp).cmp(&0));
        let n = due.len();
        for ev in due {
            (ev.callback)(retired);
        }
        n
    }

    /// Fire every callback registered by `owner` immediately.
    pub fn cancel_owner(&self, owner: u32, retired: u32) -> usize {
        let cancelled = {
            let mut pending = self.lock();
            let (cancelled, keep): (Vec<_>, Vec<_>) = pending
                .drain(..)
                .partition(|ev| ev.owner == Some(owner));
            *pending = keep;
            cancelled
        };
        let n = cancelled.len();
        for ev in cancelled {
            (ev.callback)(retired);
        }
        n
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
