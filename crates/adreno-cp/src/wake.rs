//! One-shot wake channels.
//!
//! A blocked thread registers a receiver while it still holds the device
//! lock, drops the lock, then blocks on the receiver. Whoever completes the
//! awaited event calls [`WakeList::wake_all`], which consumes every
//! registration. Waking before the waiter blocks is not lost: the message
//! stays buffered in the channel. A token that is dropped without being woken
//! takes its registration with it.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

#[derive(Debug, Default)]
pub struct WakeList {
    waiters: Mutex<Registrations>,
}

#[derive(Debug, Default)]
struct Registrations {
    next_id: u64,
    senders: Vec<(u64, Sender<()>)>,
}

/// Receiving half of one registration.
#[derive(Debug)]
pub struct WakeToken<'a> {
    list: &'a WakeList,
    id: u64,
    rx: Receiver<()>,
}

impl WakeToken<'_> {
    pub fn wait(&self) {
        // A disconnected sender also means the list was drained.
        let _ = self.rx.recv();
    }

    /// Returns `true` if woken before `timeout` elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

impl Drop for WakeToken<'_> {
    fn drop(&mut self) {
        let id = self.id;
        self.list.lock().senders.retain(|(other, _)| *other != id);
    }
}

impl WakeList {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registrations> {
        match self.waiters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn register(&self) -> WakeToken<'_> {
        let (tx, rx) = bounded(1);
        let mut waiters = self.lock();
        let id = waiters.next_id;
        waiters.next_id = waiters.next_id.wrapping_add(1);
        waiters.senders.push((id, tx));
        WakeToken { list: self, id, rx }
    }

    pub fn wake_all(&self) -> usize {
        let senders = std::mem::take(&mut self.lock().senders);
        let n = senders.len();
        for (_, tx) in senders {
            // The waiter may have given up already.
            let _ = tx.try_send(());
        }
        n
    }

    pub fn len(&self) -> usize {
        self.lock().senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wake_before_wait_is_not_lost() {
        let list = WakeList::new();
        let token = list.register();
        assert_eq!(list.wake_all(), 1);
        assert!(token.wait_timeout(Duration::from_millis(0)));
        assert!(list.is_empty());
    }

    #[test]
    fn unwoken_token_times_out() {
        let list = WakeList::new();
        let token = list.register();
        assert!(!token.wait_timeout(Duration::from_millis(5)));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn abandoned_tokens_do_not_accumulate() {
        let list = WakeList::new();
        let kept = list.register();
        for _ in 0..100 {
            let token = list.register();
            assert!(!token.wait_timeout(Duration::ZERO));
        }
        assert_eq!(list.len(), 1);

        drop(kept);
        assert!(list.is_empty());
        assert_eq!(list.wake_all(), 0);
    }

    #[test]
    fn wake_all_releases_every_blocked_thread() {
        let list = WakeList::new();
        let tokens: Vec<_> = (0..4).map(|_| list.register()).collect();
        thread::scope(|s| {
            for token in tokens {
                s.spawn(move || token.wait());
            }
            list.wake_all();
        });
        assert!(list.is_empty());
    }
}
