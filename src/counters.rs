//! Per-worker event counters.
//!
//! Counters are written by their owning worker and summed across workers
//! on read, so queries never contend with the hot path.

use std::sync::atomic::{AtomicU32, Ordering};

/// Event kinds tracked per worker thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Counter {
    /// Mailbox visits (one message dispatched per visit).
    MessagesProcessed = 0,
    /// Times a parked worker was woken by a notification.
    Wakeups,
    /// Mailboxes pushed onto a worker's local queue.
    LocalPushes,
    /// Mailboxes popped from a worker's local queue.
    LocalPops,
    /// Mailboxes pushed onto the shared queue. Workers schedule onto
    /// their local queue, so these come from non-worker senders and are
    /// tracked framework-wide rather than per worker.
    SharedPushes,
    /// Mailboxes popped from the shared queue.
    SharedPops,
    /// Idle iterations spent in the yield strategy.
    Yields,
}

/// Number of counter kinds.
pub const NUM_COUNTERS: usize = 7;

/// One worker's counter block.
#[derive(Debug, Default)]
pub(crate) struct CounterSet {
    values: [AtomicU32; NUM_COUNTERS],
}

impl CounterSet {
    pub(crate) fn bump(&self, counter: Counter) {
        self.values[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn value(&self, counter: Counter) -> u32 {
        self.values[counter as usize].load(Ordering::Relaxed)
    }

    pub(crate) fn reset(&self) {
        for value in &self.values {
            value.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_and_reset() {
        let set = CounterSet::default();
        set.bump(Counter::Yields);
        set.bump(Counter::Yields);
        set.bump(Counter::MessagesProcessed);

        assert_eq!(set.value(Counter::Yields), 2);
        assert_eq!(set.value(Counter::MessagesProcessed), 1);
        assert_eq!(set.value(Counter::Wakeups), 0);

        set.reset();
        assert_eq!(set.value(Counter::Yields), 0);
        assert_eq!(set.value(Counter::MessagesProcessed), 0);
    }
}
