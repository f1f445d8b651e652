//! Spin-based synchronization primitives.
//!
//! The runtime's critical sections are pointer-sized — link or unlink a
//! node, bump a counter — so spinlocks are used instead of OS mutexes for
//! the mailbox, the shared work queue, and the allocator pools. The lock
//! type is a parameter of the allocator structures so single-threaded
//! contexts (per-worker message caches) can opt out via [`NullLock`].

use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Minimal lock interface used by [`Pool`](crate::pool::Pool) and
/// [`CachingAllocator`](crate::cache::CachingAllocator).
///
/// Implementations pair every `lock` with a matching `unlock` on the same
/// thread. The interface is deliberately guard-free: the allocator
/// structures bracket very short regions and manage pairing themselves.
pub trait RawLock: Default + Send + Sync {
    /// Acquire the lock, spinning until it is available.
    fn lock(&self);

    /// Release a previously acquired lock.
    fn unlock(&self);
}

// ── SpinLock ────────────────────────────────────────────────────────────

/// Test-and-test-and-set spinlock.
///
/// Readers spin on a relaxed load until the lock looks free, then attempt
/// the exchange, keeping the cache line in shared state while contended.
#[derive(Debug, Default)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    /// Creates an unlocked spinlock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquires the lock, spinning until it is available.
    pub fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock without spinning.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Releases the lock.
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl RawLock for SpinLock {
    fn lock(&self) {
        SpinLock::lock(self);
    }

    fn unlock(&self) {
        SpinLock::unlock(self);
    }
}

// ── NullLock ────────────────────────────────────────────────────────────

/// No-op lock for single-owner contexts.
///
/// Used to instantiate the per-worker message caches, which are only ever
/// touched by their owning worker thread.
#[derive(Debug, Default)]
pub struct NullLock;

impl RawLock for NullLock {
    fn lock(&self) {}

    fn unlock(&self) {}
}

// ── Backoff ─────────────────────────────────────────────────────────────

/// One step of an escalating wait used by spin-wait loops outside the hot
/// path (teardown drains, deregistration of a pinned mailbox).
///
/// Starts with processor pauses, escalates to OS yields, and finally to
/// millisecond sleeps so a stalled condition does not burn a core.
pub(crate) fn backoff(step: &mut u32) {
    *step = step.saturating_add(1);
    if *step < 10 {
        hint::spin_loop();
    } else if *step < 20 {
        thread::yield_now();
    } else {
        thread::sleep(Duration::from_millis(1));
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
