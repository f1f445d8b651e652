//! Intrusive queues of runnable mailboxes.
//!
//! A [`WorkQueue`] is a singly-linked list threaded through the
//! mailboxes' own `work_next` link, so enqueuing a mailbox never
//! allocates. The same structure serves both disciplines:
//!
//! - the framework-wide shared queue uses `push_back`/`pop_front` (FIFO)
//!   under a single spinlock;
//! - each worker's private local queue uses `push_front`/`pop_front`
//!   (LIFO) with no lock at all — only the owning thread mutates it.
//!
//! A mailbox is linked into at most one queue at a time: it is enqueued
//! on its empty→non-empty transition (under its own lock) and re-enqueued
//! only by the worker that drained it.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::mailbox::Mailbox;

/// Queue of runnable mailboxes, linked through `Mailbox::work_next`.
///
/// The link fields are atomics so that lock-free emptiness peeks (worker
/// scheduling, teardown drain checks) are well-defined, but the list
/// structure itself is only mutated by the owner or under an external
/// lock.
pub(crate) struct WorkQueue {
    head: AtomicPtr<Mailbox>,
    tail: AtomicPtr<Mailbox>,
}

impl WorkQueue {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Returns `true` if the queue holds no mailboxes.
    ///
    /// Callable without the external lock as a peek.
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Appends a mailbox at the tail (FIFO enqueue).
    ///
    /// # Safety
    ///
    /// The caller must have exclusive mutation rights (owner thread or
    /// external lock). `mailbox` must be live and not linked into any
    /// queue.
    pub(crate) unsafe fn push_back(&self, mailbox: *mut Mailbox) {
        debug_assert!(!mailbox.is_null());
        // SAFETY: exclusive mutation per contract; `mailbox` is live.
        unsafe {
            (*mailbox).set_work_next(ptr::null_mut());
            let tail = self.tail.load(Ordering::Acquire);
            if tail.is_null() {
                self.head.store(mailbox, Ordering::Release);
            } else {
                (*tail).set_work_next(mailbox);
            }
            self.tail.store(mailbox, Ordering::Release);
        }
    }

    /// Pushes a mailbox at the head (LIFO enqueue).
    ///
    /// # Safety
    ///
    /// Same contract as [`WorkQueue::push_back`].
    pub(crate) unsafe fn push_front(&self, mailbox: *mut Mailbox) {
        debug_assert!(!mailbox.is_null());
        // SAFETY: exclusive mutation per contract; `mailbox` is live.
        unsafe {
            let head = self.head.load(Ordering::Acquire);
            (*mailbox).set_work_next(head);
            self.head.store(mailbox, Ordering::Release);
            if head.is_null() {
                self.tail.store(mailbox, Ordering::Release);
            }
        }
    }

    /// Removes and returns the mailbox at the head, or null if empty.
    ///
    /// # Safety
    ///
    /// Same contract as [`WorkQueue::push_back`].
    pub(crate) unsafe fn pop_front(&self) -> *mut Mailbox {
        let head = self.head.load(Ordering::Acquire);
        if head.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: exclusive mutation per contract; `head` is linked here.
        let next = unsafe { (*head).work_next() };
        self.head.store(next, Ordering::Release);
        if next.is_null() {
            self.tail.store(ptr::null_mut(), Ordering::Release);
        }
        head
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("empty", &self.is_empty())
            .finish()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn mailboxes(n: u32) -> Vec<Box<Mailbox>> {
        (1..=n).map(|i| Box::new(Mailbox::new(i))).collect()
    }

    #[test]
    fn push_back_pop_front_is_fifo() {
        let queue = WorkQueue::new();
        let mut boxes = mailboxes(3);
        let ptrs: Vec<*mut Mailbox> = boxes.iter_mut().map(|b| std::ptr::from_mut(&mut **b)).collect();

        // SAFETY: single-threaded test owns the queue and mailboxes.
        unsafe {
            for &p in &ptrs {
                queue.push_back(p);
            }
            assert_eq!(queue.pop_front(), ptrs[0]);
            assert_eq!(queue.pop_front(), ptrs[1]);
            assert_eq!(queue.pop_front(), ptrs[2]);
            assert!(queue.pop_front().is_null());
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn push_front_pop_front_is_lifo() {
        let queue = WorkQueue::new();
        let mut boxes = mailboxes(3);
        let ptrs: Vec<*mut Mailbox> = boxes.iter_mut().map(|b| std::ptr::from_mut(&mut **b)).collect();

        // SAFETY: single-threaded test owns the queue and mailboxes.
        unsafe {
            for &p in &ptrs {
                queue.push_front(p);
            }
            assert_eq!(queue.pop_front(), ptrs[2]);
            assert_eq!(queue.pop_front(), ptrs[1]);
            assert_eq!(queue.pop_front(), ptrs[0]);
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn mixed_disciplines_share_one_list() {
        let queue = WorkQueue::new();
        let mut boxes = mailboxes(3);
        let ptrs: Vec<*mut Mailbox> = boxes.iter_mut().map(|b| std::ptr::from_mut(&mut **b)).collect();

        // SAFETY: single-threaded test owns the queue and mailboxes.
        unsafe {
            queue.push_back(ptrs[0]);
            queue.push_back(ptrs[1]);
            // Jump the line.
            queue.push_front(ptrs[2]);

            assert_eq!(queue.pop_front(), ptrs[2]);
            assert_eq!(queue.pop_front(), ptrs[0]);
            assert_eq!(queue.pop_front(), ptrs[1]);
        }
    }

    #[test]
    fn empty_after_draining_singleton() {
        let queue = WorkQueue::new();
        let mut mb = Box::new(Mailbox::new(9));

        // SAFETY: single-threaded test owns the queue and mailbox.
        unsafe {
            queue.push_back(std::ptr::from_mut(&mut *mb));
            assert!(!queue.is_empty());
            assert!(!queue.pop_front().is_null());
            assert!(queue.is_empty());
            // Tail must have been reset: a new push still works.
            queue.push_back(std::ptr::from_mut(&mut *mb));
            assert!(!queue.pop_front().is_null());
        }
    }
}
