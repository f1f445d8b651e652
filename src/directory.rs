//! Mailbox directory: dense index from mailbox index to mailbox.
//!
//! The directory is a grow-only paged table. Pages are allocated under
//! the directory lock and published with a release store; lookups are
//! lock-free (bounds check, acquire load, indexed access). Slots are
//! never renumbered and mailboxes are never destroyed before the
//! directory itself, so addresses stay stable for the framework's
//! lifetime.
//!
//! Index 0 is reserved as "null". Freed slots are recycled by later
//! allocations, lowest index first, but only once their mailbox has
//! drained — a recycled address can never observe a predecessor's
//! messages.

use std::cell::UnsafeCell;
use std::collections::BTreeSet;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::allocator::AllocatorManager;
use crate::envelope::Envelope;
use crate::mailbox::Mailbox;
use crate::spinlock::SpinLock;

/// Mailboxes per page. Pages are fully constructed before publication.
const ENTRIES_PER_PAGE: u32 = 64;

/// Page-table capacity: `MAX_PAGES * ENTRIES_PER_PAGE` addressable slots.
const MAX_PAGES: usize = 1024;

type Page = [Mailbox; ENTRIES_PER_PAGE as usize];

/// Grow-only table of mailboxes with stable, reusable indices.
pub(crate) struct Directory {
    /// Published pages; each entry points at the first mailbox of a page.
    pages: Box<[AtomicPtr<Mailbox>]>,
    lock: SpinLock,
    /// Highest index handed out so far. Guarded by `lock`.
    high_water: UnsafeCell<u32>,
    /// Freed indices awaiting reuse. Guarded by `lock`.
    free: UnsafeCell<BTreeSet<u32>>,
}

// SAFETY: `high_water` and `free` are only accessed under `lock`; pages
// are immutable after their release-store publication and the mailboxes
// within are themselves `Sync`.
unsafe impl Send for Directory {}
// SAFETY: as above.
unsafe impl Sync for Directory {}

impl Directory {
    pub(crate) fn new() -> Self {
        let pages = (0..MAX_PAGES)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            pages,
            lock: SpinLock::new(),
            high_water: UnsafeCell::new(0),
            free: UnsafeCell::new(BTreeSet::new()),
        }
    }

    /// Claims the lowest available non-zero index and returns it with its
    /// mailbox. Returns `None` when the table is exhausted.
    pub(crate) fn allocate(&self) -> Option<(u32, &Mailbox)> {
        self.lock.lock();

        // SAFETY: directory lock held.
        let index = unsafe {
            let free = &mut *self.free.get();
            // Prefer the lowest freed slot whose mailbox has drained, so a
            // recycled address starts with an empty queue.
            let recycled = free
                .iter()
                .copied()
                .find(|&candidate| self.lookup(candidate).is_some_and(Mailbox::is_empty));
            match recycled {
                Some(index) => {
                    free.remove(&index);
                    index
                }
                None => {
                    let high = &mut *self.high_water.get();
                    let next = *high + 1;
                    if next as usize >= MAX_PAGES * ENTRIES_PER_PAGE as usize {
                        self.lock.unlock();
                        return None;
                    }
                    self.ensure_page(next);
                    *high = next;
                    next
                }
            }
        };

        self.lock.unlock();

        let mailbox = self.lookup(index).expect("freshly allocated slot");
        Some((index, mailbox))
    }

    /// Resolves an index to its mailbox. Lock-free.
    pub(crate) fn lookup(&self, index: u32) -> Option<&Mailbox> {
        if index == 0 {
            return None;
        }
        let page_index = (index / ENTRIES_PER_PAGE) as usize;
        if page_index >= MAX_PAGES {
            return None;
        }
        let page = self.pages[page_index].load(Ordering::Acquire);
        if page.is_null() {
            return None;
        }
        let slot = (index % ENTRIES_PER_PAGE) as usize;
        // SAFETY: published pages are fully constructed arrays of
        // `ENTRIES_PER_PAGE` mailboxes, alive until the directory drops.
        Some(unsafe { &*page.add(slot) })
    }

    /// Marks a slot reusable. The mailbox object is retained so the
    /// address stays resolvable; queued messages drain to the fallback
    /// handler through the normal worker path.
    pub(crate) fn free(&self, index: u32) {
        debug_assert!(index != 0, "index 0 is reserved");
        self.lock.lock();
        // SAFETY: directory lock held.
        unsafe {
            (*self.free.get()).insert(index);
        }
        self.lock.unlock();
    }

    /// Allocates and publishes the page containing `index`, if absent.
    ///
    /// Must be called under the directory lock.
    fn ensure_page(&self, index: u32) {
        let page_index = (index / ENTRIES_PER_PAGE) as usize;
        if !self.pages[page_index].load(Ordering::Acquire).is_null() {
            return;
        }

        let base = page_index as u32 * ENTRIES_PER_PAGE;
        let page: Box<Page> = Box::new(std::array::from_fn(|i| Mailbox::new(base + i as u32)));
        let raw = Box::into_raw(page).cast::<Mailbox>();
        // Publish: lookups acquire-load the page pointer.
        self.pages[page_index].store(raw, Ordering::Release);
    }
}

impl Drop for Directory {
    fn drop(&mut self) {
        // Safety net for teardown: destroy any envelopes still queued (the
        // framework drains its queues first, so normally there are none),
        // then free the pages.
        let backing = AllocatorManager::instance().allocator();
        for entry in &*self.pages {
            let raw = entry.swap(ptr::null_mut(), Ordering::AcqRel);
            if raw.is_null() {
                continue;
            }
            // SAFETY: `raw` was produced by `Box::into_raw` of a `Page` in
            // `ensure_page`, and no other reference can exist during drop.
            let page = unsafe { Box::from_raw(raw.cast::<Page>()) };
            for mailbox in page.iter() {
                mailbox.lock();
                while !mailbox.is_empty() {
                    // SAFETY: mailbox lock held; popped envelopes are
                    // exclusively owned and destroyed once.
                    unsafe {
                        let envelope = mailbox.pop();
                        Envelope::destroy(backing, envelope);
                    }
                }
                mailbox.unlock();
            }
        }
    }
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory").finish_non_exhaustive()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
