//! Per-actor mailboxes.
//!
//! A [`Mailbox`] is a fixed-address, cache-line-aligned record holding a
//! singly-linked FIFO of envelopes, a non-owning back-reference to the
//! registered actor, a pin counter, and a per-mailbox spinlock. The
//! mailbox embeds the intrusive `work_next` link used by the work queues,
//! so scheduling a mailbox never allocates.
//!
//! Invariants:
//!
//! - `count == 0` iff the FIFO is empty.
//! - A registered actor implies an occupied mailbox; a vacant mailbox may
//!   still hold queued envelopes (delivered to the fallback handler).
//! - `pin_count > 0` forbids registration and deregistration.
//! - A mailbox is linked into at most one work queue at a time.

use std::cell::UnsafeCell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::actor::Actor;
use crate::envelope::Envelope;
use crate::spinlock::SpinLock;

/// An individual mailbox with a fixed directory index.
#[repr(align(64))]
pub(crate) struct Mailbox {
    /// Intrusive work-queue link. Owned by the queue holding the mailbox.
    work_next: AtomicPtr<Mailbox>,
    lock: SpinLock,
    /// FIFO head. Atomic so unlocked peeks are well-defined.
    head: AtomicPtr<Envelope>,
    /// FIFO tail. Mutated only under the lock.
    tail: AtomicPtr<Envelope>,
    count: AtomicU32,
    pins: AtomicU32,
    /// Back-reference to the registered actor. Guarded by `lock`; never
    /// owning — actor storage belongs to user code.
    actor: UnsafeCell<Option<NonNull<dyn Actor>>>,
    /// Optional registration name. Guarded by `lock`.
    name: UnsafeCell<Option<Box<str>>>,
    /// Directory index, fixed at construction.
    index: u32,
}

// SAFETY: queue pointers and counters are atomics; `actor` and `name` are
// only accessed under the mailbox spinlock. Envelope pointers in the FIFO
// are exclusively owned by the mailbox while queued.
unsafe impl Send for Mailbox {}
// SAFETY: as above.
unsafe impl Sync for Mailbox {}

impl Mailbox {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            work_next: AtomicPtr::new(ptr::null_mut()),
            lock: SpinLock::new(),
            head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
            count: AtomicU32::new(0),
            pins: AtomicU32::new(0),
            actor: UnsafeCell::new(None),
            name: UnsafeCell::new(None),
            index,
        }
    }

    /// Directory index of this mailbox.
    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    /// Acquires exclusive access to the mailbox.
    pub(crate) fn lock(&self) {
        self.lock.lock();
    }

    /// Relinquishes exclusive access.
    pub(crate) fn unlock(&self) {
        self.lock.unlock();
    }

    // ── Message queue ───────────────────────────────────────────────────

    /// Returns `true` if the mailbox holds no messages.
    ///
    /// Callable without the lock as a peek; authoritative under the lock.
    pub(crate) fn is_empty(&self) -> bool {
        self.count.load(Ordering::Acquire) == 0
    }

    /// Number of queued messages.
    pub(crate) fn message_count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Appends an envelope to the FIFO.
    ///
    /// # Safety
    ///
    /// The caller must hold the mailbox lock and own `envelope`, which
    /// must not be queued anywhere else.
    pub(crate) unsafe fn push(&self, envelope: *mut Envelope) {
        debug_assert!(!envelope.is_null());
        // SAFETY: lock held; the envelope is exclusively owned.
        unsafe {
            (*envelope).set_link_next(ptr::null_mut());
            let tail = self.tail.load(Ordering::Acquire);
            if tail.is_null() {
                self.head.store(envelope, Ordering::Release);
            } else {
                (*tail).set_link_next(envelope);
            }
            self.tail.store(envelope, Ordering::Release);
        }
        self.count.fetch_add(1, Ordering::Release);
    }

    /// Peeks at the first queued envelope, or null if empty.
    pub(crate) fn front(&self) -> *mut Envelope {
        self.head.load(Ordering::Acquire)
    }

    /// Removes and returns the first queued envelope.
    ///
    /// # Safety
    ///
    /// The caller must hold the mailbox lock. The mailbox must be
    /// non-empty.
    pub(crate) unsafe fn pop(&self) -> *mut Envelope {
        let head = self.head.load(Ordering::Acquire);
        debug_assert!(!head.is_null());
        // SAFETY: lock held; `head` is a live envelope owned by the queue.
        let next = unsafe { (*head).link_next() };
        self.head.store(next, Ordering::Release);
        if next.is_null() {
            self.tail.store(ptr::null_mut(), Ordering::Release);
        }
        self.count.fetch_sub(1, Ordering::Release);
        head
    }

    // ── Actor registration ──────────────────────────────────────────────

    /// Registers an actor with this mailbox.
    ///
    /// Fails fast (returns `false`) if the mailbox is pinned or already
    /// occupied.
    ///
    /// # Safety
    ///
    /// The caller must hold the mailbox lock. `actor` must remain valid
    /// until a matching deregistration completes.
    pub(crate) unsafe fn register_actor(&self, actor: NonNull<dyn Actor>) -> bool {
        if self.is_pinned() {
            return false;
        }
        // SAFETY: lock held per contract.
        let slot = unsafe { &mut *self.actor.get() };
        if slot.is_some() {
            debug_assert!(false, "mailbox {} already occupied", self.index);
            return false;
        }
        *slot = Some(actor);
        true
    }

    /// Deregisters the currently registered actor.
    ///
    /// Fails fast (returns `false`) if the mailbox is pinned or vacant.
    ///
    /// # Safety
    ///
    /// The caller must hold the mailbox lock.
    pub(crate) unsafe fn deregister_actor(&self) -> bool {
        if self.is_pinned() {
            return false;
        }
        // SAFETY: lock held per contract.
        let slot = unsafe { &mut *self.actor.get() };
        debug_assert!(slot.is_some(), "mailbox {} already vacant", self.index);
        slot.take().is_some()
    }

    /// The registered actor, if any.
    ///
    /// # Safety
    ///
    /// The caller must hold the mailbox lock, or hold a pin taken under
    /// the lock (pinning freezes the registration).
    pub(crate) unsafe fn actor(&self) -> Option<NonNull<dyn Actor>> {
        // SAFETY: lock or pin held per contract.
        unsafe { *self.actor.get() }
    }

    // ── Pinning ─────────────────────────────────────────────────────────

    /// Pins the mailbox, freezing the actor registration.
    ///
    /// # Safety
    ///
    /// The caller must hold the mailbox lock.
    pub(crate) unsafe fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases one pin.
    ///
    /// # Safety
    ///
    /// The caller must hold the mailbox lock and a previously taken pin.
    pub(crate) unsafe fn unpin(&self) {
        let previous = self.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "pin count underflow");
    }

    /// Returns `true` while any pin is held.
    pub(crate) fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    // ── Name ────────────────────────────────────────────────────────────

    /// Sets the registration name.
    ///
    /// # Safety
    ///
    /// The caller must hold the mailbox lock.
    pub(crate) unsafe fn set_name(&self, name: Option<Box<str>>) {
        // SAFETY: lock held per contract.
        unsafe { *self.name.get() = name };
    }

    /// Clones the registration name.
    ///
    /// # Safety
    ///
    /// The caller must hold the mailbox lock.
    pub(crate) unsafe fn name(&self) -> Option<String> {
        // SAFETY: lock held per contract.
        unsafe { (*self.name.get()).as_deref().map(str::to_owned) }
    }

    // ── Intrusive link, used by the work queues ─────────────────────────

    pub(crate) fn work_next(&self) -> *mut Mailbox {
        self.work_next.load(Ordering::Acquire)
    }

    pub(crate) fn set_work_next(&self, next: *mut Mailbox) {
        self.work_next.store(next, Ordering::Release);
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::DispatchContext;
    use crate::address::Address;
    use crate::allocator::AllocatorManager;

    struct Inert;
    impl Actor for Inert {
        fn dispatch(&mut self, _ctx: &mut DispatchContext<'_>, _message: &Envelope) -> bool {
            true
        }
    }

    fn envelope(value: u32) -> *mut Envelope {
        Envelope::create(
            AllocatorManager::instance().allocator(),
            value,
            Address::NULL,
        )
    }

    unsafe fn destroy(env: *mut Envelope) {
        // SAFETY: forwarded with the caller's guarantees.
        unsafe { Envelope::destroy(AllocatorManager::instance().allocator(), env) };
    }

    #[test]
    fn push_pop_is_fifo_and_counts() {
        let mailbox = Mailbox::new(1);
        let a = envelope(1);
        let b = envelope(2);

        mailbox.lock();
        // SAFETY: lock held; envelopes exclusively owned.
        unsafe {
            assert!(mailbox.is_empty());
            mailbox.push(a);
            mailbox.push(b);
            assert_eq!(mailbox.message_count(), 2);
            assert_eq!(mailbox.front(), a);

            assert_eq!(mailbox.pop(), a);
            assert_eq!(mailbox.pop(), b);
            assert!(mailbox.is_empty());
        }
        mailbox.unlock();

        // SAFETY: popped above, exclusively owned again.
        unsafe {
            destroy(a);
            destroy(b);
        }
    }

    #[test]
    fn pin_blocks_registration_changes() {
        let mailbox = Mailbox::new(2);
        let mut actor = Inert;
        let actor_ptr = NonNull::from(&mut actor as &mut dyn Actor);

        mailbox.lock();
        // SAFETY: lock held; `actor` outlives the mailbox use below.
        unsafe {
            assert!(mailbox.register_actor(actor_ptr));

            mailbox.pin();
            assert!(mailbox.is_pinned());
            assert!(!mailbox.deregister_actor(), "deregister succeeded while pinned");
            assert!(mailbox.actor().is_some());

            mailbox.unpin();
            assert!(!mailbox.is_pinned());
            assert!(mailbox.deregister_actor());
            assert!(mailbox.actor().is_none());
        }
        mailbox.unlock();
    }

    #[test]
    fn register_rejects_occupied_mailbox() {
        let mailbox = Mailbox::new(3);
        let mut first = Inert;
        let mut second = Inert;

        mailbox.lock();
        // SAFETY: lock held; actors outlive the mailbox use below.
        unsafe {
            assert!(mailbox.register_actor(NonNull::from(&mut first as &mut dyn Actor)));
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                // SAFETY: lock still held by the enclosing test.
                unsafe { mailbox.register_actor(NonNull::from(&mut second as &mut dyn Actor)) }
            }));
            // Debug builds assert; release builds fail fast with `false`.
            assert!(!result.unwrap_or(false));
            assert!(mailbox.deregister_actor());
        }
        mailbox.unlock();
    }
}
