//! Type-erased message envelopes.
//!
//! An [`Envelope`] is a single heap block holding a fixed header followed
//! by the payload value in place. The header carries the originator
//! address, a process-stable type tag ([`TypeId`]), a destructor thunk
//! for the erased payload, and an intrusive `next` link used by the
//! mailbox FIFO — so queuing an envelope never allocates.
//!
//! Envelopes are created by senders from a caching allocator and
//! destroyed exactly once: by the worker that dispatched them, or by the
//! failure path of an unroutable send.

use std::any::TypeId;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::address::Address;
use crate::allocator::Allocator;

/// A type-erased message in flight.
#[repr(C)]
pub struct Envelope {
    /// Intrusive FIFO link. Owned by the mailbox holding the envelope.
    next: AtomicPtr<Envelope>,
    from: Address,
    type_tag: TypeId,
    /// Drops the payload in place. `None` when the payload type has no
    /// drop glue.
    drop_fn: Option<unsafe fn(*mut u8)>,
    /// Byte offset from the envelope base to the payload.
    payload_offset: u32,
    /// Payload size in bytes.
    payload_size: u32,
    /// Total allocation size, for returning the block.
    block_size: u32,
    /// Allocation alignment, for returning the block.
    block_align: u32,
}

/// Destructor thunk instantiated per payload type.
unsafe fn drop_payload<T>(payload: *mut u8) {
    // SAFETY: `payload` points to a valid, initialized `T` owned by the
    // envelope; it is dropped exactly once, here.
    unsafe { ptr::drop_in_place(payload.cast::<T>()) };
}

impl Envelope {
    /// Allocates an envelope from `alloc` and moves `value` into it.
    ///
    /// Returns null on allocation failure, in which case `value` is
    /// dropped normally.
    pub(crate) fn create<T: Send + 'static>(
        alloc: &dyn Allocator,
        value: T,
        from: Address,
    ) -> *mut Envelope {
        let payload_align = mem::align_of::<T>();
        let offset = mem::size_of::<Envelope>().next_multiple_of(payload_align.max(1));
        let total = offset + mem::size_of::<T>();
        let align = mem::align_of::<Envelope>().max(payload_align);

        let Ok(block_size) = u32::try_from(total) else {
            return ptr::null_mut();
        };

        let block = alloc.allocate_aligned(total, align);
        if block.is_null() {
            return ptr::null_mut();
        }

        let envelope = block.cast::<Envelope>();
        // SAFETY: `block` is a fresh allocation of `total` bytes, aligned
        // for both the header and (via `offset`) the payload.
        unsafe {
            ptr::write(
                envelope,
                Envelope {
                    next: AtomicPtr::new(ptr::null_mut()),
                    from,
                    type_tag: TypeId::of::<T>(),
                    drop_fn: mem::needs_drop::<T>().then_some(drop_payload::<T> as unsafe fn(*mut u8)),
                    payload_offset: offset as u32,
                    payload_size: mem::size_of::<T>() as u32,
                    block_size,
                    block_align: align as u32,
                },
            );
            ptr::write(block.add(offset).cast::<T>(), value);
        }

        envelope
    }

    /// Drops the payload and returns the block to `alloc`.
    ///
    /// # Safety
    ///
    /// `envelope` must have been produced by [`Envelope::create`], must
    /// not be queued in any mailbox, and must not be used after this call.
    /// `alloc` must share the backing allocator of the creating cache.
    pub(crate) unsafe fn destroy(alloc: &dyn Allocator, envelope: *mut Envelope) {
        debug_assert!(!envelope.is_null());
        // SAFETY: caller guarantees exclusive ownership of a live envelope.
        unsafe {
            let drop_fn = (*envelope).drop_fn;
            let offset = (*envelope).payload_offset as usize;
            let size = (*envelope).block_size as usize;
            let align = (*envelope).block_align as usize;

            if let Some(drop_fn) = drop_fn {
                drop_fn(envelope.cast::<u8>().add(offset));
            }
            // The header itself has no drop glue.
            alloc.free_aligned(envelope.cast(), size, align);
        }
    }

    /// Address of the sender that created this envelope.
    #[must_use]
    pub fn sender(&self) -> Address {
        self.from
    }

    /// Returns `true` if the payload is a `T`.
    #[must_use]
    pub fn is<T: 'static>(&self) -> bool {
        self.type_tag == TypeId::of::<T>()
    }

    /// Borrows the payload as a `T`, or `None` on a type-tag mismatch.
    #[must_use]
    pub fn get<T: 'static>(&self) -> Option<&T> {
        if !self.is::<T>() {
            return None;
        }
        // SAFETY: the tag matched, so the payload was written as a `T` by
        // `create` and is still alive (destroy consumes the envelope).
        Some(unsafe { &*self.payload_ptr().cast::<T>() })
    }

    /// Raw view of the payload bytes, for blind fallback handlers.
    #[must_use]
    pub fn payload_bytes(&self) -> (*const u8, usize) {
        (self.payload_ptr(), self.payload_size as usize)
    }

    fn payload_ptr(&self) -> *mut u8 {
        let base = ptr::from_ref(self).cast_mut().cast::<u8>();
        // SAFETY: offset stays within the allocation by construction.
        unsafe { base.add(self.payload_offset as usize) }
    }

    // ── Intrusive link, used by the mailbox FIFO ────────────────────────

    pub(crate) fn link_next(&self) -> *mut Envelope {
        self.next.load(Ordering::Acquire)
    }

    pub(crate) fn set_link_next(&self, next: *mut Envelope) {
        self.next.store(next, Ordering::Release);
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AllocatorManager;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn backing() -> &'static dyn Allocator {
        AllocatorManager::instance().allocator()
    }

    #[test]
    fn payload_roundtrip() {
        let from = Address::new(1, 5);
        let env = Envelope::create(backing(), 42_u64, from);
        assert!(!env.is_null());

        // SAFETY: freshly created, exclusively owned.
        unsafe {
            assert_eq!((*env).sender(), from);
            assert!((*env).is::<u64>());
            assert!(!(*env).is::<u32>());
            assert_eq!((*env).get::<u64>(), Some(&42));
            assert_eq!((*env).get::<i64>(), None);
            Envelope::destroy(backing(), env);
        }
    }

    #[test]
    fn destroy_drops_payload_exactly_once() {
        struct Probe(Arc<AtomicU32>);
        impl Drop for Probe {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicU32::new(0));
        let env = Envelope::create(backing(), Probe(Arc::clone(&drops)), Address::NULL);
        assert!(!env.is_null());
        assert_eq!(drops.load(Ordering::Relaxed), 0);

        // SAFETY: freshly created, exclusively owned.
        unsafe { Envelope::destroy(backing(), env) };
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn zero_sized_payload() {
        struct Nothing;
        let env = Envelope::create(backing(), Nothing, Address::NULL);
        assert!(!env.is_null());

        // SAFETY: freshly created, exclusively owned.
        unsafe {
            assert!((*env).is::<Nothing>());
            let (_, size) = (*env).payload_bytes();
            assert_eq!(size, 0);
            Envelope::destroy(backing(), env);
        }
    }

    #[test]
    fn high_alignment_payload_is_aligned() {
        #[repr(align(128))]
        #[derive(Clone, Copy)]
        struct Wide([u8; 128]);

        let env = Envelope::create(backing(), Wide([7; 128]), Address::NULL);
        assert!(!env.is_null());

        // SAFETY: freshly created, exclusively owned.
        unsafe {
            let (ptr, size) = (*env).payload_bytes();
            assert_eq!(size, 128);
            assert_eq!(ptr as usize % 128, 0);
            Envelope::destroy(backing(), env);
        }
    }

    #[test]
    fn link_roundtrip() {
        let a = Envelope::create(backing(), 1_u8, Address::NULL);
        let b = Envelope::create(backing(), 2_u8, Address::NULL);

        // SAFETY: both freshly created, exclusively owned.
        unsafe {
            (*a).set_link_next(b);
            assert_eq!((*a).link_next(), b);
            (*a).set_link_next(std::ptr::null_mut());
            Envelope::destroy(backing(), a);
            Envelope::destroy(backing(), b);
        }
    }
}
