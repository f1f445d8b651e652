//! Size-class caching allocator — the message allocation fast path.
//!
//! A [`CachingAllocator`] fronts a backing [`Allocator`] with
//! [`POOL_COUNT`] bounded free-lists indexed by size class. All sizes and
//! alignments are promoted to at least a cache line, which keeps every
//! cached block reusable for every same-class request and avoids false
//! sharing between envelopes. Blocks too large for any class bypass the
//! cache entirely.
//!
//! Two instantiations are used by the runtime:
//!
//! - `CachingAllocator<SpinLock>` — the framework-wide message cache,
//!   shared by non-worker senders. Per-bucket locks mean allocations of
//!   different size classes never contend.
//! - `CachingAllocator<NullLock>` — one per worker context, touched only
//!   by the owning thread.

use crate::allocator::{Allocator, AllocatorManager, CACHE_LINE};
use crate::pool::Pool;
use crate::spinlock::RawLock;

/// Number of size-class pools. With four-byte class granularity and the
/// cache-line floor, classes cover block sizes from 64 to 188 bytes —
/// enough for the envelope header plus typical message payloads.
pub const POOL_COUNT: usize = 32;

/// A caching allocator over free memory blocks of various small sizes.
pub struct CachingAllocator<L: RawLock> {
    backing: &'static dyn Allocator,
    pools: [Pool<L>; POOL_COUNT],
}

impl<L: RawLock> CachingAllocator<L> {
    /// Creates a caching allocator over an explicit backing allocator.
    #[must_use]
    pub fn new(backing: &'static dyn Allocator) -> Self {
        Self {
            backing,
            pools: std::array::from_fn(|_| Pool::new()),
        }
    }

    /// Maps a promoted block size to its pool index.
    ///
    /// Sizes are rounded to four-byte words and rebased at the cache-line
    /// word count, so class 0 is exactly one cache line. Indices at or
    /// beyond [`POOL_COUNT`] are uncacheable.
    fn bucket(size: usize) -> usize {
        debug_assert!(size >= CACHE_LINE);
        size.div_ceil(4) - CACHE_LINE / 4
    }

    /// Promoted allocation size: at least one cache line.
    fn effective_size(size: usize) -> usize {
        size.max(CACHE_LINE)
    }

    fn allocate_inline(&self, size: usize, align: usize) -> *mut u8 {
        debug_assert!(size >= CACHE_LINE);
        debug_assert!(align >= CACHE_LINE && align.is_power_of_two());

        let index = Self::bucket(size);
        if index < POOL_COUNT {
            let pool = &self.pools[index];
            pool.lock();
            // SAFETY: pool lock held.
            let block = unsafe { pool.fetch_aligned(align) };
            pool.unlock();
            if !block.is_null() {
                return block;
            }
        }

        self.backing.allocate_aligned(size, align)
    }

    fn free_inline(&self, block: *mut u8, size: usize) {
        debug_assert!(!block.is_null());
        debug_assert!(size >= CACHE_LINE);

        let index = Self::bucket(size);
        if index < POOL_COUNT {
            let pool = &self.pools[index];
            pool.lock();
            // SAFETY: pool lock held; the block is owned by the caller and
            // at least a cache line, so the in-place node fits.
            let cached = unsafe { pool.add(block) };
            pool.unlock();
            if cached {
                return;
            }
        }

        // Pool full or size uncacheable: release to the backing allocator.
        // SAFETY: the block originated from `backing` (cache hits recycle
        // blocks that were themselves backing allocations).
        unsafe { self.backing.free_aligned(block, size, CACHE_LINE) };
    }

    /// Releases every cached block to the backing allocator.
    pub fn clear(&self) {
        for (index, pool) in self.pools.iter().enumerate() {
            let size = (index + CACHE_LINE / 4) * 4;
            pool.lock();
            loop {
                // SAFETY: pool lock held.
                let block = unsafe { pool.fetch() };
                if block.is_null() {
                    break;
                }
                // SAFETY: blocks in the pool came from `backing`.
                unsafe { self.backing.free_aligned(block, size, CACHE_LINE) };
            }
            pool.unlock();
        }
    }
}

impl<L: RawLock> Allocator for CachingAllocator<L> {
    fn allocate(&self, size: usize) -> *mut u8 {
        // Promote small allocations to cache-line size and alignment to
        // improve the pool hit rate.
        self.allocate_inline(Self::effective_size(size), CACHE_LINE)
    }

    fn allocate_aligned(&self, size: usize, align: usize) -> *mut u8 {
        self.allocate_inline(Self::effective_size(size), align.max(CACHE_LINE))
    }

    unsafe fn free(&self, ptr: *mut u8, size: usize) {
        self.free_inline(ptr, Self::effective_size(size));
    }

    unsafe fn free_aligned(&self, ptr: *mut u8, size: usize, _align: usize) {
        self.free_inline(ptr, Self::effective_size(size));
    }
}

impl<L: RawLock> Default for CachingAllocator<L> {
    /// A caching allocator over the process-wide backing allocator.
    fn default() -> Self {
        Self::new(AllocatorManager::instance().allocator())
    }
}

impl<L: RawLock> Drop for CachingAllocator<L> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<L: RawLock> std::fmt::Debug for CachingAllocator<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingAllocator").finish_non_exhaustive()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spinlock::{NullLock, SpinLock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backing allocator that counts live blocks.
    #[derive(Default)]
    struct CountingAllocator {
        live: AtomicUsize,
    }

    impl Allocator for CountingAllocator {
        fn allocate(&self, size: usize) -> *mut u8 {
            self.allocate_aligned(size, CACHE_LINE)
        }

        fn allocate_aligned(&self, size: usize, align: usize) -> *mut u8 {
            self.live.fetch_add(1, Ordering::Relaxed);
            crate::allocator::SystemAllocator.allocate_aligned(size, align)
        }

        unsafe fn free(&self, ptr: *mut u8, size: usize) {
            // SAFETY: forwarded with the caller's own guarantees.
            unsafe { self.free_aligned(ptr, size, CACHE_LINE) };
        }

        unsafe fn free_aligned(&self, ptr: *mut u8, size: usize, align: usize) {
            self.live.fetch_sub(1, Ordering::Relaxed);
            // SAFETY: forwarded with the caller's own guarantees.
            unsafe { crate::allocator::SystemAllocator.free_aligned(ptr, size, align) };
        }
    }

    fn leaked_counter() -> &'static CountingAllocator {
        Box::leak(Box::new(CountingAllocator::default()))
    }

    #[test]
    fn free_then_allocate_recycles_block() {
        let cache = CachingAllocator::<NullLock>::default();

        let a = cache.allocate(100);
        assert!(!a.is_null());
        // SAFETY: allocated above with the same size.
        unsafe { cache.free(a, 100) };

        // Same size class: the cached block comes straight back.
        let b = cache.allocate(100);
        assert_eq!(a, b);
        // SAFETY: allocated above with the same size.
        unsafe { cache.free(b, 100) };
    }

    #[test]
    fn distinct_outstanding_blocks_never_alias() {
        let cache = CachingAllocator::<NullLock>::default();

        let a = cache.allocate(64);
        let b = cache.allocate(64);
        assert_ne!(a, b, "allocator returned a live block twice");

        // SAFETY: both allocated above.
        unsafe {
            cache.free(a, 64);
            cache.free(b, 64);
        }
    }

    #[test]
    fn oversized_requests_bypass_pools() {
        let backing = leaked_counter();
        let cache = CachingAllocator::<NullLock>::new(backing);

        // Well past the largest cacheable class.
        let big = cache.allocate(4096);
        assert!(!big.is_null());
        assert_eq!(backing.live.load(Ordering::Relaxed), 1);

        // SAFETY: allocated above with the same size.
        unsafe { cache.free(big, 4096) };
        // Not cached: the block went back to the backing allocator.
        assert_eq!(backing.live.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn clear_drains_every_pool_to_backing() {
        let backing = leaked_counter();
        let cache = CachingAllocator::<SpinLock>::new(backing);

        let blocks: Vec<_> = (0..8).map(|_| cache.allocate(80)).collect();
        for &block in &blocks {
            // SAFETY: allocated above with the same size.
            unsafe { cache.free(block, 80) };
        }
        // All eight are cached, still live from the backing's view.
        assert_eq!(backing.live.load(Ordering::Relaxed), 8);

        cache.clear();
        assert_eq!(backing.live.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn aligned_allocation_honors_alignment() {
        let cache = CachingAllocator::<NullLock>::default();

        let ptr = cache.allocate_aligned(96, 128);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % 128, 0);
        // SAFETY: allocated above with the same layout.
        unsafe { cache.free_aligned(ptr, 96, 128) };
    }
}
