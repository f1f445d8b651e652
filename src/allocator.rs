//! Backing allocator capability and the process-wide allocator manager.
//!
//! Everything the runtime allocates per-message flows through the
//! [`Allocator`] trait: the caching fast path fronts it, and the default
//! implementation ([`SystemAllocator`]) is a thin wrapper over the libc
//! heap. A process-wide [`AllocatorManager`] hands out the backing
//! allocator; it can be replaced once, before first use.

use std::sync::OnceLock;

/// Cache line size assumed by the hot data structures (mailboxes, pools,
/// worker contexts) and by the allocation size/alignment promotion.
pub const CACHE_LINE: usize = 64;

// ── Allocator capability ────────────────────────────────────────────────

/// Raw block allocator consumed by the runtime.
///
/// Allocation returns null on failure; it never panics. Free calls are
/// passed the size (and alignment, where it was requested) of the original
/// allocation so implementations that need the layout can reconstruct it.
pub trait Allocator: Send + Sync {
    /// Allocates `size` bytes with the allocator's natural alignment.
    fn allocate(&self, size: usize) -> *mut u8;

    /// Allocates `size` bytes aligned to `align` (a power of two).
    fn allocate_aligned(&self, size: usize, align: usize) -> *mut u8;

    /// Frees a block previously returned by [`Allocator::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this allocator with
    /// the same `size`, and must not be used after this call.
    unsafe fn free(&self, ptr: *mut u8, size: usize);

    /// Frees a block previously returned by [`Allocator::allocate_aligned`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate_aligned` on this
    /// allocator with the same `size` and `align`, and must not be used
    /// after this call.
    unsafe fn free_aligned(&self, ptr: *mut u8, size: usize, align: usize);
}

// ── SystemAllocator ─────────────────────────────────────────────────────

/// Default backing allocator over the libc heap.
#[derive(Debug, Default)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    fn allocate(&self, size: usize) -> *mut u8 {
        if size == 0 {
            return std::ptr::null_mut();
        }
        // SAFETY: malloc with a non-zero size has no preconditions.
        unsafe { libc::malloc(size).cast() }
    }

    fn allocate_aligned(&self, size: usize, align: usize) -> *mut u8 {
        debug_assert!(align.is_power_of_two());
        if size == 0 {
            return std::ptr::null_mut();
        }
        if align <= std::mem::align_of::<libc::max_align_t>() {
            return self.allocate(size);
        }
        // aligned_alloc requires the size to be a multiple of the alignment.
        let rounded = size.div_ceil(align) * align;
        // SAFETY: `align` is a power of two and `rounded` is a non-zero
        // multiple of it.
        unsafe { libc::aligned_alloc(align, rounded).cast() }
    }

    unsafe fn free(&self, ptr: *mut u8, _size: usize) {
        // SAFETY: caller guarantees `ptr` came from this allocator.
        unsafe { libc::free(ptr.cast()) };
    }

    unsafe fn free_aligned(&self, ptr: *mut u8, _size: usize, _align: usize) {
        // Blocks from malloc and aligned_alloc are both released with free.
        // SAFETY: caller guarantees `ptr` came from this allocator.
        unsafe { libc::free(ptr.cast()) };
    }
}

// ── AllocatorManager ────────────────────────────────────────────────────

/// Process-wide provider of the backing allocator.
///
/// Lazily initialized on first use with a [`SystemAllocator`]. A custom
/// allocator can be installed with [`AllocatorManager::set_allocator`],
/// but only before the manager has been touched — after that the choice
/// is fixed for the life of the process.
pub struct AllocatorManager {
    allocator: Box<dyn Allocator>,
}

static MANAGER: OnceLock<AllocatorManager> = OnceLock::new();

impl AllocatorManager {
    /// Returns the process-wide manager, initializing it on first call.
    #[must_use]
    pub fn instance() -> &'static AllocatorManager {
        MANAGER.get_or_init(|| AllocatorManager {
            allocator: Box::new(SystemAllocator),
        })
    }

    /// Installs a custom backing allocator.
    ///
    /// Returns `false` if the manager was already initialized, in which
    /// case the existing allocator is kept and `allocator` is dropped.
    pub fn set_allocator(allocator: Box<dyn Allocator>) -> bool {
        MANAGER.set(AllocatorManager { allocator }).is_ok()
    }

    /// The backing allocator.
    #[must_use]
    pub fn allocator(&self) -> &dyn Allocator {
        &*self.allocator
    }
}

impl std::fmt::Debug for AllocatorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatorManager").finish_non_exhaustive()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
