//! Real-time safe memory: a size-classed block pool and a deferred-free arena.
//!
//! Both allocators hand out 16-byte aligned blocks preceded by a 16-byte
//! header, so `free` never needs the requested size.

mod arena;
mod buffer;
mod pool;

pub use arena::{ArenaFreer, ArenaStats, DeferredFreeArena, ReaperConfig};
pub use buffer::PooledBuffer;
pub use pool::{PoolAllocator, PoolConfig, PoolStats, NUM_SIZE_CLASSES};

use crate::Result;
use core::alloc::Layout;
use core::ptr::NonNull;

/// Bytes reserved in front of every block handed out by this module.
pub const BLOCK_HEADER: usize = 16;

/// Alignment of every block handed out by this module.
pub const BLOCK_ALIGN: usize = 16;

/// Allocation interface shared by the pool and the arena.
///
/// `allocate` returns at least `size` usable bytes aligned to [`BLOCK_ALIGN`].
pub trait RtAllocator: Send + Sync {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>>;

    /// Return a block to the allocator.
    ///
    /// # Safety
    /// `ptr` must have come from `allocate` on this same allocator and must
    /// not be used or freed again afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>);
}

/// The system allocator seam.
///
/// The pool calls it only when a size class is empty, the arena on allocate
/// and from its reaper thread. Tests plug in counting implementations.
///
/// # Safety
/// Implementations must behave like [`std::alloc::GlobalAlloc`]: `alloc`
/// returns null or a block valid for `layout`, and `dealloc` accepts exactly
/// the blocks `alloc` produced with the same layout.
pub unsafe trait BackingAllocator: Send + Sync + 'static {
    fn alloc(&self, layout: Layout) -> *mut u8;

    /// # Safety
    /// See the trait-level contract.
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout);
}

/// Process heap via `std::alloc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHeap;

unsafe impl BackingAllocator for SystemHeap {
    #[inline]
    fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: every layout built in this module has a non-zero size.
        unsafe { std::alloc::alloc(layout) }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        std::alloc::dealloc(ptr, layout)
    }
}

impl<A: RtAllocator + ?Sized> RtAllocator for std::sync::Arc<A> {
    #[inline]
    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        (**self).allocate(size)
    }

    #[inline]
    unsafe fn free(&self, ptr: NonNull<u8>) {
        (**self).free(ptr)
    }
}

/// Raw block pointer that may cross threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct RawBlock(NonNull<u8>);

// SAFETY: a RawBlock is an owning token for memory no one else references
// while it sits on a free list or in the reaper's queue.
unsafe impl Send for RawBlock {}

impl RawBlock {
    #[inline]
    fn user_ptr(self) -> NonNull<u8> {
        // SAFETY: every block is at least BLOCK_HEADER bytes long.
        unsafe { NonNull::new_unchecked(self.0.as_ptr().add(BLOCK_HEADER)) }
    }

    #[inline]
    unsafe fn from_user_ptr(ptr: NonNull<u8>) -> Self {
        RawBlock(NonNull::new_unchecked(ptr.as_ptr().sub(BLOCK_HEADER)))
    }
}
