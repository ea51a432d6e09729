use super::RtAllocator;
use crate::Result;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use std::sync::Arc;

/// Zero-initialised `f32` buffer whose storage comes from an [`RtAllocator`].
///
/// Dropping it returns the block to the allocator it came from, so a buffer
/// backed by a pre-warmed pool can be created and dropped on the audio thread.
pub struct PooledBuffer {
    ptr: NonNull<f32>,
    len: usize,
    allocator: Arc<dyn RtAllocator>,
}

// SAFETY: the buffer exclusively owns its block, and the allocator is Send + Sync.
unsafe impl Send for PooledBuffer {}
unsafe impl Sync for PooledBuffer {}

impl PooledBuffer {
    pub fn new(allocator: Arc<dyn RtAllocator>, len: usize) -> Result<Self> {
        let bytes = len
            .checked_mul(core::mem::size_of::<f32>())
            .ok_or(crate::Error::SizeTooLarge(usize::MAX))?;
        let ptr = allocator.allocate(bytes)?.cast::<f32>();

        // SAFETY: the block holds at least `bytes` bytes, aligned to 16.
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, len) };

        Ok(Self {
            ptr,
            len,
            allocator,
        })
    }

    #[inline]
    pub fn clear(&mut self) {
        self.fill(0.0);
    }
}

impl Deref for PooledBuffer {
    type Target = [f32];

    #[inline]
    fn deref(&self) -> &[f32] {
        // SAFETY: ptr is valid for len initialised floats for our lifetime.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for PooledBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut [f32] {
        // SAFETY: as above, and &mut self guarantees exclusivity.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        // SAFETY: the block came from this allocator and is not used again.
        unsafe { self.allocator.free(self.ptr.cast()) };
    }
}

impl core::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PooledBuffer").field("len", &self.len).finish()
    }
}
