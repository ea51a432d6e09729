//! Power-of-two size-classed block pool.
//!
//! One lock-free free stack per size class. Blocks are minted from the
//! backing allocator the first time a class runs dry and recycled forever
//! after; they go back to the system only when the pool is dropped.
//!
//! Each minted block gets a permanent slot in its class's table and carries
//! the slot index in its header. The free stack links slots by index and the
//! head packs `(index, tag)` into one word, so push and pop are a single CAS
//! that never allocates and never suffers ABA.

use super::{BackingAllocator, RawBlock, RtAllocator, SystemHeap, BLOCK_ALIGN, BLOCK_HEADER};
use crate::{rt, Error, Result};
use core::alloc::Layout;
use core::ptr::NonNull;
use crate::table::{SegmentedTable, NULL_INDEX};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};

/// Number of size classes; class `k` holds blocks of `2^k` bytes.
pub const NUM_SIZE_CLASSES: usize = usize::BITS as usize;

const POOL_MAGIC: usize = 0x506f_6f6c;
const CLASS_BITS: u32 = 8;

/// Configuration for [`PoolAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Optional upper bound on blocks minted per size class.
    ///
    /// `None` lets a class grow until the backing allocator fails. Setting a
    /// bound turns runaway allocation into [`Error::PoolExhausted`].
    pub max_blocks_per_class: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_blocks_per_class: None,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        let limit = SegmentedTable::<BlockSlot>::CAPACITY;
        match self.max_blocks_per_class {
            Some(n) if n == 0 || n > limit => Err(Error::InvalidConfig(format!(
                "max_blocks_per_class {n} out of range (1-{limit})"
            ))),
            _ => Ok(()),
        }
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Blocks minted from the backing allocator.
    pub fallback_allocations: usize,
    /// Allocations satisfied from a free list.
    pub recycled_allocations: usize,
    pub frees: usize,
    /// Fallback allocations that happened on a thread marked as the audio thread.
    pub audio_thread_fallbacks: usize,
    /// Largest class ever minted.
    pub largest_class: Option<usize>,
    /// Blocks minted so far, indexed by class.
    pub blocks_per_class: Vec<usize>,
}

#[derive(Default)]
struct BlockSlot {
    block: AtomicPtr<u8>,
    next: AtomicU32,
    on_free_list: AtomicBool,
}

struct SizeClass {
    head: CachePadded<AtomicU64>,
    slots: SegmentedTable<BlockSlot>,
    minted: AtomicUsize,
    free: AtomicUsize,
}

#[inline]
const fn pack(index: u32, tag: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

#[inline]
const fn index_of(word: u64) -> u32 {
    word as u32
}

#[inline]
const fn tag_of(word: u64) -> u32 {
    (word >> 32) as u32
}

impl SizeClass {
    fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicU64::new(pack(NULL_INDEX, 0))),
            slots: SegmentedTable::new(),
            minted: AtomicUsize::new(0),
            free: AtomicUsize::new(0),
        }
    }

    /// Push the block in slot `index`. Returns false on a double free.
    fn push(&self, index: u32) -> bool {
        let slot = self.slots.get(index);
        if slot.on_free_list.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.free.fetch_add(1, Ordering::Relaxed);

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            slot.next.store(index_of(head), Ordering::Relaxed);
            let new = pack(index, tag_of(head).wrapping_add(1));
            match self
                .head
                .compare_exchange_weak(head, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(current) => head = current,
            }
        }
    }

    fn pop(&self) -> Option<RawBlock> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let index = index_of(head);
            if index == NULL_INDEX {
                return None;
            }
            // A stale `next` is harmless: the tag makes the CAS below fail.
            let next = self.slots.get(index).next.load(Ordering::Relaxed);
            let new = pack(next, tag_of(head).wrapping_add(1));
            match self
                .head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }

        let slot = self.slots.get(index_of(head));
        self.free.fetch_sub(1, Ordering::Relaxed);
        slot.on_free_list.store(false, Ordering::Release);
        let block = slot.block.load(Ordering::Acquire);
        // SAFETY: a slot is only linked after its block pointer was stored.
        Some(RawBlock(unsafe { NonNull::new_unchecked(block) }))
    }
}

/// Lock-free pooled allocator.
///
/// Once each class in use has been pre-warmed, `allocate` and `free` are
/// lock-free and never touch the backing allocator, so both are safe on the
/// audio thread.
pub struct PoolAllocator<B: BackingAllocator = SystemHeap> {
    classes: Box<[SizeClass]>,
    capacity: Option<usize>,
    backing: B,
    fallback: AtomicUsize,
    recycled: AtomicUsize,
    frees: AtomicUsize,
    audio_thread_fallbacks: AtomicUsize,
    largest_class: AtomicUsize,
}

impl PoolAllocator<SystemHeap> {
    pub fn new(config: PoolConfig) -> Result<Self> {
        Self::with_backing(config, SystemHeap)
    }
}

impl<B: BackingAllocator> PoolAllocator<B> {
    pub fn with_backing(config: PoolConfig, backing: B) -> Result<Self> {
        config.validate()?;

        let classes = (0..NUM_SIZE_CLASSES).map(|_| SizeClass::new()).collect();

        Ok(Self {
            classes,
            capacity: config.max_blocks_per_class,
            backing,
            fallback: AtomicUsize::new(0),
            recycled: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            audio_thread_fallbacks: AtomicUsize::new(0),
            largest_class: AtomicUsize::new(usize::MAX),
        })
    }

    /// Size class serving a request of `size` usable bytes.
    pub fn class_for(size: usize) -> Result<usize> {
        let class = size
            .checked_add(BLOCK_HEADER)
            .and_then(usize::checked_next_power_of_two)
            .map(|total| total.trailing_zeros() as usize)
            .ok_or(Error::SizeTooLarge(size))?;

        // Layout caps sizes at isize::MAX, which rules out the top class.
        if class >= NUM_SIZE_CLASSES - 1 {
            return Err(Error::SizeTooLarge(size));
        }
        Ok(class)
    }

    /// Total bytes of a block in `class`, header included.
    #[inline]
    pub fn class_size(class: usize) -> usize {
        1usize << class
    }

    /// Bytes available to callers in a block of `class`.
    #[inline]
    pub fn usable_size(class: usize) -> usize {
        Self::class_size(class) - BLOCK_HEADER
    }

    /// Mint blocks until the class serving `size` has `count` free blocks.
    ///
    /// Returns the number of free blocks in that class afterwards. Call this
    /// before entering the audio callback for every size it will request.
    pub fn prewarm(&self, size: usize, count: usize) -> Result<usize> {
        let class = Self::class_for(size)?;
        let slot = &self.classes[class];

        while slot.free.load(Ordering::Relaxed) < count {
            let block = self.mint(class)?;
            // SAFETY: the block was just minted and never handed out.
            unsafe { self.push_block(block) };
        }

        Ok(slot.free.load(Ordering::Relaxed))
    }

    /// Free blocks currently stacked for the class serving `size`.
    pub fn available(&self, size: usize) -> usize {
        Self::class_for(size)
            .map(|class| self.classes[class].free.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Per-class mint bound, `None` when classes grow without limit.
    pub fn capacity_per_class(&self) -> Option<usize> {
        self.capacity
    }

    pub fn stats(&self) -> PoolStats {
        let largest = self.largest_class.load(Ordering::Relaxed);
        PoolStats {
            fallback_allocations: self.fallback.load(Ordering::Relaxed),
            recycled_allocations: self.recycled.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            audio_thread_fallbacks: self.audio_thread_fallbacks.load(Ordering::Relaxed),
            largest_class: (largest != usize::MAX).then_some(largest),
            blocks_per_class: self
                .classes
                .iter()
                .map(|c| c.minted.load(Ordering::Relaxed))
                .collect(),
        }
    }

    fn mint(&self, class: usize) -> Result<RawBlock> {
        let slot = &self.classes[class];
        let layout = Self::layout(class);
        let Some(raw) = NonNull::new(self.backing.alloc(layout)) else {
            return Err(Error::OutOfMemory {
                size: layout.size(),
            });
        };

        let limit = self
            .capacity
            .unwrap_or(SegmentedTable::<BlockSlot>::CAPACITY);
        let Ok(index) = slot
            .minted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
        else {
            // SAFETY: allocated above with this layout and never handed out.
            unsafe { self.backing.dealloc(raw.as_ptr(), layout) };
            return Err(Error::PoolExhausted {
                class,
                capacity: limit,
            });
        };

        let index = index as u32;
        slot.slots.ensure(index);
        slot.slots
            .get(index)
            .block
            .store(raw.as_ptr(), Ordering::Release);

        // SAFETY: the block is at least BLOCK_HEADER bytes and 16-byte aligned.
        unsafe {
            let header = raw.as_ptr().cast::<usize>();
            header.write(class | (index as usize) << CLASS_BITS);
            header.add(1).write(POOL_MAGIC);
        }

        self.fallback.fetch_add(1, Ordering::Relaxed);
        if rt::is_audio_thread() {
            self.audio_thread_fallbacks.fetch_add(1, Ordering::Relaxed);
        }
        self.update_largest(class);

        Ok(RawBlock(raw))
    }

    fn update_largest(&self, class: usize) {
        let _ = self
            .largest_class
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                (current == usize::MAX || class > current).then_some(class)
            });
    }

    #[inline]
    fn layout(class: usize) -> Layout {
        // class_for rejects the classes whose size would overflow isize.
        Layout::from_size_align(Self::class_size(class), BLOCK_ALIGN)
            .unwrap_or_else(|_| unreachable!("size class {class} has no valid layout"))
    }

    /// Put a block back on its class's free stack.
    ///
    /// Returns false if it was already there.
    unsafe fn push_block(&self, block: RawBlock) -> bool {
        let header = block.0.as_ptr().cast::<usize>();
        let word = header.read();
        debug_assert_eq!(header.add(1).read(), POOL_MAGIC, "block not from a pool");
        let class = word & ((1 << CLASS_BITS) - 1);
        let index = (word >> CLASS_BITS) as u32;
        self.classes[class].push(index)
    }
}

impl<B: BackingAllocator> RtAllocator for PoolAllocator<B> {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        let class = Self::class_for(size)?;

        if let Some(block) = self.classes[class].pop() {
            self.recycled.fetch_add(1, Ordering::Relaxed);
            return Ok(block.user_ptr());
        }

        self.mint(class).map(RawBlock::user_ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        let block = RawBlock::from_user_ptr(ptr);
        if !self.push_block(block) {
            // Already on the free stack. Ignoring it keeps the stack intact.
            debug_assert!(false, "double free of pool block {ptr:p}");
            return;
        }
        self.frees.fetch_add(1, Ordering::Relaxed);
    }
}

impl<B: BackingAllocator> Drop for PoolAllocator<B> {
    fn drop(&mut self) {
        for (class, slot) in self.classes.iter().enumerate() {
            while let Some(block) = slot.pop() {
                // SAFETY: stacked blocks are owned by the pool.
                unsafe { self.backing.dealloc(block.0.as_ptr(), Self::layout(class)) };
            }
        }
    }
}
