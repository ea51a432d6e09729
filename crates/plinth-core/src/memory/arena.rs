//! Deferred-free arena.
//!
//! Allocation goes straight to the backing allocator and is only legal off
//! the audio thread. Freeing is legal anywhere: the block is pushed onto an
//! intrusive lock-free stack and a background reaper thread hands it back to
//! the system later.
//!
//! [`DeferredFreeArena::defer_drop`] moves a whole value into an arena block,
//! so its destructor also runs on the reaper.

use super::{BackingAllocator, RawBlock, RtAllocator, SystemHeap, BLOCK_ALIGN, BLOCK_HEADER};
use crate::{rt, Error, Result};
use core::alloc::Layout;
use core::cell::Cell;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

// Set in header word 0 when the block holds a value that must be dropped
// before the memory goes back.
const FINALIZE: usize = 1 << (usize::BITS - 1);

#[repr(C)]
struct Deferred<T> {
    finalize: unsafe fn(*mut u8),
    value: T,
}

unsafe fn finalize<T>(ptr: *mut u8) {
    ptr::drop_in_place(ptr::addr_of_mut!((*ptr.cast::<Deferred<T>>()).value));
}

thread_local! {
    // Arena whose reaper runs on this thread, if any.
    static REAPER_OF: Cell<*const ()> = const { Cell::new(ptr::null()) };
}

/// Reaper thread tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Sleep after a pass that found work.
    pub min_interval: Duration,
    /// Idle sleep ceiling; the sleep doubles on every empty pass up to this.
    pub max_interval: Duration,
    /// Log a warning when a single pass reclaims at least this many blocks.
    pub backlog_warning: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_micros(1),
            max_interval: Duration::from_millis(100),
            backlog_warning: 4096,
        }
    }
}

impl ReaperConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_interval.is_zero() {
            return Err(Error::InvalidConfig("reaper min_interval must be non-zero".into()));
        }
        if self.max_interval < self.min_interval {
            return Err(Error::InvalidConfig(format!(
                "reaper max_interval {:?} is below min_interval {:?}",
                self.max_interval, self.min_interval
            )));
        }
        if self.backlog_warning == 0 {
            return Err(Error::InvalidConfig("reaper backlog_warning must be non-zero".into()));
        }
        Ok(())
    }
}

/// Snapshot of arena counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub allocations: usize,
    pub free_requests: usize,
    /// Blocks returned to the backing allocator.
    pub reaped: usize,
    /// Blocks freed but not yet reclaimed.
    pub pending: usize,
}

enum ReaperCommand {
    Flush(Sender<()>),
    Shutdown,
}

struct ArenaShared<B: BackingAllocator> {
    // Head of the pending stack. Header word 0 holds the layout size and the
    // FINALIZE flag, word 1 the next pending block.
    pending: AtomicPtr<u8>,
    pending_count: AtomicUsize,
    backing: B,
    backlog_warning: usize,
    allocations: AtomicUsize,
    free_requests: AtomicUsize,
    reaped: AtomicUsize,
}

impl<B: BackingAllocator> ArenaShared<B> {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        debug_assert!(
            !rt::is_audio_thread(),
            "DeferredFreeArena::allocate called on the audio thread"
        );

        let layout = size
            .checked_add(BLOCK_HEADER)
            .and_then(|total| Layout::from_size_align(total, BLOCK_ALIGN).ok())
            .ok_or(Error::SizeTooLarge(size))?;

        let Some(raw) = NonNull::new(self.backing.alloc(layout)) else {
            return Err(Error::OutOfMemory {
                size: layout.size(),
            });
        };

        // SAFETY: the block is at least BLOCK_HEADER bytes and aligned.
        unsafe {
            let header = raw.as_ptr().cast::<usize>();
            header.write(layout.size());
            header.add(1).cast::<*mut u8>().write(ptr::null_mut());
        }

        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(RawBlock(raw).user_ptr())
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        let block = RawBlock::from_user_ptr(ptr).0.as_ptr();
        self.free_requests.fetch_add(1, Ordering::Relaxed);

        let me = self as *const Self as *const ();
        if REAPER_OF.with(|r| r.get()) == me {
            self.release(block);
            self.reaped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.pending_count.fetch_add(1, Ordering::Relaxed);
        let next_slot = block.cast::<usize>().add(1).cast::<*mut u8>();
        let mut head = self.pending.load(Ordering::Relaxed);
        loop {
            next_slot.write(head);
            match self
                .pending
                .compare_exchange_weak(head, block, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
    }

    /// Reclaim every pending block. Returns how many were released.
    fn reap(&self) -> usize {
        // Taking the whole stack at once means no node is ever popped while
        // another thread holds a pointer to it.
        let mut block = self.pending.swap(ptr::null_mut(), Ordering::Acquire);
        let mut count = 0;

        while !block.is_null() {
            // SAFETY: every block on the stack was published by `free` with a
            // valid header and is now exclusively ours.
            unsafe {
                let next = block.cast::<usize>().add(1).cast::<*mut u8>().read();
                self.release(block);
                block = next;
            }
            count += 1;
        }

        if count > 0 {
            self.pending_count.fetch_sub(count, Ordering::Relaxed);
            self.reaped.fetch_add(count, Ordering::Relaxed);
            if count >= self.backlog_warning {
                tracing::warn!(count, "Deferred-free backlog reclaimed in one pass");
            }
        }
        count
    }

    unsafe fn release(&self, block: *mut u8) {
        let word = block.cast::<usize>().read();
        if word & FINALIZE != 0 {
            let value = block.add(BLOCK_HEADER);
            let finalize = value.cast::<unsafe fn(*mut u8)>().read();
            if panic::catch_unwind(AssertUnwindSafe(|| finalize(value))).is_err() {
                tracing::error!("Deferred drop panicked; memory reclaimed anyway");
            }
        }
        let layout = Layout::from_size_align_unchecked(word & !FINALIZE, BLOCK_ALIGN);
        self.backing.dealloc(block, layout);
    }

    fn stats(&self) -> ArenaStats {
        ArenaStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            free_requests: self.free_requests.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
            pending: self.pending_count.load(Ordering::Relaxed),
        }
    }
}

impl<B: BackingAllocator> Drop for ArenaShared<B> {
    fn drop(&mut self) {
        self.reap();
    }
}

/// Allocator that never reclaims memory on the thread that frees it.
///
/// ```ignore
/// let arena = DeferredFreeArena::new(ReaperConfig::default())?;
/// let block = arena.allocate(4096)?;      // control thread
/// let freer = arena.freer();
/// unsafe { freer.free(block) };           // audio thread: push only
/// ```
pub struct DeferredFreeArena<B: BackingAllocator = SystemHeap> {
    shared: Arc<ArenaShared<B>>,
    command_tx: Sender<ReaperCommand>,
    thread_handle: Option<JoinHandle<()>>,
}

impl DeferredFreeArena<SystemHeap> {
    pub fn new(config: ReaperConfig) -> Result<Self> {
        Self::with_backing(config, SystemHeap)
    }
}

impl<B: BackingAllocator> DeferredFreeArena<B> {
    /// Create the arena and start its reaper thread.
    pub fn with_backing(config: ReaperConfig, backing: B) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(ArenaShared {
            pending: AtomicPtr::new(ptr::null_mut()),
            pending_count: AtomicUsize::new(0),
            backing,
            backlog_warning: config.backlog_warning,
            allocations: AtomicUsize::new(0),
            free_requests: AtomicUsize::new(0),
            reaped: AtomicUsize::new(0),
        });

        let (tx, rx) = bounded(16);
        let reaper_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("plinth-reaper".into())
            .spawn(move || reaper_loop(reaper_shared, rx, config))
            .map_err(|source| Error::Spawn {
                name: "reaper",
                source,
            })?;

        tracing::debug!(?config, "Deferred-free arena started");

        Ok(Self {
            shared,
            command_tx: tx,
            thread_handle: Some(handle),
        })
    }

    /// Free-only handle for other threads, typically the audio thread.
    pub fn freer(&self) -> ArenaFreer<B> {
        ArenaFreer {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Block until every block freed before this call has been reclaimed.
    pub fn flush(&self) {
        if self.thread_handle.is_none() {
            self.shared.reap();
            return;
        }

        let (ack_tx, ack_rx) = bounded(1);
        if self.command_tx.send(ReaperCommand::Flush(ack_tx)).is_err() || ack_rx.recv().is_err() {
            // Reaper already gone; reclaim here.
            self.shared.reap();
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }

    /// Stop the reaper and reclaim everything still pending.
    ///
    /// Blocks freed afterwards stay pending until `flush` or drop.
    pub fn stop(&mut self) {
        let _ = self.command_tx.send(ReaperCommand::Shutdown);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::debug!("Deferred-free arena stopped");
        }

        self.shared.reap();
    }

    pub fn stats(&self) -> ArenaStats {
        self.shared.stats()
    }

    /// Move `value` into an arena block and queue it, so it is dropped on the
    /// reaper thread instead of here.
    ///
    /// Allocates, so call it off the audio thread. If the block cannot be
    /// allocated the value is dropped in place.
    pub fn defer_drop<T: Send + 'static>(&self, value: T) {
        const { assert!(align_of::<Deferred<T>>() <= BLOCK_ALIGN) };

        let ptr = match self.shared.allocate(size_of::<Deferred<T>>()) {
            Ok(ptr) => ptr,
            Err(error) => {
                tracing::warn!(%error, "Deferred drop fell back to an inline drop");
                drop(value);
                return;
            }
        };

        // SAFETY: the block has room for a Deferred<T> at a 16-byte aligned
        // address, and its header sits BLOCK_HEADER bytes in front.
        unsafe {
            ptr.as_ptr().cast::<Deferred<T>>().write(Deferred {
                finalize: finalize::<T>,
                value,
            });
            let header = ptr.as_ptr().sub(BLOCK_HEADER).cast::<usize>();
            header.write(header.read() | FINALIZE);
            self.shared.free(ptr);
        }
    }

    /// Blocks freed but not yet reclaimed.
    pub fn pending(&self) -> usize {
        self.shared.pending_count.load(Ordering::Relaxed)
    }
}

impl<B: BackingAllocator> RtAllocator for DeferredFreeArena<B> {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        self.shared.allocate(size)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        self.shared.free(ptr)
    }
}

impl<B: BackingAllocator> Drop for DeferredFreeArena<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Cloneable free-only handle to a [`DeferredFreeArena`].
///
/// Keeps the arena's bookkeeping alive, so blocks freed after the arena is
/// dropped are still reclaimed when the last handle goes.
pub struct ArenaFreer<B: BackingAllocator = SystemHeap> {
    shared: Arc<ArenaShared<B>>,
}

impl<B: BackingAllocator> ArenaFreer<B> {
    /// Queue a block for reclamation. Lock-free and allocation-free.
    ///
    /// # Safety
    /// `ptr` must have come from `allocate` on the arena this handle was
    /// taken from, and must not be used or freed again.
    #[inline]
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        self.shared.free(ptr)
    }

    pub fn pending(&self) -> usize {
        self.shared.pending_count.load(Ordering::Relaxed)
    }
}

impl<B: BackingAllocator> Clone for ArenaFreer<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

fn reaper_loop<B: BackingAllocator>(
    shared: Arc<ArenaShared<B>>,
    rx: Receiver<ReaperCommand>,
    config: ReaperConfig,
) {
    REAPER_OF.with(|r| r.set(Arc::as_ptr(&shared).cast()));

    let mut interval = config.min_interval;
    loop {
        match rx.recv_timeout(interval) {
            Ok(ReaperCommand::Flush(ack)) => {
                shared.reap();
                let _ = ack.send(());
                interval = config.min_interval;
            }
            Ok(ReaperCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                interval = if shared.reap() > 0 {
                    config.min_interval
                } else {
                    (interval * 2).min(config.max_interval)
                };
            }
        }
    }

    shared.reap();
    REAPER_OF.with(|r| r.set(ptr::null()));
}
