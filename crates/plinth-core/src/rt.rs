//! Audio-thread identification.
//!
//! The callback driver marks the thread it renders on. Allocation paths that
//! must never run there (`DeferredFreeArena::allocate`, pool minting) check
//! the mark in debug builds.

use core::cell::Cell;

thread_local! {
    static AUDIO_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Mark the current thread as the real-time audio thread.
///
/// Cheap and allocation free, so it can run at the top of every callback;
/// platforms that rotate callback threads are handled too.
#[inline]
pub fn mark_audio_thread() {
    AUDIO_THREAD.with(|flag| flag.set(true));
}

/// Clear the audio-thread mark on the current thread.
#[inline]
pub fn unmark_audio_thread() {
    AUDIO_THREAD.with(|flag| flag.set(false));
}

/// Whether the current thread has been marked as the audio thread.
#[inline]
pub fn is_audio_thread() -> bool {
    AUDIO_THREAD.with(|flag| flag.get())
}

/// Marks the current thread as the audio thread until dropped, then restores
/// the previous mark.
///
/// Offline rendering borrows the caller's thread for a block; the scope keeps
/// that thread's mark from leaking past the block.
#[must_use]
pub struct AudioThreadScope {
    was_marked: bool,
}

impl AudioThreadScope {
    #[inline]
    pub fn enter() -> Self {
        let was_marked = is_audio_thread();
        mark_audio_thread();
        Self { was_marked }
    }
}

impl Drop for AudioThreadScope {
    #[inline]
    fn drop(&mut self) {
        if !self.was_marked {
            unmark_audio_thread();
        }
    }
}
