//! Append-only table addressed by `u32` index.
//!
//! Segment `s` holds `64 << s` entries and is installed the first time an
//! index inside it is needed. Installed segments never move and are only
//! freed when the table itself is dropped, so a `&T` handed out for an index
//! stays valid for the table's lifetime. Lookups are a shift and a load.

use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

const FIRST_SEGMENT_LEN: usize = 64;
const SEGMENT_COUNT: usize = 26;

/// Sentinel index no table entry ever uses.
pub(crate) const NULL_INDEX: u32 = u32::MAX;

pub(crate) struct SegmentedTable<T> {
    segments: [AtomicPtr<T>; SEGMENT_COUNT],
    _owns: PhantomData<Box<[T]>>,
}

impl<T: Default> SegmentedTable<T> {
    /// Indices `0..CAPACITY` are addressable; every one is below [`NULL_INDEX`].
    pub(crate) const CAPACITY: usize = FIRST_SEGMENT_LEN * ((1 << SEGMENT_COUNT) - 1);

    pub(crate) const fn new() -> Self {
        Self {
            segments: [const { AtomicPtr::new(ptr::null_mut()) }; SEGMENT_COUNT],
            _owns: PhantomData,
        }
    }

    /// Install the segment holding `index` if it is missing.
    ///
    /// Lock-free: racing installers each build a segment and the losers free
    /// theirs. Allocates only when the segment is new.
    pub(crate) fn ensure(&self, index: u32) {
        let (segment, _) = locate(index);
        let slot = &self.segments[segment];
        if !slot.load(Ordering::Acquire).is_null() {
            return;
        }

        let len = FIRST_SEGMENT_LEN << segment;
        let fresh: Box<[T]> = (0..len).map(|_| T::default()).collect();
        let fresh = Box::into_raw(fresh).cast::<T>();
        if slot
            .compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // SAFETY: `fresh` was never published.
            unsafe { drop(Box::from_raw(ptr::slice_from_raw_parts_mut(fresh, len))) };
        }
    }

    /// Entry at `index`, whose segment must already be installed.
    #[inline]
    pub(crate) fn get(&self, index: u32) -> &T {
        let (segment, offset) = locate(index);
        let base = self.segments[segment].load(Ordering::Acquire);
        debug_assert!(!base.is_null(), "index {index} in an uninstalled segment");
        // SAFETY: callers only look up indices they ensured, and installed
        // segments live as long as the table.
        unsafe { &*base.add(offset) }
    }
}

impl<T> Drop for SegmentedTable<T> {
    fn drop(&mut self) {
        for (segment, slot) in self.segments.iter_mut().enumerate() {
            let base = *slot.get_mut();
            if !base.is_null() {
                let len = FIRST_SEGMENT_LEN << segment;
                // SAFETY: installed by `ensure` with exactly this length.
                unsafe { drop(Box::from_raw(ptr::slice_from_raw_parts_mut(base, len))) };
            }
        }
    }
}

#[inline]
fn locate(index: u32) -> (usize, usize) {
    let i = index as usize + FIRST_SEGMENT_LEN;
    let segment =
        (usize::BITS - 1 - i.leading_zeros() - FIRST_SEGMENT_LEN.trailing_zeros()) as usize;
    (segment, i - (FIRST_SEGMENT_LEN << segment))
}
