//! Atomic, reference-counted publication slot.
//!
//! An [`AtomicHandle`] holds a 64-bit word packing a node index and a tag.
//! Nodes live in a process-wide table whose segments are never freed, so a
//! reader that lost a race can still touch the node's refcount safely; the
//! value itself sits in a boxed payload that is destroyed by whichever thread
//! drops the last reference.
//!
//! `get` is lock-free and allocation-free. `set` boxes the new value and must
//! run off the audio thread.

use crate::table::{SegmentedTable, NULL_INDEX};
use core::fmt;
use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

static NODES: SegmentedTable<Node> = SegmentedTable::new();
static NEXT_FRESH: AtomicUsize = AtomicUsize::new(0);
static FREE_HEAD: AtomicU64 = AtomicU64::new(pack(NULL_INDEX, 0));

#[repr(C)]
struct PayloadHeader {
    drop_payload: unsafe fn(NonNull<PayloadHeader>),
}

#[repr(C)]
struct Payload<T> {
    header: PayloadHeader,
    value: T,
}

unsafe fn drop_payload<T>(header: NonNull<PayloadHeader>) {
    drop(Box::from_raw(header.cast::<Payload<T>>().as_ptr()));
}

struct Node {
    refs: AtomicUsize,
    payload: AtomicPtr<PayloadHeader>,
    next: AtomicU32,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            refs: AtomicUsize::new(0),
            payload: AtomicPtr::new(ptr::null_mut()),
            next: AtomicU32::new(NULL_INDEX),
        }
    }
}

impl Node {
    /// Take a reference, but only while someone else still holds one.
    #[inline]
    fn try_retain(&self) -> bool {
        self.refs
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |n| {
                (n > 0).then_some(n + 1)
            })
            .is_ok()
    }
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

#[inline]
fn node(index: u32) -> &'static Node {
    NODES.get(index)
}

fn fresh_index() -> u32 {
    let index = NEXT_FRESH.fetch_add(1, Ordering::Relaxed);
    let capacity = SegmentedTable::<Node>::CAPACITY;
    if index >= capacity {
        panic!("AtomicHandle node table exhausted ({capacity} live handles)");
    }
    NODES.ensure(index as u32);
    index as u32
}

fn pop_free() -> Option<u32> {
    let mut head = FREE_HEAD.load(Ordering::Acquire);
    loop {
        let index = index_of(head);
        if index == NULL_INDEX {
            return None;
        }
        // A stale `next` is harmless: the tag makes the CAS below fail.
        let next = node(index).next.load(Ordering::Relaxed);
        let new = pack(next, tag_of(head).wrapping_add(1));
        match FREE_HEAD.compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return Some(index),
            Err(current) => head = current,
        }
    }
}

fn push_free(index: u32) {
    let node = node(index);
    let mut head = FREE_HEAD.load(Ordering::Relaxed);
    loop {
        node.next.store(index_of(head), Ordering::Relaxed);
        let new = pack(index, tag_of(head).wrapping_add(1));
        match FREE_HEAD.compare_exchange_weak(head, new, Ordering::Release, Ordering::Relaxed) {
            Ok(_) => return,
            Err(current) => head = current,
        }
    }
}

fn acquire_node<T>(value: T) -> u32 {
    let payload = Box::new(Payload {
        header: PayloadHeader {
            drop_payload: drop_payload::<T>,
        },
        value,
    });
    let index = pop_free().unwrap_or_else(fresh_index);
    let node = node(index);
    node.payload
        .store(Box::into_raw(payload).cast(), Ordering::Relaxed);
    node.refs.store(1, Ordering::Release);
    index
}

fn release(index: u32) {
    let node = node(index);
    if node.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
        let payload = node.payload.swap(ptr::null_mut(), Ordering::Acquire);
        if let Some(payload) = NonNull::new(payload) {
            // SAFETY: the refcount hit zero, so this is the only owner.
            unsafe { (payload.as_ref().drop_payload)(payload) };
        }
        push_free(index);
    }
}

/// Lock-free slot publishing a reference-counted `T`.
///
/// Readers call [`get`](Self::get) and keep the returned [`Shared`] for as
/// long as they use the value; writers [`set`](Self::set) a replacement at
/// any time. Every successful update advances the slot's tag, so a reader
/// that sees the same word twice knows nothing changed in between.
pub struct AtomicHandle<T: Send + Sync + 'static> {
    word: AtomicU64,
    _marker: PhantomData<T>,
}

impl<T: Send + Sync + 'static> AtomicHandle<T> {
    pub fn new(value: T) -> Self {
        Self {
            word: AtomicU64::new(pack(acquire_node(value), 0)),
            _marker: PhantomData,
        }
    }

    pub const fn null() -> Self {
        Self {
            word: AtomicU64::new(pack(NULL_INDEX, 0)),
            _marker: PhantomData,
        }
    }

    /// Grow the shared node table so the next `count` publications reuse
    /// existing nodes instead of allocating table segments.
    ///
    /// # Panics
    /// Panics if the table would exceed `u32::MAX - 1` nodes.
    pub fn reserve(count: usize) {
        for _ in 0..count {
            push_free(fresh_index());
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        index_of(self.word.load(Ordering::Acquire)) == NULL_INDEX
    }

    /// Current value, or `None` if the slot is null.
    pub fn get(&self) -> Option<Shared<T>> {
        let mut word = self.word.load(Ordering::Acquire);
        loop {
            let index = index_of(word);
            if index == NULL_INDEX {
                return None;
            }

            let node = node(index);
            if !node.try_retain() {
                // Released under us; the slot must have moved on.
                word = self.word.load(Ordering::Acquire);
                continue;
            }

            let current = self.word.load(Ordering::Acquire);
            if current == word {
                let payload = node.payload.load(Ordering::Acquire).cast::<Payload<T>>();
                // SAFETY: we hold a reference to a node the slot still published,
                // so its payload is live and of type T.
                let payload = unsafe { NonNull::new_unchecked(payload) };
                return Some(Shared { index, payload });
            }

            release(index);
            word = current;
        }
    }

    /// Publish `value`, releasing the previous one.
    ///
    /// # Panics
    /// Panics if the node table is exhausted.
    pub fn set(&self, value: T) {
        let old = self.exchange(acquire_node(value));
        if old != NULL_INDEX {
            release(old);
        }
    }

    /// Publish `value` and hand back the previous one instead of releasing it.
    ///
    /// The caller decides where the old value is finally dropped.
    ///
    /// # Panics
    /// Panics if the node table is exhausted.
    pub fn replace(&self, value: T) -> Option<Shared<T>> {
        let old = self.exchange(acquire_node(value));
        (old != NULL_INDEX).then(|| Shared::adopt(old))
    }

    /// Publish a value that is already shared elsewhere.
    pub fn set_shared(&self, shared: Shared<T>) {
        let index = shared.index;
        core::mem::forget(shared);
        let old = self.exchange(index);
        if old != NULL_INDEX {
            release(old);
        }
    }

    /// Make the slot null, returning what it held.
    pub fn take(&self) -> Option<Shared<T>> {
        let old = self.exchange(NULL_INDEX);
        (old != NULL_INDEX).then(|| Shared::adopt(old))
    }

    pub fn clear(&self) {
        drop(self.take());
    }

    /// Exchange contents with `other`.
    ///
    /// `self` goes straight from its old value to `other`'s, never passing
    /// through null, so a reader of `self` sees one or the other. `other` is
    /// exclusively borrowed and nobody can observe it mid-swap.
    pub fn swap(&self, other: &mut AtomicHandle<T>) {
        let theirs = *other.word.get_mut();
        let mine = self.exchange(index_of(theirs));
        *other.word.get_mut() = pack(mine, tag_of(theirs).wrapping_add(1));
    }

    /// CAS `index` into the slot with the next tag; returns the old index.
    fn exchange(&self, index: u32) -> u32 {
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            let new = pack(index, tag_of(current).wrapping_add(1));
            match self.word.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return index_of(current),
                Err(actual) => current = actual,
            }
        }
    }
}

impl<T: Send + Sync + 'static> Clone for AtomicHandle<T> {
    fn clone(&self) -> Self {
        let handle = Self::null();
        if let Some(shared) = self.get() {
            handle.set_shared(shared);
        }
        handle
    }
}

impl<T: Send + Sync + 'static> Default for AtomicHandle<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: Send + Sync + 'static> Drop for AtomicHandle<T> {
    fn drop(&mut self) {
        let index = index_of(*self.word.get_mut());
        if index != NULL_INDEX {
            release(index);
        }
    }
}

impl<T: Send + Sync + fmt::Debug + 'static> fmt::Debug for AtomicHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => f.debug_tuple("AtomicHandle").field(&*value).finish(),
            None => f.write_str("AtomicHandle(null)"),
        }
    }
}

/// A counted reference to a value published through an [`AtomicHandle`].
pub struct Shared<T: Send + Sync + 'static> {
    index: u32,
    payload: NonNull<Payload<T>>,
}

// SAFETY: Shared only hands out &T, and T is Send + Sync.
unsafe impl<T: Send + Sync + 'static> Send for Shared<T> {}
unsafe impl<T: Send + Sync + 'static> Sync for Shared<T> {}

impl<T: Send + Sync + 'static> Shared<T> {
    /// Take over a reference the caller already counted.
    fn adopt(index: u32) -> Self {
        let payload = node(index).payload.load(Ordering::Acquire).cast::<Payload<T>>();
        Self {
            index,
            // SAFETY: a counted node always carries a payload.
            payload: unsafe { NonNull::new_unchecked(payload) },
        }
    }

    /// Whether both references point at the same published value.
    #[inline]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.payload == b.payload
    }
}

impl<T: Send + Sync + 'static> Deref for Shared<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: our reference keeps the payload alive.
        unsafe { &self.payload.as_ref().value }
    }
}

impl<T: Send + Sync + 'static> Clone for Shared<T> {
    fn clone(&self) -> Self {
        node(self.index).refs.fetch_add(1, Ordering::Relaxed);
        Self {
            index: self.index,
            payload: self.payload,
        }
    }
}

impl<T: Send + Sync + 'static> Drop for Shared<T> {
    fn drop(&mut self) {
        release(self.index);
    }
}

impl<T: Send + Sync + fmt::Debug + 'static> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
