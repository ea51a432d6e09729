//! Atomic handle integration tests.

use plinth_core::{AtomicHandle, Shared};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const READERS: usize = 8;
const READS: usize = 10_000;
const SETS: u64 = 1_000;

#[derive(Default)]
struct Tally {
    constructed: AtomicUsize,
    dropped: AtomicUsize,
}

/// Value whose fields are always written together; a torn read would break
/// `check == !id`.
struct Versioned {
    id: u64,
    payload: [u64; 8],
    check: u64,
    tally: Arc<Tally>,
}

impl Versioned {
    fn new(id: u64, tally: &Arc<Tally>) -> Self {
        tally.constructed.fetch_add(1, Ordering::SeqCst);
        Self {
            id,
            payload: [id; 8],
            check: !id,
            tally: Arc::clone(tally),
        }
    }

    fn is_consistent(&self) -> bool {
        self.check == !self.id && self.payload.iter().all(|&p| p == self.id)
    }
}

impl Drop for Versioned {
    fn drop(&mut self) {
        self.tally.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_concurrent_get_and_set() {
    let tally = Arc::new(Tally::default());
    let handle = Arc::new(AtomicHandle::new(Versioned::new(0, &tally)));

    std::thread::scope(|s| {
        for _ in 0..READERS {
            let handle = Arc::clone(&handle);
            s.spawn(move || {
                let mut last = 0;
                for _ in 0..READS {
                    let value = handle.get().expect("handle never null");
                    assert!(value.is_consistent());
                    // One writer, so ids only move forward.
                    assert!(value.id >= last);
                    last = value.id;
                }
            });
        }

        let handle = Arc::clone(&handle);
        let tally = Arc::clone(&tally);
        s.spawn(move || {
            for id in 1..=SETS {
                handle.set(Versioned::new(id, &tally));
                assert!(handle.get().unwrap().id >= id);
            }
        });
    });

    assert_eq!(handle.get().unwrap().id, SETS);
    drop(handle);

    assert_eq!(tally.constructed.load(Ordering::SeqCst), SETS as usize + 1);
    assert_eq!(tally.dropped.load(Ordering::SeqCst), SETS as usize + 1);
}

#[test]
fn test_held_references_outlive_replacement() {
    let tally = Arc::new(Tally::default());
    let handle = AtomicHandle::new(Versioned::new(0, &tally));

    let held: Vec<Shared<Versioned>> = (1..=10)
        .map(|id| {
            let old = handle.get().unwrap();
            handle.set(Versioned::new(id, &tally));
            old
        })
        .collect();

    assert_eq!(tally.dropped.load(Ordering::SeqCst), 0);
    assert!(held.iter().enumerate().all(|(i, v)| v.id == i as u64));

    drop(held);
    assert_eq!(tally.dropped.load(Ordering::SeqCst), 10);
    drop(handle);
    assert_eq!(tally.dropped.load(Ordering::SeqCst), 11);
}

/// A reader of the live slot never sees null while staged values are swapped in.
#[test]
fn test_swap_never_exposes_null() {
    let live = Arc::new(AtomicHandle::new(0u32));

    std::thread::scope(|s| {
        let reader = Arc::clone(&live);
        s.spawn(move || {
            for _ in 0..READS {
                assert!(reader.get().is_some());
            }
        });

        for i in 1..=200u32 {
            let mut staged = AtomicHandle::new(i);
            live.swap(&mut staged);
            assert_eq!(*staged.get().unwrap(), i - 1);
        }
    });

    assert_eq!(*live.get().unwrap(), 200);
}

#[test]
fn test_clones_share_until_set() {
    let a = AtomicHandle::new(String::from("first"));
    let b = a.clone();
    assert!(Shared::ptr_eq(&a.get().unwrap(), &b.get().unwrap()));

    b.set(String::from("second"));
    assert_eq!(a.get().unwrap().as_str(), "first");
    assert_eq!(b.get().unwrap().as_str(), "second");
}
