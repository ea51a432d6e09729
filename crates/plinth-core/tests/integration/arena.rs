//! Deferred-free arena integration tests.

use crate::helpers::*;
use plinth_core::{rt, DeferredFreeArena, ReaperConfig, RtAllocator};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn arena(heap: &CountingHeap) -> DeferredFreeArena<CountingHeap> {
    init_tracing();
    DeferredFreeArena::with_backing(ReaperConfig::default(), heap.clone()).unwrap()
}

/// Every freed pointer is deallocated exactly once, on the reaper thread.
#[test]
fn test_frees_reclaimed_once_by_reaper() {
    let heap = CountingHeap::default();
    let arena = arena(&heap);

    let addrs: Vec<usize> = (0..400)
        .map(|i| arena.allocate(16 + i * 3).unwrap().as_ptr() as usize)
        .collect();

    std::thread::scope(|s| {
        for (t, chunk) in addrs.chunks(100).enumerate() {
            let freer = arena.freer();
            s.spawn(move || {
                // One of the freeing threads plays the audio thread.
                if t == 0 {
                    rt::mark_audio_thread();
                }
                for &addr in chunk {
                    unsafe { freer.free(NonNull::new(addr as *mut u8).unwrap()) };
                }
            });
        }
    });

    arena.flush();

    assert_eq!(heap.0.allocs.load(Ordering::SeqCst), 400);
    assert_eq!(heap.0.deallocs.load(Ordering::SeqCst), 400);
    assert_eq!(heap.0.live(), 0);
    assert!(heap
        .0
        .dealloc_threads()
        .iter()
        .all(|name| name.as_deref() == Some("plinth-reaper")));

    let stats = arena.stats();
    assert_eq!(stats.free_requests, 400);
    assert_eq!(stats.reaped, 400);
    assert_eq!(stats.pending, 0);
}

/// Nothing is reclaimed on the freeing thread, even while the reaper sleeps.
#[test]
fn test_free_never_deallocates_inline() {
    let heap = CountingHeap::default();
    let config = ReaperConfig {
        min_interval: Duration::from_secs(30),
        max_interval: Duration::from_secs(30),
        backlog_warning: 1,
    };
    let arena = DeferredFreeArena::with_backing(config, heap.clone()).unwrap();

    let ptr = arena.allocate(1024).unwrap();
    unsafe { arena.freer().free(ptr) };
    assert_eq!(heap.0.deallocs.load(Ordering::SeqCst), 0);
    assert_eq!(arena.freer().pending(), 1);

    arena.flush();
    assert_eq!(heap.0.deallocs.load(Ordering::SeqCst), 1);
}

/// Blocks still queued at shutdown are reclaimed by `stop`.
#[test]
fn test_drop_drains_backlog() {
    let heap = CountingHeap::default();
    let arena = arena(&heap);
    for _ in 0..50 {
        let ptr = arena.allocate(64).unwrap();
        unsafe { arena.free(ptr) };
    }
    drop(arena);
    assert_eq!(heap.0.live(), 0);
}
