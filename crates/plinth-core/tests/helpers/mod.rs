//! Shared fixtures for plinth-core integration tests.

use plinth_core::{BackingAllocator, DriverConfig, OfflineBackend, OfflineController};
use plinth_core::{AudioDriver, PoolAllocator, PoolConfig};
use std::alloc::Layout;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Floating point rounding errors (passthrough, exact gain).
pub const FLOAT_EPSILON: f32 = 1e-6;

/// Route `tracing` output through the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Bookkeeping shared by every clone of a [`CountingHeap`].
#[derive(Default)]
pub struct HeapCounters {
    pub allocs: AtomicUsize,
    pub deallocs: AtomicUsize,
    live: Mutex<HashSet<usize>>,
    dealloc_threads: Mutex<Vec<Option<String>>>,
}

impl HeapCounters {
    pub fn live(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    /// Names of the threads that called `dealloc`, one entry per call.
    pub fn dealloc_threads(&self) -> Vec<Option<String>> {
        self.dealloc_threads.lock().unwrap().clone()
    }
}

/// System heap that records every call, and panics on a double free.
#[derive(Clone, Default)]
pub struct CountingHeap(pub Arc<HeapCounters>);

unsafe impl BackingAllocator for CountingHeap {
    fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { std::alloc::alloc(layout) };
        self.0.allocs.fetch_add(1, Ordering::SeqCst);
        self.0.live.lock().unwrap().insert(ptr as usize);
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        assert!(
            self.0.live.lock().unwrap().remove(&(ptr as usize)),
            "double or foreign free of {ptr:p}"
        );
        self.0
            .dealloc_threads
            .lock()
            .unwrap()
            .push(std::thread::current().name().map(str::to_owned));
        self.0.deallocs.fetch_add(1, Ordering::SeqCst);
        std::alloc::dealloc(ptr, layout)
    }
}

/// Driver over an offline backend with a default pool.
pub fn offline_driver() -> (AudioDriver, OfflineController, Arc<PoolAllocator>) {
    init_tracing();
    let (backend, controller) = OfflineBackend::new();
    let pool = Arc::new(PoolAllocator::new(PoolConfig::default()).expect("pool"));
    (
        AudioDriver::new(backend, Arc::clone(&pool)),
        controller,
        pool,
    )
}

/// 44.1 kHz, 512 frames, 2 outputs.
pub fn stereo_config() -> DriverConfig {
    DriverConfig {
        sample_rate: 44100.0,
        block_size: 512,
        inputs: 0,
        outputs: 2,
        max_block_size: 4096,
    }
}

/// Whether every sample of every channel is within [`FLOAT_EPSILON`] of `value`.
pub fn all_equal(block: &[Vec<f32>], value: f32) -> bool {
    block
        .iter()
        .flatten()
        .all(|&s| (s - value).abs() < FLOAT_EPSILON)
}
