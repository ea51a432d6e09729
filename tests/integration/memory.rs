//! Allocator behaviour through the engine.

use crate::helpers::*;
use plinth::prelude::*;
use plinth::{PoolConfig, RtAllocator};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[test]
fn test_republishing_recycles_graph_buffers() {
    let (mut engine, controller) = test_engine();
    engine.start().unwrap();

    let publish = |engine: &mut PlinthEngine| {
        let mut graph = engine.graph_builder();
        let c = graph.add(UnitSpec::Constant(0.5));
        graph.route(c, 0).unwrap();
        engine.publish(graph).unwrap();
        // The replaced graph's buffers go back to the pool from the reaper.
        engine.arena().flush();
    };

    // Warm up: the current graph plus the one being built.
    for _ in 0..3 {
        publish(&mut engine);
        controller.render_block().unwrap();
    }

    let before = engine.memory_stats().pool.fallback_allocations;
    for _ in 0..10 {
        publish(&mut engine);
        controller.render_block().unwrap();
    }
    let stats = engine.memory_stats().pool;
    assert_eq!(stats.fallback_allocations, before);
    assert_eq!(stats.audio_thread_fallbacks, 0);
}

#[test]
fn test_graph_buffers_prewarmed() {
    init_tracing();
    let (backend, _controller) = OfflineBackend::new();
    let engine = PlinthEngine::builder()
        .max_block_size(1024)
        .graph_buffers(8)
        .backend(backend)
        .build()
        .unwrap();

    assert_eq!(engine.pool().available(1024 * std::mem::size_of::<f32>()), 8);
}

#[test]
fn test_pool_exhaustion_surfaces_as_core_error() {
    init_tracing();
    let (backend, _controller) = OfflineBackend::new();
    let mut engine = PlinthEngine::builder()
        .pool_config(PoolConfig {
            max_blocks_per_class: Some(2),
        })
        .backend(backend)
        .build()
        .unwrap();

    let mut graph = engine.graph_builder();
    for _ in 0..4 {
        let c = graph.add(UnitSpec::Constant(0.0));
        graph.route(c, 0).unwrap();
    }

    let err = engine.publish(graph).unwrap_err();
    assert!(err.core().is_some_and(|e| e.is_allocation_failure()));
}

#[test]
fn test_arena_frees_from_any_thread() {
    let (engine, _controller) = test_engine();
    let arena = engine.arena().clone();

    let blocks: Vec<usize> = (0..32)
        .map(|i| arena.allocate(64 + i).unwrap().as_ptr() as usize)
        .collect();

    let freer = arena.freer();
    std::thread::spawn(move || {
        for addr in blocks {
            let ptr = std::ptr::NonNull::new(addr as *mut u8).unwrap();
            // SAFETY: each block came from this arena and is freed once.
            unsafe { freer.free(ptr) };
        }
    })
    .join()
    .unwrap();

    arena.flush();
    let stats = engine.memory_stats().arena;
    assert_eq!(stats.allocations, 32);
    assert_eq!(stats.reaped, 32);
    assert_eq!(stats.pending, 0);
}

#[test]
fn test_default_pool_builds_large_graphs() {
    let (mut engine, controller) = test_engine();
    assert_eq!(engine.pool().capacity_per_class(), None);

    let mut graph = engine.graph_builder();
    for _ in 0..300 {
        let c = graph.add(UnitSpec::Constant(0.25));
        graph.route(c, 0).unwrap();
    }
    let graph = engine.publish(graph).unwrap();
    assert_eq!(graph.node_count(), 300);
    engine.start().unwrap();

    assert!(all_equal(&controller.render_block().unwrap()[0], 75.0));
}

/// Renders a constant and records the thread that drops it.
struct Recorded {
    value: f32,
    drops: Arc<Mutex<Vec<Option<String>>>>,
}

impl BlockProcessor for Recorded {
    fn process(&self, _: &[&[f32]], outputs: &mut [&mut [f32]], _: &ProcessInfo) {
        for channel in outputs.iter_mut() {
            channel.fill(self.value);
        }
    }
}

impl Drop for Recorded {
    fn drop(&mut self) {
        let name = std::thread::current().name().map(str::to_owned);
        self.drops.lock().unwrap().push(name);
    }
}

#[test]
fn test_replaced_processor_dropped_on_reaper() {
    let (mut engine, controller) = test_engine();
    let drops = Arc::new(Mutex::new(Vec::new()));
    engine.publish_processor(Recorded {
        value: 0.5,
        drops: drops.clone(),
    });
    engine.start().unwrap();
    assert!(all_equal(&controller.render_block().unwrap()[0], 0.5));

    engine.clear();
    engine.arena().flush();
    assert_eq!(*drops.lock().unwrap(), vec![Some("plinth-reaper".to_string())]);
}

#[test]
fn test_republishing_during_render_keeps_teardown_on_reaper() {
    let (mut engine, controller) = test_engine();
    let drops = Arc::new(Mutex::new(Vec::new()));
    engine.publish_processor(Recorded {
        value: 1.0,
        drops: drops.clone(),
    });
    engine.start().unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let audio = {
        let done = Arc::clone(&done);
        std::thread::Builder::new()
            .name("audio".into())
            .spawn(move || {
                let mut blocks = 0usize;
                while !done.load(Ordering::Acquire) || blocks < 100 {
                    let block = controller.render_block().unwrap();
                    let first = block[0][0];
                    assert!(first >= 1.0, "block {blocks} was silent");
                    assert!(all_equal(&block[1], first), "block {blocks} is torn");
                    blocks += 1;
                }
            })
            .unwrap()
    };

    for i in 0..200 {
        if i % 2 == 0 {
            let mut graph = engine.graph_builder();
            let c = graph.add(UnitSpec::Constant(2.0));
            graph.route(c, 0).unwrap();
            graph.route(c, 1).unwrap();
            engine.publish(graph).unwrap();
        } else {
            engine.publish_processor(Recorded {
                value: 3.0,
                drops: drops.clone(),
            });
        }
    }
    done.store(true, Ordering::Release);
    audio.join().unwrap();

    engine.collect();
    engine.arena().flush();
    let drops = drops.lock().unwrap();
    assert_eq!(drops.len(), 100);
    assert!(drops.iter().all(|name| name.as_deref() == Some("plinth-reaper")));
    assert_eq!(engine.memory_stats().pool.audio_thread_fallbacks, 0);
}
