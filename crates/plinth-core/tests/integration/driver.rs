//! Callback driver integration tests over the offline backend.

use crate::helpers::*;
use plinth_core::{
    AtomicHandle, BlockProcessor, DeferredFreeArena, DriverState, Error, ProcessInfo,
    ReaperConfig,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

fn constant(value: f32) -> impl BlockProcessor {
    move |_: &[&[f32]], outputs: &mut [&mut [f32]], _: &ProcessInfo| {
        for channel in outputs.iter_mut() {
            channel.fill(value);
        }
    }
}

#[test]
fn test_constant_graph_fills_every_block() {
    let (mut driver, controller, _pool) = offline_driver();
    driver.configure(stereo_config()).unwrap();
    driver.publish(constant(0.25));
    driver.start().unwrap();

    for _ in 0..8 {
        let block = controller.render_block().unwrap();
        assert_eq!(block.len(), 2);
        assert!(block.iter().all(|ch| ch.len() == 512));
        assert!(all_equal(&block, 0.25));
    }
    assert_eq!(driver.sample_position(), 8 * 512);
    assert_eq!(driver.overruns(), 0);
}

#[test]
fn test_stop_twice_is_noop_and_restart_resumes() {
    let (mut driver, controller, _pool) = offline_driver();
    driver.configure(stereo_config()).unwrap();
    driver.publish(constant(0.25));
    driver.start().unwrap();
    controller.render_block().unwrap();

    driver.stop();
    driver.stop();
    assert_eq!(driver.state(), DriverState::Stopped);
    assert!(controller.render_block().is_none());

    driver.start().unwrap();
    assert_eq!(driver.state(), DriverState::Running);
    assert_eq!(controller.open_count(), 2);
    assert!(all_equal(&controller.render_block().unwrap(), 0.25));
    assert_eq!(driver.sample_position(), 2 * 512);
}

#[test]
fn test_start_before_configure_fails() {
    let (mut driver, _controller, _pool) = offline_driver();
    assert!(matches!(driver.start(), Err(Error::NotConfigured)));
}

#[test]
fn test_device_failure_stops_until_restarted() {
    let (mut driver, controller, _pool) = offline_driver();
    driver.configure(stereo_config()).unwrap();
    driver.publish(constant(0.5));
    driver.start().unwrap();

    controller.fail_device();
    assert_eq!(driver.state(), DriverState::Stopped);

    // The stream sees the failure at the next block boundary.
    let last = controller.render_block().unwrap();
    assert!(all_equal(&last, 0.0));
    assert!(!controller.is_open());

    driver.start().unwrap();
    assert!(all_equal(&controller.render_block().unwrap(), 0.5));
}

#[test]
fn test_hot_swap_never_renders_silence() {
    let (mut driver, controller, _pool) = offline_driver();
    driver.configure(stereo_config()).unwrap();
    driver.start().unwrap();

    let live = driver.graph_handle();
    for i in 0..50 {
        let value = if i % 2 == 0 { 0.25 } else { 0.5 };
        let mut staged = AtomicHandle::new(Box::new(constant(value)) as Box<dyn BlockProcessor>);
        live.swap(&mut staged);

        let block = controller.render_block().unwrap();
        assert!(all_equal(&block, value));
    }
    assert_eq!(driver.overruns(), 0);
}

#[test]
fn test_cleared_graph_renders_silence_and_counts() {
    let (mut driver, controller, _pool) = offline_driver();
    driver.configure(stereo_config()).unwrap();
    driver.publish(constant(0.25));
    driver.start().unwrap();

    driver.clear();
    assert!(all_equal(&controller.render_block().unwrap(), 0.0));
    assert_eq!(driver.overruns(), 1);
    assert_eq!(driver.retired_count(), 0);
}

/// Fills every output with `value` and records the thread that drops it.
struct Tone {
    value: f32,
    drops: Arc<Mutex<Vec<Option<String>>>>,
}

impl BlockProcessor for Tone {
    fn process(&self, _: &[&[f32]], outputs: &mut [&mut [f32]], _: &ProcessInfo) {
        for channel in outputs.iter_mut() {
            channel.fill(self.value);
        }
    }
}

impl Drop for Tone {
    fn drop(&mut self) {
        let name = std::thread::current().name().map(str::to_owned);
        self.drops.lock().unwrap().push(name);
    }
}

#[test]
fn test_publish_while_rendering_drops_on_reaper() {
    let (mut driver, controller, _pool) = offline_driver();
    let arena = Arc::new(DeferredFreeArena::new(ReaperConfig::default()).unwrap());
    let disposer_arena = Arc::clone(&arena);
    driver.set_disposer(move |old| disposer_arena.defer_drop(old));

    let drops = Arc::new(Mutex::new(Vec::new()));
    driver.configure(stereo_config()).unwrap();
    driver.publish(Tone {
        value: 1.0,
        drops: drops.clone(),
    });
    driver.start().unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let render = {
        let controller = controller.clone();
        let done = Arc::clone(&done);
        std::thread::Builder::new()
            .name("audio".into())
            .spawn(move || {
                let mut blocks = 0;
                while !done.load(Ordering::Acquire) || blocks < 100 {
                    let block = controller.render_block().unwrap();
                    let first = block[0][0];
                    assert!(first >= 1.0, "silent block {blocks}");
                    assert!(all_equal(&block, first), "torn block {blocks}");
                    blocks += 1;
                }
                blocks
            })
            .unwrap()
    };

    for i in 0..300 {
        driver.publish(Tone {
            value: 1.0 + (i % 7) as f32,
            drops: drops.clone(),
        });
    }
    done.store(true, Ordering::Release);
    assert!(render.join().unwrap() >= 100);

    driver.collect();
    assert_eq!(driver.retired_count(), 0);
    drop(driver);
    arena.flush();

    let drops = drops.lock().unwrap();
    assert_eq!(drops.len(), 301);
    assert!(drops.iter().all(|name| name.as_deref() == Some("plinth-reaper")));
}

#[test]
fn test_block_size_change_is_recorded() {
    let (mut driver, controller, _pool) = offline_driver();
    driver.configure(stereo_config()).unwrap();
    driver.publish(
        |_: &[&[f32]], outputs: &mut [&mut [f32]], info: &ProcessInfo| {
            outputs[0].fill(info.frames as f32);
        },
    );
    driver.start().unwrap();

    controller.set_block_size(256);
    let block = controller.render_block().unwrap();
    assert_eq!(block[0].len(), 256);
    assert!(block[0].iter().all(|&s| s == 256.0));
    assert_eq!(driver.block_size(), 256);

    // Larger than the pre-warmed scratch: silence, counted.
    controller.set_block_size(8192);
    assert!(all_equal(&controller.render_block().unwrap(), 0.0));
    assert_eq!(driver.overruns(), 1);
}

#[test]
fn test_inputs_reach_processor() {
    let (mut driver, controller, _pool) = offline_driver();
    let config = plinth_core::DriverConfig {
        inputs: 1,
        ..stereo_config()
    };
    driver.configure(config).unwrap();
    driver.publish(
        |inputs: &[&[f32]], outputs: &mut [&mut [f32]], _: &ProcessInfo| {
            for channel in outputs.iter_mut() {
                channel.copy_from_slice(inputs[0]);
            }
        },
    );
    driver.start().unwrap();

    let ramp: Vec<f32> = (0..512).map(|i| i as f32 / 512.0).collect();
    let block = controller.render_block_with(&[ramp.as_slice()]).unwrap();
    assert_eq!(block[0], ramp);
    assert_eq!(block[1], ramp);
}

#[test]
fn test_rendering_never_falls_back_to_system_allocator() {
    let (mut driver, controller, pool) = offline_driver();
    driver.configure(stereo_config()).unwrap();
    driver.publish(constant(0.1));

    for _ in 0..3 {
        driver.start().unwrap();
        for _ in 0..4 {
            controller.render_block().unwrap();
        }
        driver.stop();
    }

    assert_eq!(pool.stats().audio_thread_fallbacks, 0);
}
