//! Engine lifecycle integration tests
//!
//! Tests engine creation, configuration, start/stop and cleanup.

use crate::helpers::*;
use plinth::prelude::*;
use plinth::Error;

#[test]
fn test_engine_reports_negotiated_config() {
    let (engine, _controller) = test_engine();

    assert_eq!(engine.state(), DriverState::Initialized);
    assert_eq!(engine.sample_rate(), TEST_SAMPLE_RATE);
    assert_eq!(engine.channels(), 2);
    assert_eq!(engine.config().unwrap().block_size, TEST_BUFFER_SIZE);
}

#[test]
fn test_device_rate_overrides_request() {
    init_tracing();
    let (backend, _controller) = OfflineBackend::with_sample_rate(44100.0);
    let engine = PlinthEngine::builder()
        .sample_rate(96000.0)
        .backend(backend)
        .build()
        .unwrap();

    assert_eq!(engine.sample_rate(), 44100.0);
}

#[test]
fn test_invalid_config_rejected_at_build() {
    let (backend, _controller) = OfflineBackend::new();
    let result = PlinthEngine::builder()
        .block_size(0)
        .backend(backend)
        .build();

    match result {
        Err(err) => assert!(err.core().is_some_and(|e| e.is_config_error())),
        Ok(_) => panic!("zero block size accepted"),
    }
}

#[test]
fn test_unstarted_engine_renders_nothing() {
    let (_engine, controller) = test_engine();
    assert!(controller.render_block().is_none());
}

#[test]
fn test_start_stop_restart() {
    let (mut engine, controller) = test_engine();
    engine.start().unwrap();
    assert!(engine.is_running());
    controller.render_block().unwrap();

    engine.stop();
    engine.stop();
    assert_eq!(engine.state(), DriverState::Stopped);
    assert!(controller.render_block().is_none());

    engine.start().unwrap();
    assert!(engine.is_running());
    controller.render_block().unwrap();
    assert_eq!(engine.sample_position(), 2 * TEST_BUFFER_SIZE as u64);
}

#[test]
fn test_failed_open_reverts_to_initialized() {
    let (mut engine, controller) = test_engine();
    controller.fail_next_open();

    assert!(matches!(engine.start(), Err(Error::Core(_))));
    assert_eq!(engine.state(), DriverState::Initialized);

    engine.start().unwrap();
    assert!(engine.is_running());
}

#[test]
fn test_device_failure_then_restart() {
    let (mut engine, controller) = test_engine();
    engine.start().unwrap();

    controller.fail_device();
    assert_eq!(engine.state(), DriverState::Stopped);

    engine.start().unwrap();
    assert!(controller.render_block().is_some());
}

#[test]
fn test_drop_closes_stream() {
    let (mut engine, controller) = test_engine();
    engine.start().unwrap();
    assert!(controller.is_open());

    drop(engine);
    assert!(!controller.is_open());
}

#[test]
fn test_cpu_metrics_track_blocks() {
    let (mut engine, controller) = test_engine();
    engine.start().unwrap();
    for _ in 0..4 {
        controller.render_block().unwrap();
    }

    let cpu = engine.cpu();
    assert_eq!(cpu.buffer_size, TEST_BUFFER_SIZE);
    assert!(cpu.average >= 0.0);
}
