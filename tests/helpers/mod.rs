//! Test helpers and fixtures for plinth integration tests.
//!
//! Engines here run on the offline backend: the test thread plays the audio
//! callback one block at a time, so no hardware is needed.
//!
//! ## Tolerance Levels
//!
//! Use the appropriate tolerance from [`tolerances`] module:
//! - `FLOAT_EPSILON` (1e-6): Exact operations (constants, unity gain)
//! - `DSP_EPSILON` (1e-4): Oscillators
//! - `SILENCE_THRESHOLD` (0.0001): Silence detection (-80dB)

pub mod tolerances;

pub use tolerances::*;

use plinth::prelude::*;
use plinth::OfflineController;

/// Default test sample rate (matches common hardware)
pub const TEST_SAMPLE_RATE: f64 = 48000.0;

/// Standard buffer size for deterministic testing
pub const TEST_BUFFER_SIZE: usize = 512;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Stereo engine over the offline backend, configured but not started.
pub fn test_engine() -> (PlinthEngine, OfflineController) {
    init_tracing();
    let (backend, controller) = OfflineBackend::with_sample_rate(TEST_SAMPLE_RATE);
    let engine = PlinthEngine::builder()
        .sample_rate(TEST_SAMPLE_RATE)
        .block_size(TEST_BUFFER_SIZE)
        .inputs(0)
        .outputs(2)
        .max_block_size(2048)
        .backend(backend)
        .build()
        .expect("Failed to create test engine");
    (engine, controller)
}

/// Generate a test signal: sine wave at given frequency for specified samples.
pub fn generate_sine(frequency: f64, sample_rate: f64, num_samples: usize) -> Vec<f32> {
    (0..num_samples)
        .map(|i| {
            let t = i as f64 / sample_rate;
            (2.0 * std::f64::consts::PI * frequency * t).sin() as f32
        })
        .collect()
}

pub fn is_silent(samples: &[f32]) -> bool {
    samples.iter().all(|s| s.abs() < SILENCE_THRESHOLD)
}

pub fn all_equal(samples: &[f32], value: f32) -> bool {
    samples.iter().all(|&s| (s - value).abs() < FLOAT_EPSILON)
}

pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}
