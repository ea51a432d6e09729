//! CPU load tracking for the audio callback.

use crate::lockfree::{AtomicDouble, AtomicFloat, AtomicFlag};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use core::time::Duration;

/// CPU metrics snapshot.
#[derive(Debug, Clone, Default)]
pub struct CpuMetrics {
    pub average: f32,
    pub peak: f32,
    pub current: f32,
    /// Blocks that took longer than their real-time duration.
    pub deadline_misses: u64,
    pub buffer_size: usize,
    pub max_time_us: f64,
    pub actual_time_us: f64,
}

/// CPU meter for audio callback performance tracking.
///
/// Load is the fraction of the block's real-time duration spent rendering.
pub struct CpuMeter {
    current: AtomicFloat,
    peak: AtomicFloat,
    average: AtomicFloat,
    deadline_misses: AtomicU64,
    samples: AtomicU32,
    sample_rate: AtomicDouble,
    enabled: AtomicFlag,
}

impl CpuMeter {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            current: AtomicFloat::new(0.0),
            peak: AtomicFloat::new(0.0),
            average: AtomicFloat::new(0.0),
            deadline_misses: AtomicU64::new(0),
            samples: AtomicU32::new(0),
            sample_rate: AtomicDouble::new(sample_rate),
            enabled: AtomicFlag::new(true),
        }
    }

    pub fn enable(&self) {
        self.enabled.set(true);
    }

    pub fn disable(&self) {
        self.enabled.set(false);
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    pub(crate) fn set_sample_rate(&self, sample_rate: f64) {
        self.sample_rate.set(sample_rate);
    }

    pub fn record(&self, buffer_size: usize, elapsed: Duration) {
        if !self.is_enabled() || buffer_size == 0 {
            return;
        }

        let max_time = buffer_size as f64 / self.sample_rate.get();
        let load = (elapsed.as_secs_f64() / max_time) as f32;

        self.current.set(load);
        self.peak.fetch_max(load);

        // Exponential moving average
        let count = self.samples.fetch_add(1, Ordering::Relaxed);
        let alpha = 1.0 / (count.min(100) + 1) as f32;
        let avg = self.average.get();
        self.average.set(avg * (1.0 - alpha) + load * alpha);

        if elapsed.as_secs_f64() > max_time {
            self.deadline_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn metrics(&self, buffer_size: usize) -> CpuMetrics {
        let max_time_us = (buffer_size as f64 / self.sample_rate.get()) * 1_000_000.0;
        let actual_time_us = (self.current.get() as f64) * max_time_us;

        CpuMetrics {
            average: self.average_percent(),
            peak: self.peak_percent(),
            current: self.current_percent(),
            deadline_misses: self.deadline_misses(),
            buffer_size,
            max_time_us,
            actual_time_us,
        }
    }

    pub fn average_percent(&self) -> f32 {
        self.average.get() * 100.0
    }

    pub fn peak_percent(&self) -> f32 {
        self.peak.get() * 100.0
    }

    pub fn current_percent(&self) -> f32 {
        self.current.get() * 100.0
    }

    pub fn deadline_misses(&self) -> u64 {
        self.deadline_misses.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.current.set(0.0);
        self.peak.set(0.0);
        self.average.set(0.0);
        self.deadline_misses.store(0, Ordering::Relaxed);
        self.samples.store(0, Ordering::Relaxed);
    }
}
