//! Tolerance constants for audio testing.

/// Floating point rounding errors (constants, exact gain).
pub const FLOAT_EPSILON: f32 = 1e-6;

/// Oscillators and accumulated phase.
pub const DSP_EPSILON: f32 = 1e-4;

/// Values below this are considered silent (~-80dB).
pub const SILENCE_THRESHOLD: f32 = 0.0001;
