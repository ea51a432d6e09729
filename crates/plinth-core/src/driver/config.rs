//! Callback driver configuration.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Most channels a stream can carry in either direction.
pub const MAX_CHANNELS: usize = 64;

/// Largest block a driver can be configured for.
pub const MAX_BLOCK_SIZE: usize = 16384;

/// Stream parameters requested from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub sample_rate: f64,
    /// Preferred frames per callback.
    pub block_size: usize,
    pub inputs: usize,
    pub outputs: usize,
    /// Largest block the renderer accepts; scratch buffers are sized for it.
    pub max_block_size: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100.0,
            block_size: 512,
            inputs: 1,
            outputs: 2,
            max_block_size: 4096,
        }
    }
}

impl DriverConfig {
    pub fn validate(&self) -> Result<()> {
        if !(8000.0..=384000.0).contains(&self.sample_rate) {
            return Err(Error::InvalidConfig(format!(
                "sample_rate {} out of range (8000-384000 Hz)",
                self.sample_rate
            )));
        }
        if self.max_block_size == 0 || self.max_block_size > MAX_BLOCK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "max_block_size {} out of range (1-{MAX_BLOCK_SIZE})",
                self.max_block_size
            )));
        }
        if self.block_size == 0 || self.block_size > self.max_block_size {
            return Err(Error::InvalidConfig(format!(
                "block_size {} out of range (1-{})",
                self.block_size, self.max_block_size
            )));
        }
        if self.inputs > MAX_CHANNELS || self.outputs > MAX_CHANNELS {
            return Err(Error::InvalidConfig(format!(
                "{} inputs / {} outputs exceeds {MAX_CHANNELS} channels",
                self.inputs, self.outputs
            )));
        }
        if self.inputs + self.outputs == 0 {
            return Err(Error::InvalidConfig("stream has no channels".into()));
        }
        Ok(())
    }

    /// Bytes of one planar scratch buffer holding `channels` at the maximum block size.
    pub fn scratch_bytes(&self, channels: usize) -> usize {
        self.max_block_size * channels * core::mem::size_of::<f32>()
    }
}
