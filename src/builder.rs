//! Builder for configuring and constructing a `PlinthEngine`.

use crate::{PlinthEngine, Result};
use plinth_core::{
    AudioBackend, AudioDriver, DeferredFreeArena, DriverConfig, PoolAllocator, PoolConfig,
    ReaperConfig,
};
use std::sync::Arc;

/// The stream is configured during `build()` but not started; call
/// [`PlinthEngine::start`] when the first graph is ready.
///
/// Without an explicit [`backend`](Self::backend) the engine opens the
/// default CPAL output device (feature `"cpal"`).
///
/// # Example
///
/// ```ignore
/// use plinth::prelude::*;
///
/// let mut engine = PlinthEngine::builder()
///     .sample_rate(48000.0)
///     .block_size(256)
///     .outputs(2)
///     .build()?;
///
/// let mut graph = engine.graph_builder();
/// let osc = graph.add(UnitSpec::Sine);
/// graph.route(osc, 0)?;
/// engine.publish(graph)?;
/// engine.start()?;
/// ```
pub struct PlinthEngineBuilder {
    driver: DriverConfig,
    pool: PoolConfig,
    reaper: ReaperConfig,
    graph_buffers: usize,
    backend: Option<Box<dyn AudioBackend>>,

    #[cfg(feature = "cpal")]
    output_device: Option<usize>,
}

impl Default for PlinthEngineBuilder {
    fn default() -> Self {
        Self {
            driver: DriverConfig::default(),
            pool: PoolConfig::default(),
            reaper: ReaperConfig::default(),
            graph_buffers: 0,
            backend: None,

            #[cfg(feature = "cpal")]
            output_device: None,
        }
    }
}

impl PlinthEngineBuilder {
    /// Requested rate; the backend may adjust it. Default: 44100
    pub fn sample_rate(mut self, rate: f64) -> Self {
        self.driver.sample_rate = rate;
        self
    }

    /// Requested frames per block. Default: 512
    pub fn block_size(mut self, frames: usize) -> Self {
        self.driver.block_size = frames;
        self
    }

    /// Largest block the engine renders; sizes graph buffers. Default: 4096
    pub fn max_block_size(mut self, frames: usize) -> Self {
        self.driver.max_block_size = frames;
        self
    }

    /// Default: 1
    pub fn inputs(mut self, count: usize) -> Self {
        self.driver.inputs = count;
        self
    }

    /// Default: 2
    pub fn outputs(mut self, count: usize) -> Self {
        self.driver.outputs = count;
        self
    }

    /// Replace the whole stream configuration.
    pub fn driver_config(mut self, config: DriverConfig) -> Self {
        self.driver = config;
        self
    }

    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool = config;
        self
    }

    pub fn reaper_config(mut self, config: ReaperConfig) -> Self {
        self.reaper = config;
        self
    }

    /// Pre-allocate this many graph node buffers so publishing small graphs
    /// recycles pool blocks instead of reaching the system allocator.
    pub fn graph_buffers(mut self, count: usize) -> Self {
        self.graph_buffers = count;
        self
    }

    /// Drive the engine from `backend` instead of an audio device.
    pub fn backend(mut self, backend: impl AudioBackend + 'static) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    #[cfg(feature = "cpal")]
    pub fn output_device(mut self, index: usize) -> Self {
        self.output_device = Some(index);
        self
    }

    pub fn build(mut self) -> Result<PlinthEngine> {
        self.driver.validate()?;

        let pool = Arc::new(PoolAllocator::new(self.pool)?);
        let arena = DeferredFreeArena::new(self.reaper)?;

        let backend = match self.backend.take() {
            Some(backend) => backend,
            None => default_backend(&self)?,
        };

        let mut driver = AudioDriver::new(backend, Arc::clone(&pool));
        driver.configure(self.driver)?;

        if self.graph_buffers > 0 {
            let max_block = driver
                .config()
                .map_or(self.driver.max_block_size, |c| c.max_block_size);
            pool.prewarm(max_block * std::mem::size_of::<f32>(), self.graph_buffers)?;
        }

        tracing::info!(
            backend = driver.backend_name(),
            graph_buffers = self.graph_buffers,
            "Engine built"
        );

        Ok(PlinthEngine::from_parts(driver, pool, arena))
    }
}

#[cfg(feature = "cpal")]
fn default_backend(builder: &PlinthEngineBuilder) -> Result<Box<dyn AudioBackend>> {
    Ok(Box::new(plinth_core::CpalBackend::new(builder.output_device)))
}

#[cfg(not(feature = "cpal"))]
fn default_backend(_builder: &PlinthEngineBuilder) -> Result<Box<dyn AudioBackend>> {
    Err(plinth_core::Error::InvalidConfig(
        "no audio backend: enable the \"cpal\" feature or call backend()".into(),
    )
    .into())
}
