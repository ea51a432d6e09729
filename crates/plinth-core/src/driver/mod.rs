//! Audio callback driver.
//!
//! [`AudioDriver`] owns a backend and a published processor. The backend's
//! stream calls a [`BlockRenderer`] once per hardware block; the control
//! thread swaps processors through the driver's [`ProcessorHandle`] without
//! ever blocking the callback.
//!
//! A replaced processor is never released by the callback. The driver keeps
//! it until the block that might still be using it has finished, then hands
//! it to a disposer (or drops it) on the control side.

mod backend;
mod callback;
mod config;
mod cpu;
mod offline;

#[cfg(feature = "cpal")]
mod cpal_backend;

pub use backend::AudioBackend;
pub use callback::{
    BlockProcessor, BlockRenderer, CallbackStatus, ChannelScratch, DeviceErrorSink, ProcessInfo,
    ProcessorHandle, Silence,
};
pub use config::{DriverConfig, MAX_BLOCK_SIZE, MAX_CHANNELS};
pub use cpu::{CpuMeter, CpuMetrics};
pub use offline::{OfflineBackend, OfflineController};

#[cfg(feature = "cpal")]
pub use cpal_backend::CpalBackend;

use crate::handle::{AtomicHandle, Shared};
use crate::memory::{PoolAllocator, RtAllocator};
use crate::{Error, Result};
use callback::DriverShared;
use core::sync::atomic::{fence, Ordering};
use parking_lot::Mutex;
use std::sync::Arc;

/// Scratch blocks pre-warmed per direction, so a restart can open a new
/// stream before the old one has released its buffers.
const SCRATCH_PREWARM: usize = 2;

/// Driver lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DriverState {
    Uninitialized = 0,
    Initialized = 1,
    Running = 2,
    /// The stream ended, by `stop()` or a device failure.
    Stopped = 3,
}

impl DriverState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => DriverState::Initialized,
            2 => DriverState::Running,
            3 => DriverState::Stopped,
            _ => DriverState::Uninitialized,
        }
    }
}

/// A processor taken out of the driver's slot.
pub type RetiredProcessor = Shared<Box<dyn BlockProcessor>>;

/// Where quiescent retired processors go, typically an arena's reaper.
pub type Disposer = Box<dyn Fn(RetiredProcessor) + Send + Sync>;

struct Retired {
    processor: RetiredProcessor,
    /// Render epoch read right after the processor left the slot.
    epoch: u64,
}

impl Retired {
    /// No block can still hold the processor: none was in flight when it
    /// was retired, or that block has since finished.
    #[inline]
    fn is_quiescent(&self, current: u64) -> bool {
        self.epoch % 2 == 0 || current > self.epoch
    }
}

/// Drives a [`BlockProcessor`] from an [`AudioBackend`].
pub struct AudioDriver {
    backend: Box<dyn AudioBackend>,
    pool: Arc<PoolAllocator>,
    shared: Arc<DriverShared>,
    processor: Arc<ProcessorHandle>,
    retired: Mutex<Vec<Retired>>,
    disposer: Option<Disposer>,
    requested: Option<DriverConfig>,
    negotiated: Option<DriverConfig>,
}

impl AudioDriver {
    pub fn new(backend: impl AudioBackend + 'static, pool: Arc<PoolAllocator>) -> Self {
        Self {
            backend: Box::new(backend),
            pool,
            shared: Arc::new(DriverShared::new(DriverConfig::default().sample_rate)),
            processor: Arc::new(AtomicHandle::null()),
            retired: Mutex::new(Vec::new()),
            disposer: None,
            requested: None,
            negotiated: None,
        }
    }

    /// Current state.
    ///
    /// Also where a device failure reported by the callback side gets logged,
    /// once.
    pub fn state(&self) -> DriverState {
        if self.shared.device_failed.swap(false) {
            tracing::warn!(backend = self.backend.name(), "Audio device failed; stream stopped");
        }
        DriverState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == DriverState::Running
    }

    /// Validate and negotiate `config`, and pre-warm scratch memory for it.
    pub fn configure(&mut self, config: DriverConfig) -> Result<()> {
        if self.state() == DriverState::Running {
            return Err(Error::InvalidConfig(
                "cannot reconfigure a running stream; stop it first".into(),
            ));
        }
        config.validate()?;

        let negotiated = self.backend.negotiate(&config)?;
        negotiated.validate()?;
        if negotiated != config {
            tracing::warn!(
                requested = ?config,
                negotiated = ?negotiated,
                backend = self.backend.name(),
                "Backend adjusted stream configuration"
            );
        }

        for channels in [negotiated.inputs, negotiated.outputs] {
            self.pool
                .prewarm(negotiated.scratch_bytes(channels), SCRATCH_PREWARM)?;
        }

        if self.processor.is_null() {
            self.processor.set(Box::new(Silence));
        }

        self.shared.cpu.set_sample_rate(negotiated.sample_rate);
        self.requested = Some(config);
        self.negotiated = Some(negotiated);
        self.transition(DriverState::Initialized);
        Ok(())
    }

    /// Start streaming.
    ///
    /// From `Stopped` the last configuration is applied again first.
    pub fn start(&mut self) -> Result<()> {
        match self.state() {
            DriverState::Running => return Ok(()),
            DriverState::Uninitialized => return Err(Error::NotConfigured),
            DriverState::Stopped => {
                self.backend.close();
                let config = self.requested.ok_or(Error::NotConfigured)?;
                self.configure(config)?;
            }
            DriverState::Initialized => {}
        }

        let config = self.negotiated.ok_or(Error::NotConfigured)?;
        self.shared.stop_requested.set(false);
        self.shared.device_failed.set(false);
        self.shared.block_size.store(config.block_size, Ordering::Relaxed);

        let allocator: Arc<dyn RtAllocator> = self.pool.clone();
        let renderer = BlockRenderer::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.processor),
            allocator,
            config,
        );

        // Running before the stream plays, so an immediate device failure
        // is not lost.
        self.transition(DriverState::Running);
        if let Err(err) = self.backend.open(renderer) {
            self.backend.close();
            self.transition(DriverState::Initialized);
            return Err(err);
        }
        Ok(())
    }

    /// Stop streaming. Idempotent.
    pub fn stop(&mut self) {
        match self.state() {
            DriverState::Running => {
                self.shared.stop_requested.set(true);
                self.backend.close();
                self.transition(DriverState::Stopped);
            }
            DriverState::Stopped => self.backend.close(),
            DriverState::Uninitialized | DriverState::Initialized => {}
        }
    }

    /// Publish `processor` for the next block.
    ///
    /// The previous processor is retired, never dropped by the callback.
    pub fn publish(&self, processor: impl BlockProcessor + 'static) {
        if let Some(old) = self.processor.replace(Box::new(processor)) {
            self.retire(old);
        }
        self.collect();
    }

    /// Unpublish the current processor; blocks render silent until the next
    /// `publish`.
    pub fn clear(&self) {
        if let Some(old) = self.processor.take() {
            self.retire(old);
        }
        self.collect();
    }

    /// Release every retired processor no block can still be using.
    ///
    /// Returns how many were released. `publish` and `clear` call this too;
    /// call it periodically to release the last one after the stream moves on.
    pub fn collect(&self) -> usize {
        let epoch = self.shared.render_epoch.load(Ordering::Acquire);
        let ready: Vec<Retired> = {
            let mut retired = self.retired.lock();
            let (ready, waiting): (Vec<Retired>, Vec<Retired>) = retired
                .drain(..)
                .partition(|entry: &Retired| entry.is_quiescent(epoch));
            *retired = waiting;
            ready
        };

        let count = ready.len();
        for entry in ready {
            self.dispose(entry.processor);
        }
        count
    }

    /// Processors retired but not yet released.
    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }

    /// Route released processors through `disposer` instead of dropping them
    /// on the thread that collects them.
    pub fn set_disposer(&mut self, disposer: impl Fn(RetiredProcessor) + Send + Sync + 'static) {
        self.disposer = Some(Box::new(disposer));
    }

    /// The slot the callback reads its processor from.
    ///
    /// Values replaced directly through the slot skip retirement and may be
    /// dropped by the callback; prefer [`publish`](Self::publish).
    pub fn graph_handle(&self) -> Arc<ProcessorHandle> {
        Arc::clone(&self.processor)
    }

    pub fn cpu(&self) -> &CpuMeter {
        &self.shared.cpu
    }

    /// Frames rendered since the driver was created.
    pub fn sample_position(&self) -> u64 {
        self.shared.position.load(Ordering::Relaxed)
    }

    /// Block size of the most recent callback.
    pub fn block_size(&self) -> usize {
        self.shared.block_size.load(Ordering::Relaxed)
    }

    /// Blocks rendered silent because nothing was published or the block
    /// exceeded the scratch size.
    pub fn overruns(&self) -> u64 {
        self.shared.overruns.load(Ordering::Relaxed)
    }

    /// Blocks rendered silent because the processor panicked.
    pub fn processor_panics(&self) -> u64 {
        self.shared.panics.load(Ordering::Relaxed)
    }

    /// Configuration in effect after negotiation.
    pub fn config(&self) -> Option<&DriverConfig> {
        self.negotiated.as_ref()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn pool(&self) -> &Arc<PoolAllocator> {
        &self.pool
    }

    fn retire(&self, processor: RetiredProcessor) {
        // Pairs with the fence in BlockRenderer::render.
        fence(Ordering::SeqCst);
        let epoch = self.shared.render_epoch.load(Ordering::Acquire);
        self.retired.lock().push(Retired { processor, epoch });
    }

    fn dispose(&self, processor: RetiredProcessor) {
        match &self.disposer {
            Some(disposer) => disposer(processor),
            None => drop(processor),
        }
    }

    fn transition(&self, to: DriverState) {
        let from = DriverState::from_u8(self.shared.state.swap(to as u8, Ordering::AcqRel));
        if from != to {
            tracing::info!(?from, ?to, backend = self.backend.name(), "Driver state changed");
        }
    }
}

impl Drop for AudioDriver {
    fn drop(&mut self) {
        self.stop();

        // The stream is closed, so nothing renders any more.
        if let Some(current) = self.processor.take() {
            self.dispose(current);
        }
        for entry in core::mem::take(self.retired.get_mut()) {
            self.dispose(entry.processor);
        }
    }
}
