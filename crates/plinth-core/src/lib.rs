//! Real-time memory and publication core for the plinth audio engine.
//!
//! # Primary API
//!
//! - [`PoolAllocator`]: lock-free size-classed block pool, audio-thread safe once pre-warmed
//! - [`DeferredFreeArena`]: allocate off the audio thread, free from anywhere; a reaper thread reclaims
//! - [`AtomicHandle`]: lock-free, reference-counted publication slot
//! - [`AudioDriver`]: callback driver state machine over an [`AudioBackend`]
//!
//! # Feature-gated APIs
//!
//! - `"cpal"`: [`CpalBackend`] hardware output (enabled by default)
//!
//! # Example
//!
//! ```ignore
//! use plinth_core::prelude::*;
//!
//! let pool = Arc::new(PoolAllocator::new(PoolConfig::default())?);
//! let mut driver = AudioDriver::new(CpalBackend::new(None), pool);
//!
//! driver.configure(DriverConfig::default())?;
//! driver.publish(|_: &[&[f32]], outputs: &mut [&mut [f32]], _: &ProcessInfo| {
//!     for channel in outputs.iter_mut() {
//!         channel.fill(0.25);
//!     }
//! });
//! driver.start()?;
//! ```

pub mod error;
pub use error::{Error, Result};

pub mod rt;

pub mod memory;
pub use memory::{
    ArenaFreer, ArenaStats, BackingAllocator, DeferredFreeArena, PoolAllocator, PoolConfig,
    PoolStats, PooledBuffer, ReaperConfig, RtAllocator, SystemHeap,
};

mod table;

pub mod handle;
pub use handle::{AtomicHandle, Shared};

pub(crate) mod lockfree;
pub use lockfree::{AtomicDouble, AtomicFlag, AtomicFloat};

pub mod driver;
pub use driver::{
    AudioBackend, AudioDriver, BlockProcessor, BlockRenderer, CallbackStatus, CpuMeter,
    CpuMetrics, Disposer, DriverConfig, DriverState, OfflineBackend, OfflineController,
    ProcessInfo, ProcessorHandle, RetiredProcessor, Silence,
};

#[cfg(feature = "cpal")]
pub use driver::CpalBackend;

pub mod prelude {
    pub use crate::{
        AtomicHandle, AudioDriver, BlockProcessor, DeferredFreeArena, DriverConfig, DriverState,
        Error, PoolAllocator, PoolConfig, ProcessInfo, ReaperConfig, Result, RtAllocator, Shared,
    };
    pub use std::sync::Arc;

    #[cfg(feature = "cpal")]
    pub use crate::CpalBackend;
}
