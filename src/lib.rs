//! # Plinth - Real-time Audio Engine
//!
//! Umbrella crate tying the real-time memory core, the callback driver and
//! the unit graph together.
//!
//! ## Architecture
//!
//! - **plinth-core** - Pool allocator, deferred-free arena, atomic handle, callback driver
//! - **plinth-graph** - IO metadata model, built-in units, graph builder and renderer
//!
//! ## Quick Start
//!
//! ```ignore
//! use plinth::prelude::*;
//!
//! let mut engine = PlinthEngine::builder()
//!     .sample_rate(48000.0)
//!     .build()?;
//!
//! let mut graph = engine.graph_builder();
//! let osc = graph.add(UnitSpec::Sine);
//! graph.set(osc, IOKey::Frequency, 220.0)?;
//! graph.route(osc, 0)?;
//! engine.publish(graph)?;
//!
//! engine.start()?;
//! ```
//!
//! ## Feature Flags
//!
//! - `cpal` (default) - hardware output through CPAL; without it supply a
//!   backend with `PlinthEngineBuilder::backend`

/// Re-export of plinth-core for direct access
pub use plinth_core as core;

/// Re-export of plinth-graph for direct access
pub use plinth_graph as graph;

pub use plinth_core::{
    // Memory
    ArenaStats,
    // Lock-free primitives
    AtomicDouble,
    AtomicFlag,
    AtomicFloat,
    AtomicHandle,
    // Driver
    AudioBackend,
    AudioDriver,
    BlockProcessor,
    CpuMetrics,
    DeferredFreeArena,
    DriverConfig,
    DriverState,
    OfflineBackend,
    OfflineController,
    PoolAllocator,
    PoolConfig,
    PoolStats,
    ProcessInfo,
    ReaperConfig,
    RtAllocator,
    Shared,
};

#[cfg(feature = "cpal")]
pub use plinth_core::CpalBackend;

pub use plinth_graph::{
    GraphBuilder, GraphError, IOInfo, IOKey, IOLimit, IORegistry, Measure, NodeId, UnitGraph,
    UnitKind, UnitSpec,
};

mod error;
pub use error::{Error, Result};

mod builder;
pub use builder::PlinthEngineBuilder;

mod engine;
pub use engine::{MemoryStats, PlinthEngine};

pub mod prelude {
    pub use crate::{
        AtomicHandle, BlockProcessor, DriverConfig, DriverState, Error, GraphBuilder, IOKey,
        NodeId, OfflineBackend, PlinthEngine, ProcessInfo, Result, UnitSpec,
    };
    pub use std::sync::Arc;
}
