//! PlinthEngine: the driver, its memory and the published unit graph.

use crate::{PlinthEngineBuilder, Result};
use plinth_core::{
    ArenaStats, AtomicHandle, AudioDriver, BlockProcessor, CpuMetrics, DeferredFreeArena,
    DriverConfig, DriverState, PoolAllocator, PoolStats, ProcessInfo, RtAllocator, Silence,
};
use plinth_graph::{GraphBuilder, UnitGraph};
use std::sync::Arc;

/// Counters of both allocators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryStats {
    pub pool: PoolStats,
    pub arena: ArenaStats,
}

/// Processor the driver sees for a graph the engine also keeps.
struct PublishedGraph(Arc<UnitGraph>);

impl BlockProcessor for PublishedGraph {
    #[inline]
    fn process(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]], info: &ProcessInfo) {
        self.0.process(inputs, outputs, info)
    }
}

/// Real-time engine coordinating the pool, the deferred-free arena, the
/// callback driver and the unit graph it renders.
///
/// Graph buffers come from the pool. Replaced graphs and processors go to
/// the arena once no block can still be rendering them, so their teardown
/// runs on its reaper thread.
///
/// # Example
///
/// ```ignore
/// use plinth::prelude::*;
///
/// let mut engine = PlinthEngine::builder().build()?;
///
/// let level = engine.parameter(0.2);
/// let mut graph = engine.graph_builder();
/// let osc = graph.add(UnitSpec::Sine);
/// let gain = graph.add(UnitSpec::Variable(level.clone()));
/// let out = graph.add(UnitSpec::MulAdd);
/// graph.connect(osc, out, IOKey::Signal)?;
/// graph.connect(gain, out, IOKey::Multiply)?;
/// graph.route(out, 0)?;
/// graph.route(out, 1)?;
///
/// engine.publish(graph)?;
/// engine.start()?;
///
/// level.set(0.5); // picked up at the next block
/// ```
pub struct PlinthEngine {
    driver: AudioDriver,
    pool: Arc<PoolAllocator>,
    arena: Arc<DeferredFreeArena>,

    /// Graph currently published.
    graph: Option<Arc<UnitGraph>>,
}

impl PlinthEngine {
    pub fn builder() -> PlinthEngineBuilder {
        PlinthEngineBuilder::default()
    }

    pub(crate) fn from_parts(
        mut driver: AudioDriver,
        pool: Arc<PoolAllocator>,
        arena: DeferredFreeArena,
    ) -> Self {
        let arena = Arc::new(arena);
        let reaper = Arc::clone(&arena);
        driver.set_disposer(move |old| reaper.defer_drop(old));

        Self {
            driver,
            pool,
            arena,
            graph: None,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        Ok(self.driver.start()?)
    }

    /// Stop the stream. Calling it again is a no-op.
    pub fn stop(&mut self) {
        self.driver.stop();
    }

    pub fn state(&self) -> DriverState {
        self.driver.state()
    }

    pub fn is_running(&self) -> bool {
        self.driver.is_running()
    }

    /// Stream configuration after negotiation with the backend.
    pub fn config(&self) -> Option<&DriverConfig> {
        self.driver.config()
    }

    pub fn sample_rate(&self) -> f64 {
        self.driver
            .config()
            .map_or(DriverConfig::default().sample_rate, |c| c.sample_rate)
    }

    pub fn channels(&self) -> usize {
        self.driver.config().map_or(0, |c| c.outputs)
    }

    fn max_block_size(&self) -> usize {
        self.driver
            .config()
            .map_or(DriverConfig::default().max_block_size, |c| c.max_block_size)
    }

    /// Empty builder for the next graph.
    pub fn graph_builder(&self) -> GraphBuilder {
        GraphBuilder::new()
    }

    /// Build `graph` with pool-backed buffers and make it the one the audio
    /// thread renders, from the next block on.
    pub fn publish(&mut self, graph: GraphBuilder) -> Result<Arc<UnitGraph>> {
        let allocator = Arc::clone(&self.pool) as Arc<dyn RtAllocator>;
        let graph = Arc::new(graph.build(allocator, self.max_block_size())?);

        // The driver's copy must hold the last reference to the old graph.
        self.graph = None;
        self.driver.publish(PublishedGraph(Arc::clone(&graph)));
        self.graph = Some(Arc::clone(&graph));
        tracing::debug!(nodes = graph.node_count(), "Graph published");
        Ok(graph)
    }

    /// Publish any other processor in place of a graph.
    pub fn publish_processor(&mut self, processor: impl BlockProcessor + 'static) {
        self.graph = None;
        self.driver.publish(processor);
    }

    /// Hand replaced graphs and processors that no block can still be
    /// rendering to the arena's reaper. Returns how many went.
    ///
    /// Every publish does this too; call it to release the last replaced
    /// graph without publishing again.
    pub fn collect(&self) -> usize {
        self.driver.collect()
    }

    /// Render silence from the next block on.
    pub fn clear(&mut self) {
        self.publish_processor(Silence);
    }

    /// Graph currently published, if the last publish was a graph.
    pub fn graph(&self) -> Option<&Arc<UnitGraph>> {
        self.graph.as_ref()
    }

    /// New control parameter for [`UnitSpec::Variable`](plinth_graph::UnitSpec::Variable) nodes.
    pub fn parameter(&self, value: f32) -> Arc<AtomicHandle<f32>> {
        Arc::new(AtomicHandle::new(value))
    }

    pub fn cpu(&self) -> CpuMetrics {
        self.driver.cpu().metrics(self.driver.block_size())
    }

    pub fn sample_position(&self) -> u64 {
        self.driver.sample_position()
    }

    /// Blocks rendered as silence because no processor could run.
    pub fn overruns(&self) -> u64 {
        self.driver.overruns()
    }

    pub fn pool(&self) -> &Arc<PoolAllocator> {
        &self.pool
    }

    pub fn arena(&self) -> &Arc<DeferredFreeArena> {
        &self.arena
    }

    pub fn memory_stats(&self) -> MemoryStats {
        MemoryStats {
            pool: self.pool.stats(),
            arena: self.arena.stats(),
        }
    }

    /// Direct access to the driver (advanced use).
    pub fn driver(&self) -> &AudioDriver {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut AudioDriver {
        &mut self.driver
    }
}

impl Drop for PlinthEngine {
    fn drop(&mut self) {
        // The driver hands everything it still holds to the arena when it drops.
        self.driver.stop();
    }
}
