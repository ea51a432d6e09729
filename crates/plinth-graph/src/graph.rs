//! Graph construction and block rendering.
//!
//! A [`GraphBuilder`] collects nodes, their connections and constant inputs on
//! a control thread. [`GraphBuilder::build`] orders the nodes, allocates every
//! buffer up front and returns a [`UnitGraph`] that renders without
//! allocating, ready to publish to the driver.

use crate::error::{GraphError, Result};
use crate::info::IOKey;
use crate::units::{Unit, UnitKind, UnitSpec, MAX_UNIT_INPUTS};
use plinth_core::driver::MAX_CHANNELS;
use plinth_core::{AtomicFlag, AtomicFloat, BlockProcessor, PooledBuffer, ProcessInfo, RtAllocator};
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifies a node within one builder and the graph built from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Binding {
    Unbound,
    Node(NodeId),
    Value(f32),
}

#[derive(Debug)]
struct NodeDef {
    spec: UnitSpec,
    inputs: Vec<Binding>,
}

/// Collects nodes and wiring for a [`UnitGraph`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<NodeDef>,
    routes: Vec<(NodeId, usize)>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, spec: UnitSpec) -> NodeId {
        let inputs = vec![Binding::Unbound; spec.kind().inputs().len()];
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(NodeDef { spec, inputs });
        id
    }

    /// Feed `from`'s output into input `key` of `to`.
    pub fn connect(&mut self, from: NodeId, to: NodeId, key: IOKey) -> Result<()> {
        self.node(from)?;
        let slot = self.input_slot(to, key)?;
        *slot = Binding::Node(from);
        Ok(())
    }

    /// Bind a constant to input `key` of `node`, checked against the input's limit.
    pub fn set(&mut self, node: NodeId, key: IOKey, value: f64) -> Result<()> {
        let kind = self.node(node)?.spec.kind();
        if let Some(info) = kind.inputs().iter().find(|info| info.key == key) {
            info.validate(value)?;
        }
        let slot = self.input_slot(node, key)?;
        *slot = Binding::Value(value as f32);
        Ok(())
    }

    /// Sum `node`'s output into device output `channel`.
    pub fn route(&mut self, node: NodeId, channel: usize) -> Result<()> {
        self.node(node)?;
        if channel >= MAX_CHANNELS {
            return Err(GraphError::InvalidChannel {
                channel,
                max: MAX_CHANNELS - 1,
            });
        }
        self.routes.push((node, channel));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn node(&self, id: NodeId) -> Result<&NodeDef> {
        self.nodes.get(id.index()).ok_or(GraphError::UnknownNode(id))
    }

    fn input_slot(&mut self, id: NodeId, key: IOKey) -> Result<&mut Binding> {
        let def = self
            .nodes
            .get_mut(id.index())
            .ok_or(GraphError::UnknownNode(id))?;
        let kind = def.spec.kind();
        let index = kind.input_index(key).ok_or(GraphError::UnknownInput {
            kind: kind.name(),
            key,
        })?;
        Ok(&mut def.inputs[index])
    }

    /// Dependency order of every node (Kahn).
    fn order(&self) -> Result<Vec<usize>> {
        let count = self.nodes.len();
        let mut pending = vec![0usize; count];
        let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); count];

        for (index, def) in self.nodes.iter().enumerate() {
            for binding in &def.inputs {
                if let Binding::Node(from) = binding {
                    pending[index] += 1;
                    consumers[from.index()].push(index);
                }
            }
        }

        let mut ready: VecDeque<usize> = (0..count).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(count);
        while let Some(index) = ready.pop_front() {
            order.push(index);
            for &consumer in &consumers[index] {
                pending[consumer] -= 1;
                if pending[consumer] == 0 {
                    ready.push_back(consumer);
                }
            }
        }

        if order.len() < count {
            let stuck = pending.iter().position(|&p| p > 0).unwrap_or_default();
            return Err(GraphError::Cycle(NodeId(stuck as u32)));
        }
        Ok(order)
    }

    /// Resolve defaults, order the nodes and allocate every buffer.
    ///
    /// Buffers hold `max_block_size` samples; the built graph renders silence
    /// for larger blocks.
    pub fn build(self, allocator: Arc<dyn RtAllocator>, max_block_size: usize) -> Result<UnitGraph> {
        let order = self.order()?;

        let mut slot_of = vec![0usize; self.nodes.len()];
        for (slot, &index) in order.iter().enumerate() {
            slot_of[index] = slot;
        }

        let mut nodes = Vec::with_capacity(order.len());
        let mut units = Vec::with_capacity(order.len());
        let mut outputs = Vec::with_capacity(order.len());
        let mut constants = Vec::new();
        let mut buffers = Vec::new();

        for &index in &order {
            let id = NodeId(index as u32);
            let def = &self.nodes[index];
            let kind = def.spec.kind();

            let mut sources = Vec::with_capacity(def.inputs.len());
            for (info, binding) in kind.inputs().iter().zip(&def.inputs) {
                let value = match *binding {
                    Binding::Node(from) => {
                        sources.push(Source::Node(slot_of[from.index()]));
                        continue;
                    }
                    Binding::Value(value) => value,
                    Binding::Unbound => match info.default {
                        Some(default) => info.limit.apply(default) as f32,
                        None => return Err(GraphError::MissingInput { node: id, key: info.key }),
                    },
                };
                buffers.push(ConstantBuffer::new(&allocator, max_block_size, value)?);
                constants.push(AtomicFloat::new(value));
                sources.push(Source::Constant(constants.len() - 1));
            }

            nodes.push(NodeInfo { id, kind, sources });
            units.push(def.spec.instantiate());
            outputs.push(PooledBuffer::new(Arc::clone(&allocator), max_block_size)?);
        }

        let routes: Vec<(usize, usize)> = self
            .routes
            .iter()
            .map(|&(node, channel)| (slot_of[node.index()], channel))
            .collect();

        tracing::debug!(
            nodes = nodes.len(),
            routes = routes.len(),
            constants = constants.len(),
            max_block_size,
            "Unit graph built"
        );

        Ok(UnitGraph {
            nodes,
            slot_of,
            constants,
            routes,
            max_block_size,
            rendering: AtomicFlag::new(false),
            render: UnsafeCell::new(RenderState {
                units,
                outputs,
                constants: buffers,
            }),
            skipped: AtomicU64::new(0),
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Source {
    /// Output buffer of the node at this slot.
    Node(usize),
    /// Index into the graph's constant cells.
    Constant(usize),
}

/// Immutable description of one node.
struct NodeInfo {
    id: NodeId,
    kind: UnitKind,
    sources: Vec<Source>,
}

/// Samples fed to a constant input, and the value they were filled with.
struct ConstantBuffer {
    samples: PooledBuffer,
    value: f32,
}

impl ConstantBuffer {
    fn new(allocator: &Arc<dyn RtAllocator>, len: usize, value: f32) -> Result<Self> {
        let mut samples = PooledBuffer::new(Arc::clone(allocator), len)?;
        samples.fill(value);
        Ok(Self { samples, value })
    }

    /// Refill if the published value moved since the last block.
    #[inline]
    fn refresh(&mut self, value: f32) {
        if value.to_bits() != self.value.to_bits() {
            self.value = value;
            self.samples.fill(value);
        }
    }
}

/// Everything a block mutates. Only `process` touches it.
struct RenderState {
    /// In dependency order: a node only reads slots before its own.
    units: Vec<Box<dyn Unit>>,
    outputs: Vec<PooledBuffer>,
    constants: Vec<ConstantBuffer>,
}

impl RenderState {
    fn render(&mut self, nodes: &[NodeInfo], cells: &[AtomicFloat], info: &ProcessInfo) {
        let frames = info.frames;
        let RenderState {
            units,
            outputs,
            constants,
        } = self;

        for (buffer, cell) in constants.iter_mut().zip(cells) {
            buffer.refresh(cell.get());
        }

        for (slot, (unit, node)) in units.iter_mut().zip(nodes).enumerate() {
            let (done, rest) = outputs.split_at_mut(slot);
            let output = &mut rest[0][..frames];

            let empty: &[f32] = &[];
            let mut inputs = [empty; MAX_UNIT_INPUTS];
            for (input, source) in inputs.iter_mut().zip(&node.sources) {
                *input = match *source {
                    Source::Node(from) => &done[from][..frames],
                    Source::Constant(index) => &constants[index].samples[..frames],
                };
            }

            unit.render(&inputs[..node.sources.len()], output, info);
        }
    }
}

/// Clears the render flag when a block ends, even by unwinding.
struct Rendering<'a>(&'a AtomicFlag);

impl Drop for Rendering<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// A built graph, rendered by the driver as a [`BlockProcessor`].
///
/// Node metadata is fixed at build time and readable from any thread without
/// blocking the callback. Constant inputs live in atomic cells that
/// [`set`](Self::set) writes and the next block picks up. Unit state and
/// buffers belong to whichever block is rendering.
pub struct UnitGraph {
    /// Render order.
    nodes: Vec<NodeInfo>,
    /// Render slot of each node, by node index.
    slot_of: Vec<usize>,
    constants: Vec<AtomicFloat>,
    /// (slot, device channel)
    routes: Vec<(usize, usize)>,
    max_block_size: usize,
    rendering: AtomicFlag,
    render: UnsafeCell<RenderState>,
    skipped: AtomicU64,
}

// SAFETY: `render` is only reached from `process` while holding the
// `rendering` flag, so at most one thread touches it at a time; every other
// field is immutable or atomic.
unsafe impl Sync for UnitGraph {}

impl UnitGraph {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    /// Blocks left silent because another block of this graph was still
    /// rendering, which only happens when one graph is published to two
    /// streams at once.
    pub fn skipped_blocks(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Replace a constant input of a built graph.
    ///
    /// The input must have been bound to a value or left at its default; a
    /// connected input can't be changed here. Never blocks the callback.
    pub fn set(&self, node: NodeId, key: IOKey, value: f64) -> Result<()> {
        let info = self.info(node).ok_or(GraphError::UnknownNode(node))?;
        let unknown = GraphError::UnknownInput {
            kind: info.kind.name(),
            key,
        };
        let index = info.kind.input_index(key).ok_or(unknown)?;
        info.kind.inputs()[index].validate(value)?;

        match info.sources[index] {
            Source::Constant(cell) => {
                self.constants[cell].set(value as f32);
                Ok(())
            }
            Source::Node(_) => Err(GraphError::ConnectedInput { node, key }),
        }
    }

    /// Whether `node` is part of this graph.
    pub fn contains(&self, node: NodeId) -> bool {
        node.index() < self.slot_of.len()
    }

    /// Multi-line listing of nodes in render order with their inputs and routes.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "UnitGraph: {} nodes, {} routes",
            self.nodes.len(),
            self.routes.len()
        );

        for node in &self.nodes {
            let _ = write!(out, "  {} {}", node.id, node.kind);
            let inputs = node.kind.inputs();
            if !inputs.is_empty() {
                out.push_str(" [");
                for (i, (info, source)) in inputs.iter().zip(&node.sources).enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let _ = match *source {
                        Source::Node(slot) => write!(out, "{} <- {}", info.name(), self.nodes[slot].id),
                        Source::Constant(cell) => write!(
                            out,
                            "{} = {}{}",
                            info.name(),
                            self.constants[cell].get(),
                            info.measure_symbol()
                        ),
                    };
                }
                out.push(']');
            }
            out.push('\n');
        }

        for &(slot, channel) in &self.routes {
            let _ = writeln!(out, "  {} -> out {}", self.nodes[slot].id, channel);
        }
        out
    }

    fn info(&self, node: NodeId) -> Option<&NodeInfo> {
        self.slot_of.get(node.index()).map(|&slot| &self.nodes[slot])
    }
}

impl BlockProcessor for UnitGraph {
    fn process(&self, _inputs: &[&[f32]], outputs: &mut [&mut [f32]], info: &ProcessInfo) {
        if info.frames > self.max_block_size {
            return;
        }
        if self.rendering.swap(true) {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let _rendering = Rendering(&self.rendering);

        // SAFETY: the flag is ours until `_rendering` drops.
        let state = unsafe { &mut *self.render.get() };
        state.render(&self.nodes, &self.constants, info);

        for &(slot, channel) in &self.routes {
            if let Some(out) = outputs.get_mut(channel) {
                for (o, s) in out.iter_mut().zip(&state.outputs[slot][..info.frames]) {
                    *o += s;
                }
            }
        }
    }
}

impl fmt::Debug for UnitGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitGraph")
            .field("routes", &self.routes)
            .field("max_block_size", &self.max_block_size)
            .field("nodes", &self.nodes.len())
            .field("skipped", &self.skipped_blocks())
            .finish_non_exhaustive()
    }
}
