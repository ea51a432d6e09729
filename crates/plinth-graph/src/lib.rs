//! Unit graph and IO metadata for the plinth engine.
//!
//! - [`info`]: port metadata ([`IOKey`], [`Measure`], [`IOLimit`], [`IOInfo`]) and the [`IORegistry`]
//! - [`UnitSpec`] / [`UnitKind`]: the built-in unit kinds
//! - [`GraphBuilder`] → [`UnitGraph`]: a DAG of units rendered block by block as a
//!   [`BlockProcessor`](plinth_core::BlockProcessor)
//!
//! # Example
//!
//! ```ignore
//! use plinth_graph::{GraphBuilder, IOKey, UnitSpec};
//!
//! let mut graph = GraphBuilder::new();
//! let lfo = graph.add(UnitSpec::Sine);
//! let osc = graph.add(UnitSpec::Sine);
//! graph.set(lfo, IOKey::Frequency, 5.0)?;
//! graph.set(lfo, IOKey::Multiply, 10.0)?;
//! graph.connect(lfo, osc, IOKey::Frequency)?;
//! graph.route(osc, 0)?;
//!
//! driver.publish(graph.build(pool, 4096)?);
//! ```

pub mod error;
pub use error::{GraphError, Result};

pub mod info;
pub use info::{IOInfo, IOKey, IOLimit, IORegistry, IOType, Measure, UnitInfo};

mod units;
pub use units::{UnitKind, UnitSpec, MAX_UNIT_INPUTS};

mod graph;
pub use graph::{GraphBuilder, NodeId, UnitGraph};
