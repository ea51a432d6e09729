//! Error types for plinth-graph.

use crate::info::IOKey;
use crate::NodeId;
use thiserror::Error;

/// Errors raised while building a unit graph.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Unknown node {0}")]
    UnknownNode(NodeId),

    #[error("{kind} has no input named {key}")]
    UnknownInput { kind: &'static str, key: IOKey },

    #[error("Input {key} of node {node} is unconnected and has no default")]
    MissingInput { node: NodeId, key: IOKey },

    #[error("Value {value} for {key} is outside {limit}")]
    OutOfRange {
        key: IOKey,
        value: f64,
        limit: String,
    },

    #[error("Input {key} of node {node} is driven by another node")]
    ConnectedInput { node: NodeId, key: IOKey },

    #[error("Graph contains a cycle through node {0}")]
    Cycle(NodeId),

    #[error("Output channel {channel} out of range (max {max})")]
    InvalidChannel { channel: usize, max: usize },

    #[error(transparent)]
    Core(#[from] plinth_core::Error),
}

pub type Result<T> = core::result::Result<T, GraphError>;
