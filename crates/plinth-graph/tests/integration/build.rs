//! Wiring properties over generated graphs.

use crate::helpers::*;
use plinth_core::{BlockProcessor, ProcessInfo};
use plinth_graph::{GraphBuilder, GraphError, IOKey, UnitSpec};
use proptest::prelude::*;

fn render_mono(graph: &plinth_graph::UnitGraph, frames: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; frames];
    {
        let mut outputs = [out.as_mut_slice()];
        graph.process(
            &[],
            &mut outputs,
            &ProcessInfo {
                frames,
                sample_rate: 48000.0,
                position: 0,
            },
        );
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A chain of MulAdd stages computes the same affine map as folding the
    /// stages by hand.
    #[test]
    fn prop_mul_add_chain(
        start in -1.0f32..1.0,
        stages in prop::collection::vec((-2.0f32..2.0, -1.0f32..1.0), 1..12),
    ) {
        let pool = pool();
        let mut builder = GraphBuilder::new();
        let mut tail = builder.add(UnitSpec::Constant(start));
        let mut expected = start;

        for &(mul, add) in &stages {
            let stage = builder.add(UnitSpec::MulAdd);
            builder.connect(tail, stage, IOKey::Signal).unwrap();
            builder.set(stage, IOKey::Multiply, mul as f64).unwrap();
            builder.set(stage, IOKey::Add, add as f64).unwrap();
            expected = expected * mul + add;
            tail = stage;
        }
        builder.route(tail, 0).unwrap();

        let graph = builder.build(allocator(&pool), BLOCK).unwrap();
        prop_assert_eq!(graph.node_count(), stages.len() + 1);
        for s in render_mono(&graph, BLOCK) {
            prop_assert!((s - expected).abs() < 1e-4);
        }
    }

    /// Closing any chain back onto its head is a cycle.
    #[test]
    fn prop_closed_chain_is_cycle(len in 1usize..10) {
        let pool = pool();
        let mut builder = GraphBuilder::new();
        let nodes: Vec<_> = (0..len).map(|_| builder.add(UnitSpec::Mix)).collect();

        for pair in nodes.windows(2) {
            builder.connect(pair[0], pair[1], IOKey::LeftOperand).unwrap();
        }
        builder.connect(nodes[len - 1], nodes[0], IOKey::LeftOperand).unwrap();
        for &node in &nodes {
            builder.set(node, IOKey::RightOperand, 0.0).unwrap();
        }

        let result = builder.build(allocator(&pool), BLOCK);
        prop_assert!(matches!(result, Err(GraphError::Cycle(_))));
    }
}

#[test]
fn test_fan_out_sums_per_route() {
    let pool = pool();
    let mut builder = GraphBuilder::new();
    let c = builder.add(UnitSpec::Constant(0.1));
    let left = builder.add(UnitSpec::MulAdd);
    let right = builder.add(UnitSpec::MulAdd);
    builder.connect(c, left, IOKey::Signal).unwrap();
    builder.connect(c, right, IOKey::Signal).unwrap();
    builder.set(right, IOKey::Multiply, 3.0).unwrap();
    builder.route(left, 0).unwrap();
    builder.route(right, 0).unwrap();

    let graph = builder.build(allocator(&pool), BLOCK).unwrap();
    assert!(all_equal(&render_mono(&graph, BLOCK), 0.4));
}

#[test]
fn test_empty_graph_is_silent() {
    let pool = pool();
    let graph = GraphBuilder::new().build(allocator(&pool), BLOCK).unwrap();
    assert_eq!(graph.node_count(), 0);
    assert!(all_equal(&render_mono(&graph, BLOCK), 0.0));
    assert!(graph.describe().starts_with("UnitGraph: 0 nodes"));
}
