//! Integration tests for the routing graph
//!
//! Property tests drive random rewiring and check that the graph stays
//! acyclic and that rendering follows the summed, scaled signal paths.

use crate::support::Constant;
use proptest::prelude::*;
use roomcast_core::domain::audio::StreamConfig;
use roomcast_core::domain::graph::{
    GainControl, GainNode, GraphError, SourceNode, CAPTURE_SINK, PLAYBACK_SINK,
};
use roomcast_core::domain::RoutingGraph;
use std::collections::BTreeSet;

const GAINS: usize = 6;

fn gain_name(index: usize) -> String {
    format!("gain-{index}")
}

fn graph_with_gains(gains: &[f32]) -> RoutingGraph {
    let mut graph = RoutingGraph::new(StreamConfig::default());
    graph
        .set_node("source", Box::new(SourceNode::new(Constant(1.0))))
        .unwrap();
    for (index, gain) in gains.iter().enumerate() {
        graph
            .set_node(
                gain_name(index),
                Box::new(GainNode::new(GainControl::new(*gain))),
            )
            .unwrap();
    }
    graph
}

/// Whether `to` can be reached from `from` by following edges
fn reachable(graph: &RoutingGraph, from: &str, to: &str) -> bool {
    let mut stack = vec![from.to_string()];
    let mut seen = BTreeSet::new();
    while let Some(current) = stack.pop() {
        if current == to {
            return true;
        }
        if seen.insert(current.clone()) {
            stack.extend(
                graph
                    .outputs_of(&current)
                    .into_iter()
                    .map(|name| name.as_str().to_string()),
            );
        }
    }
    false
}

proptest! {
    #[test]
    fn prop_rewiring_never_creates_a_cycle(
        edges in prop::collection::vec((0..GAINS, 0..GAINS), 0..40)
    ) {
        let mut graph = graph_with_gains(&[1.0; GAINS]);

        for (from, to) in edges {
            let (from, to) = (gain_name(from), gain_name(to));
            let would_cycle = from == to || reachable(&graph, &to, &from);
            match graph.connect(from.as_str(), to.as_str()) {
                Ok(()) => prop_assert!(!would_cycle),
                Err(GraphError::CycleDetected { .. }) => prop_assert!(would_cycle),
                Err(other) => prop_assert!(false, "unexpected error {other}"),
            }
        }

        for index in 0..GAINS {
            let name = gain_name(index);
            for next in graph.outputs_of(&name) {
                prop_assert!(!reachable(&graph, next.as_str(), &name));
            }
        }
    }

    #[test]
    fn prop_chain_multiplies_gains(
        gains in prop::collection::vec(0.0f32..=1.0, 1..GAINS)
    ) {
        let mut graph = graph_with_gains(&gains);
        graph.connect("source", gain_name(0).as_str()).unwrap();
        for index in 1..gains.len() {
            graph
                .connect(gain_name(index - 1).as_str(), gain_name(index).as_str())
                .unwrap();
        }
        graph.connect(gain_name(gains.len() - 1).as_str(), PLAYBACK_SINK).unwrap();

        let expected: f32 = gains.iter().product();
        let block = graph.render(32);
        for sample in block.playback.channel(0) {
            prop_assert!((sample - expected).abs() < 1e-5);
        }
        prop_assert!(block.capture.is_silent());
    }

    #[test]
    fn prop_removing_a_node_drops_its_edges(
        edges in prop::collection::vec((0..GAINS, 0..GAINS), 0..30),
        victim in 0..GAINS
    ) {
        let mut graph = graph_with_gains(&[1.0; GAINS]);
        for (from, to) in edges {
            let _ = graph.connect(gain_name(from).as_str(), gain_name(to).as_str());
        }

        let name = gain_name(victim);
        graph.disconnect(&name).unwrap();

        prop_assert!(!graph.contains(&name));
        prop_assert!(graph.outputs_of(&name).is_empty());
        prop_assert!(graph.inputs_of(&name).is_empty());
    }
}

#[test]
fn test_parallel_paths_are_summed() {
    let mut graph = graph_with_gains(&[0.25, 0.5]);
    graph.connect("source", gain_name(0).as_str()).unwrap();
    graph.connect("source", gain_name(1).as_str()).unwrap();
    graph.connect(gain_name(0).as_str(), CAPTURE_SINK).unwrap();
    graph.connect(gain_name(1).as_str(), CAPTURE_SINK).unwrap();
    graph.connect(gain_name(1).as_str(), PLAYBACK_SINK).unwrap();

    let block = graph.render(16);
    assert!(block.capture.channel(1).iter().all(|s| (s - 0.75).abs() < 1e-6));
    assert!(block.playback.channel(0).iter().all(|s| (s - 0.5).abs() < 1e-6));
}

#[test]
fn test_sinks_cannot_be_replaced_or_fed_from() {
    let mut graph = graph_with_gains(&[1.0]);
    assert_eq!(
        graph.set_node(PLAYBACK_SINK, Box::new(GainNode::new(GainControl::new(1.0)))),
        Err(GraphError::ReservedNode(PLAYBACK_SINK.to_string()))
    );
    assert!(matches!(
        graph.connect(CAPTURE_SINK, gain_name(0).as_str()),
        Err(GraphError::ArityMismatch { .. })
    ));
    assert!(matches!(
        graph.connect(gain_name(0).as_str(), "source"),
        Err(GraphError::ArityMismatch { .. })
    ));
}

#[test]
fn test_replacing_a_node_keeps_the_rest_of_the_graph() {
    let mut graph = graph_with_gains(&[0.5]);
    graph.connect("source", gain_name(0).as_str()).unwrap();
    graph.connect(gain_name(0).as_str(), PLAYBACK_SINK).unwrap();

    graph
        .set_node("source", Box::new(SourceNode::new(Constant(0.2))))
        .unwrap();
    // The replaced node loses its edges, the downstream chain survives
    assert!(!graph.is_connected("source", gain_name(0).as_str()));
    assert!(graph.is_connected(gain_name(0).as_str(), PLAYBACK_SINK));

    graph.connect("source", gain_name(0).as_str()).unwrap();
    let block = graph.render(8);
    assert!(block.playback.channel(0).iter().all(|s| (s - 0.1).abs() < 1e-6));
}
