//! Named audio routing graph
//!
//! The graph owns a registry of named processing nodes and the directed edges
//! between them. Two sinks always exist: the playback sink (`speaker`), which
//! feeds the local output device through a master volume, and the capture sink
//! (`stream`), whose output is the [`MediaStream`] handed to the media layer.
//!
//! Rendering walks the nodes in topological order. Each node receives the sum
//! of its predecessors' outputs for the block.

pub mod analyser;
pub mod meter;
pub mod nodes;

use crate::domain::audio::{AudioBuffer, MediaStream, StreamConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, trace};

pub use analyser::{AnalyserHandle, AnalyserNode};
pub use meter::{channel_level, MeteringTap, METER_WINDOW};
pub use nodes::{
    CaptureSink, GainControl, GainNode, GateControl, PassThroughGate, PlaybackSink, SourceNode,
};

/// Name of the sink feeding the local output device
pub const PLAYBACK_SINK: &str = "speaker";

/// Name of the sink feeding the outgoing media stream
pub const CAPTURE_SINK: &str = "stream";

/// Blocks buffered between the capture sink and the media layer
const CAPTURE_QUEUE_BLOCKS: usize = 64;

/// Errors raised by graph mutations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Node '{0}' is a fixed sink and cannot be replaced or removed")]
    ReservedNode(String),

    #[error("Cannot connect '{from}' to '{to}': {reason}")]
    ArityMismatch {
        from: String,
        to: String,
        reason: &'static str,
    },

    #[error("Connecting '{from}' to '{to}' would create a cycle")]
    CycleDetected { from: String, to: String },
}

pub type Result<T> = std::result::Result<T, GraphError>;

/// Key under which a node is registered
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeName(String);

impl NodeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for NodeName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// What a node does, which fixes how it may be connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Source,
    Gain,
    MeteringTap,
    PassThroughGate,
    Analyser,
    PlaybackSink,
    CaptureSink,
}

/// Connection points of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub accepts_input: bool,
    pub produces_output: bool,
}

impl NodeKind {
    pub fn arity(&self) -> Arity {
        match self {
            NodeKind::Source => Arity {
                accepts_input: false,
                produces_output: true,
            },
            NodeKind::PlaybackSink | NodeKind::CaptureSink => Arity {
                accepts_input: true,
                produces_output: false,
            },
            _ => Arity {
                accepts_input: true,
                produces_output: true,
            },
        }
    }
}

/// A processing step in the graph
///
/// `process` runs on the render path and must not block.
pub trait AudioNode: Send {
    fn kind(&self) -> NodeKind;

    /// Produce this node's output for one block from the summed input
    fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer);
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Edge {
    from: NodeName,
    to: NodeName,
}

/// Output of one render pass
#[derive(Debug, Clone)]
pub struct RenderedBlock {
    /// What the playback sink sends to the local output device
    pub playback: AudioBuffer,
    /// What the capture sink pushed to the outgoing stream
    pub capture: AudioBuffer,
}

/// The routing graph
pub struct RoutingGraph {
    config: StreamConfig,
    nodes: HashMap<NodeName, Box<dyn AudioNode>>,
    edges: BTreeSet<Edge>,
    order: Option<Vec<NodeName>>,
    master: GainControl,
    capture: MediaStream,
}

/// Graph shared between producers, the session facade and the render thread
pub type SharedGraph = Arc<Mutex<RoutingGraph>>;

/// Lock a shared graph, recovering from a poisoned lock
pub fn lock_graph(graph: &SharedGraph) -> MutexGuard<'_, RoutingGraph> {
    graph.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RoutingGraph {
    /// Create a graph with only the two fixed sinks
    pub fn new(config: StreamConfig) -> Self {
        let master = GainControl::new(1.0);
        let (writer, capture) = MediaStream::channel(CAPTURE_SINK, config, CAPTURE_QUEUE_BLOCKS);

        let mut nodes: HashMap<NodeName, Box<dyn AudioNode>> = HashMap::new();
        nodes.insert(
            NodeName::from(PLAYBACK_SINK),
            Box::new(PlaybackSink::new(master.clone())),
        );
        nodes.insert(NodeName::from(CAPTURE_SINK), Box::new(CaptureSink::new(writer)));

        Self {
            config,
            nodes,
            edges: BTreeSet::new(),
            order: None,
            master,
            capture,
        }
    }

    pub fn into_shared(self) -> SharedGraph {
        Arc::new(Mutex::new(self))
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Master volume applied by the playback sink
    pub fn playback_gain(&self) -> GainControl {
        self.master.clone()
    }

    /// The outgoing stream fed by the capture sink
    pub fn capture_stream(&self) -> MediaStream {
        self.capture.clone()
    }

    pub fn is_reserved(name: &str) -> bool {
        name == PLAYBACK_SINK || name == CAPTURE_SINK
    }

    /// Register `node` under `name`. An existing node of that name is
    /// disconnected from everything and discarded first.
    pub fn set_node(&mut self, name: impl Into<NodeName>, node: Box<dyn AudioNode>) -> Result<()> {
        let name = name.into();
        if Self::is_reserved(name.as_str()) {
            return Err(GraphError::ReservedNode(name.to_string()));
        }
        if self.nodes.contains_key(&name) {
            debug!(node = %name, "replacing node");
            self.remove_edges_of(&name);
        }
        trace!(node = %name, kind = ?node.kind(), "set node");
        self.nodes.insert(name, node);
        self.order = None;
        Ok(())
    }

    /// Route the output of `from` into the input of `to`
    pub fn connect(&mut self, from: impl Into<NodeName>, to: impl Into<NodeName>) -> Result<()> {
        let from = from.into();
        let to = to.into();

        let from_kind = self.kind_of(&from)?;
        let to_kind = self.kind_of(&to)?;
        if !from_kind.arity().produces_output {
            return Err(GraphError::ArityMismatch {
                from: from.to_string(),
                to: to.to_string(),
                reason: "source node has no output",
            });
        }
        if !to_kind.arity().accepts_input {
            return Err(GraphError::ArityMismatch {
                from: from.to_string(),
                to: to.to_string(),
                reason: "destination node takes no input",
            });
        }
        if from == to || self.reaches(&to, &from) {
            return Err(GraphError::CycleDetected {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        trace!(%from, %to, "connect");
        self.edges.insert(Edge { from, to });
        self.order = None;
        Ok(())
    }

    /// Remove a node and every edge touching it
    pub fn disconnect(&mut self, name: &str) -> Result<()> {
        if Self::is_reserved(name) {
            return Err(GraphError::ReservedNode(name.to_string()));
        }
        let key = NodeName::from(name);
        if self.nodes.remove(&key).is_none() {
            return Err(GraphError::UnknownNode(name.to_string()));
        }
        self.remove_edges_of(&key);
        self.order = None;
        debug!(node = name, "disconnected node");
        Ok(())
    }

    /// Like [`disconnect`](Self::disconnect), but absent nodes are not an error
    pub fn discard(&mut self, name: &str) -> bool {
        self.disconnect(name).is_ok()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(&NodeName::from(name))
    }

    pub fn node_kind(&self, name: &str) -> Option<NodeKind> {
        self.nodes.get(&NodeName::from(name)).map(|node| node.kind())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_connected(&self, from: &str, to: &str) -> bool {
        self.edges.contains(&Edge {
            from: NodeName::from(from),
            to: NodeName::from(to),
        })
    }

    /// Names of the nodes `name` feeds into
    pub fn outputs_of(&self, name: &str) -> Vec<NodeName> {
        self.edges
            .iter()
            .filter(|edge| edge.from.as_str() == name)
            .map(|edge| edge.to.clone())
            .collect()
    }

    /// Names of the nodes feeding into `name`
    pub fn inputs_of(&self, name: &str) -> Vec<NodeName> {
        self.edges
            .iter()
            .filter(|edge| edge.to.as_str() == name)
            .map(|edge| edge.from.clone())
            .collect()
    }

    /// Create a metering tap reporting per-channel levels to `on_levels`
    pub fn create_metering_tap(on_levels: impl FnMut(&[f32]) + Send + 'static) -> MeteringTap {
        MeteringTap::new(METER_WINDOW, on_levels)
    }

    /// Create a pass-through gate and the control toggling it
    pub fn create_pass_through_gate(enabled: bool) -> (PassThroughGate, GateControl) {
        let control = GateControl::new(enabled);
        (PassThroughGate::new(control.clone()), control)
    }

    /// Render one block of `frames` frames through every node
    pub fn render(&mut self, frames: usize) -> RenderedBlock {
        let channels = self.config.channels.count() as usize;
        let order = match self.order.take() {
            Some(order) => order,
            None => self.topological_order(),
        };

        let mut outputs: HashMap<NodeName, AudioBuffer> = HashMap::with_capacity(order.len());
        let mut input = AudioBuffer::new(channels, frames);
        let mut playback = AudioBuffer::new(channels, frames);
        let mut capture = AudioBuffer::new(channels, frames);

        for name in &order {
            input.silence();
            for edge in self.edges.iter().filter(|edge| &edge.to == name) {
                if let Some(upstream) = outputs.get(&edge.from) {
                    input.mix_from(upstream);
                }
            }

            let Some(node) = self.nodes.get_mut(name) else {
                continue;
            };
            let mut output = AudioBuffer::new(channels, frames);
            node.process(&input, &mut output);

            match name.as_str() {
                PLAYBACK_SINK => playback = output,
                CAPTURE_SINK => capture = output,
                _ => {
                    outputs.insert(name.clone(), output);
                }
            }
        }

        self.order = Some(order);
        RenderedBlock { playback, capture }
    }

    fn kind_of(&self, name: &NodeName) -> Result<NodeKind> {
        self.nodes
            .get(name)
            .map(|node| node.kind())
            .ok_or_else(|| GraphError::UnknownNode(name.to_string()))
    }

    fn remove_edges_of(&mut self, name: &NodeName) {
        self.edges.retain(|edge| &edge.from != name && &edge.to != name);
    }

    /// Whether `target` is reachable from `start` along existing edges
    fn reaches(&self, start: &NodeName, target: &NodeName) -> bool {
        let mut stack = vec![start];
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            stack.extend(
                self.edges
                    .iter()
                    .filter(|edge| &edge.from == current)
                    .map(|edge| &edge.to),
            );
        }
        false
    }

    /// Kahn's algorithm. Ties are broken by name so renders are deterministic.
    fn topological_order(&self) -> Vec<NodeName> {
        let mut in_degree: HashMap<&NodeName, usize> =
            self.nodes.keys().map(|name| (name, 0)).collect();
        for edge in &self.edges {
            if let Some(degree) = in_degree.get_mut(&edge.to) {
                *degree += 1;
            }
        }

        let mut ready: Vec<&NodeName> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();
        ready.sort();
        let mut queue: VecDeque<&NodeName> = ready.into();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(name) = queue.pop_front() {
            order.push(name.clone());
            for edge in self.edges.iter().filter(|edge| &edge.from == name) {
                if let Some(degree) = in_degree.get_mut(&edge.to) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(&edge.to);
                    }
                }
            }
        }
        order
    }
}

impl fmt::Debug for RoutingGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingGraph")
            .field("config", &self.config)
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edges)
            .finish()
    }
}
