//! Microphone producer
//!
//! Node chain, per instance:
//!
//! ```text
//! source -> gain -> meter -> [stream]
//!              \-> gate  -> [speaker]
//! ```
//!
//! The gain, meter and gate exist from construction. The source node exists
//! only while the device is switched on.

use super::{ProducerId, Result};
use crate::domain::audio::{AudioBackend, InputDevice};
use crate::domain::config::MicrophoneConfig;
use crate::domain::graph::{
    lock_graph, GainControl, GainNode, GateControl, NodeName, RoutingGraph, SharedGraph,
    SourceNode, CAPTURE_SINK, PLAYBACK_SINK,
};
use crate::domain::state::StatePublisher;
use crate::domain::throttle::Throttle;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Published microphone state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MicrophoneState {
    pub initialized: bool,
    pub on: bool,
    pub volume: f32,
    pub muted: bool,
    pub play_through: bool,
    /// Latest per-channel level on the 0..100 scale, while on
    pub channel_volume: Vec<f32>,
}

struct MicrophoneNodes {
    gain: GainControl,
    gate: GateControl,
}

/// Captures the default input device into the room
pub struct Microphone {
    id: ProducerId,
    graph: SharedGraph,
    backend: Arc<dyn AudioBackend>,
    level_refresh: Duration,
    state: Arc<StatePublisher<MicrophoneState>>,
    nodes: Option<MicrophoneNodes>,
    device: Option<Box<dyn InputDevice>>,
}

impl Microphone {
    /// Create the producer and wire its processing chain into `graph`
    pub fn new(
        graph: SharedGraph,
        backend: Arc<dyn AudioBackend>,
        config: &MicrophoneConfig,
        level_refresh: Duration,
    ) -> Result<Self> {
        let mut microphone = Self {
            id: ProducerId::next("microphone"),
            graph,
            backend,
            level_refresh,
            state: Arc::new(StatePublisher::new(MicrophoneState {
                initialized: false,
                on: false,
                volume: config.volume,
                muted: false,
                play_through: config.play_through,
                channel_volume: Vec::new(),
            })),
            nodes: None,
            device: None,
        };
        microphone.setup()?;
        Ok(microphone)
    }

    pub fn id(&self) -> &ProducerId {
        &self.id
    }

    pub fn state(&self) -> MicrophoneState {
        self.state.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<MicrophoneState> {
        self.state.subscribe()
    }

    pub fn source_node(&self) -> NodeName {
        self.id.node("source")
    }

    pub fn gain_node(&self) -> NodeName {
        self.id.node("gain")
    }

    pub fn meter_node(&self) -> NodeName {
        self.id.node("meter")
    }

    pub fn gate_node(&self) -> NodeName {
        self.id.node("gate")
    }

    fn setup(&mut self) -> Result<()> {
        let current = self.state.snapshot();
        let gain = GainControl::new(if current.muted { 0.0 } else { current.volume });

        let state = self.state.clone();
        let mut throttle = Throttle::new(self.level_refresh);
        let meter = RoutingGraph::create_metering_tap(move |levels| {
            if throttle.ready() {
                state.update(|s| {
                    if s.on {
                        s.channel_volume = levels.to_vec();
                    }
                });
            }
        });
        let (gate, gate_control) = RoutingGraph::create_pass_through_gate(current.play_through);

        {
            let mut graph = lock_graph(&self.graph);
            graph.set_node(self.gain_node(), Box::new(GainNode::new(gain.clone())))?;
            graph.set_node(self.meter_node(), Box::new(meter))?;
            graph.set_node(self.gate_node(), Box::new(gate))?;
            graph.connect(self.gain_node(), self.meter_node())?;
            graph.connect(self.meter_node(), CAPTURE_SINK)?;
            graph.connect(self.gain_node(), self.gate_node())?;
            graph.connect(self.gate_node(), PLAYBACK_SINK)?;
        }

        self.nodes = Some(MicrophoneNodes {
            gain,
            gate: gate_control,
        });
        self.state.update(|s| s.initialized = true);
        debug!(producer = %self.id, "Microphone chain ready");
        Ok(())
    }

    /// Acquire the capture device and start feeding the chain
    #[instrument(skip(self), fields(producer = %self.id))]
    pub async fn switch_on(&mut self) -> Result<()> {
        if self.device.is_some() {
            return Ok(());
        }
        if self.nodes.is_none() {
            self.setup()?;
        }

        let config = *lock_graph(&self.graph).config();
        let input = self.backend.open_microphone(&config).await?;

        {
            let mut graph = lock_graph(&self.graph);
            graph.set_node(self.source_node(), Box::new(SourceNode::new(input.source)))?;
            graph.connect(self.source_node(), self.gain_node())?;
        }
        info!(device = input.device.name(), "Microphone on");
        self.device = Some(input.device);
        self.state.update(|s| s.on = true);
        Ok(())
    }

    /// Release the device and remove every node of the chain
    #[instrument(skip(self), fields(producer = %self.id))]
    pub fn switch_off(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.stop();
            info!(device = device.name(), "Microphone off");
        }
        self.teardown();
        self.state.update(|s| {
            s.on = false;
            s.initialized = false;
            s.channel_volume.clear();
        });
    }

    fn teardown(&mut self) {
        let mut graph = lock_graph(&self.graph);
        for node in [
            self.source_node(),
            self.gain_node(),
            self.meter_node(),
            self.gate_node(),
        ] {
            graph.discard(node.as_str());
        }
        self.nodes = None;
    }

    pub fn is_on(&self) -> bool {
        self.device.is_some()
    }

    /// Switch off when on, on when off. Returns the new state.
    pub async fn toggle_on(&mut self) -> Result<bool> {
        if self.is_on() {
            self.switch_off();
        } else {
            self.switch_on().await?;
        }
        Ok(self.is_on())
    }

    pub fn set_volume(&mut self, volume: f32) {
        let volume = volume.max(0.0);
        self.state.update(|s| s.volume = volume);
        self.apply_gain();
    }

    pub fn mute(&mut self) {
        self.state.update(|s| s.muted = true);
        self.apply_gain();
    }

    pub fn unmute(&mut self) {
        self.state.update(|s| s.muted = false);
        self.apply_gain();
    }

    pub fn toggle_mute(&mut self) -> bool {
        let muted = !self.state.read(|s| s.muted);
        if muted {
            self.mute();
        } else {
            self.unmute();
        }
        muted
    }

    pub fn set_play_through(&mut self, enabled: bool) {
        self.state.update(|s| s.play_through = enabled);
        if let Some(nodes) = &self.nodes {
            nodes.gate.set(enabled);
        }
    }

    pub fn toggle_play_through(&mut self) -> bool {
        let enabled = !self.state.read(|s| s.play_through);
        self.set_play_through(enabled);
        enabled
    }

    fn apply_gain(&self) {
        let (volume, muted) = self.state.read(|s| (s.volume, s.muted));
        if let Some(nodes) = &self.nodes {
            nodes.gain.set(if muted { 0.0 } else { volume });
        }
    }
}

impl Drop for Microphone {
    fn drop(&mut self) {
        if let Some(mut device) = self.device.take() {
            warn!(producer = %self.id, "Microphone dropped while on");
            device.stop();
        }
        self.teardown();
    }
}
