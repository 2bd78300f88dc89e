//! Basic graph nodes: sources, gain stages, the pass-through gate and the sinks

use super::{AudioNode, NodeKind};
use crate::domain::audio::{AudioBuffer, MediaStreamWriter, SampleSource};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Shared, lock-free gain value. Clones control the same node.
#[derive(Debug, Clone)]
pub struct GainControl(Arc<AtomicU32>);

impl GainControl {
    pub fn new(gain: f32) -> Self {
        Self(Arc::new(AtomicU32::new(gain.to_bits())))
    }

    pub fn set(&self, gain: f32) {
        self.0.store(gain.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Multiplies its input by a [`GainControl`]
pub struct GainNode {
    gain: GainControl,
}

impl GainNode {
    pub fn new(gain: GainControl) -> Self {
        Self { gain }
    }
}

impl AudioNode for GainNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Gain
    }

    fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) {
        output.copy_from(input);
        output.scale(self.gain.get());
    }
}

/// Shared open/closed flag for a [`PassThroughGate`]
#[derive(Debug, Clone)]
pub struct GateControl(Arc<AtomicBool>);

impl GateControl {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Emits its input unchanged while enabled and exact silence otherwise
pub struct PassThroughGate {
    control: GateControl,
}

impl PassThroughGate {
    pub fn new(control: GateControl) -> Self {
        Self { control }
    }
}

impl AudioNode for PassThroughGate {
    fn kind(&self) -> NodeKind {
        NodeKind::PassThroughGate
    }

    fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) {
        if self.control.is_enabled() {
            output.copy_from(input);
        } else {
            output.silence();
        }
    }
}

/// Adapts any [`SampleSource`] into a graph node with no inputs
pub struct SourceNode<S> {
    source: S,
}

impl<S: SampleSource> SourceNode<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

impl<S: SampleSource> AudioNode for SourceNode<S> {
    fn kind(&self) -> NodeKind {
        NodeKind::Source
    }

    fn process(&mut self, _input: &AudioBuffer, output: &mut AudioBuffer) {
        self.source.fill(output);
    }
}

impl SampleSource for Box<dyn SampleSource> {
    fn fill(&mut self, out: &mut AudioBuffer) {
        (**self).fill(out);
    }
}

/// Fixed sink toward the local output device
pub struct PlaybackSink {
    master: GainControl,
}

impl PlaybackSink {
    pub fn new(master: GainControl) -> Self {
        Self { master }
    }
}

impl AudioNode for PlaybackSink {
    fn kind(&self) -> NodeKind {
        NodeKind::PlaybackSink
    }

    fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) {
        output.copy_from(input);
        output.scale(self.master.get());
    }
}

/// Fixed sink toward the outgoing media stream
pub struct CaptureSink {
    writer: MediaStreamWriter,
}

impl CaptureSink {
    pub fn new(writer: MediaStreamWriter) -> Self {
        Self { writer }
    }
}

impl AudioNode for CaptureSink {
    fn kind(&self) -> NodeKind {
        NodeKind::CaptureSink
    }

    fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) {
        output.copy_from(input);
        self.writer.push(output.clone());
    }
}
