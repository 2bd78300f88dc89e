//! Shared fixtures: a constant-level capture backend and WAV writers

use async_trait::async_trait;
use roomcast_core::domain::audio::{
    AudioBackend, AudioBuffer, CapturedInput, InputDevice, Result, SampleSource, StreamConfig,
};
use roomcast_core::domain::protocol::LoopbackBridge;
use roomcast_core::domain::{Collaborators, RoomClient, RoomcastConfig};
use roomcast_infra::media::SymphoniaLibrary;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct Constant(pub f32);

impl SampleSource for Constant {
    fn fill(&mut self, out: &mut AudioBuffer) {
        for ch in 0..out.channel_count() {
            out.channel_mut(ch).fill(self.0);
        }
    }
}

struct Device(Arc<AtomicBool>);

impl InputDevice for Device {
    fn name(&self) -> &str {
        "test input"
    }

    fn stop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Microphone that always hears `level`
pub struct ConstantMic {
    pub level: f32,
    pub released: Arc<AtomicBool>,
}

impl ConstantMic {
    pub fn new(level: f32) -> Self {
        Self {
            level,
            released: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl AudioBackend for ConstantMic {
    async fn open_microphone(&self, _config: &StreamConfig) -> Result<CapturedInput> {
        self.released.store(false, Ordering::SeqCst);
        Ok(CapturedInput {
            source: Box::new(Constant(self.level)),
            device: Box::new(Device(self.released.clone())),
        })
    }
}

/// Client wired to an in-process bridge, a constant microphone and the
/// real media decoder
pub fn client(owner: bool, mic: Arc<ConstantMic>) -> (RoomClient, Arc<LoopbackBridge>) {
    let mut config = RoomcastConfig::factory_default();
    config.room.owner = owner;
    config.app.request_timeout_secs = 5;
    let bridge = Arc::new(LoopbackBridge::new(config.app.stream_config()));
    if !owner {
        bridge.add_room(config.room.id, Vec::new());
    }
    let client = RoomClient::new(
        config,
        Collaborators {
            transport: bridge.clone(),
            negotiator: bridge.clone(),
            audio: mic,
            media: Arc::new(SymphoniaLibrary::new()),
        },
    )
    .unwrap();
    (client, bridge)
}

/// Mono 16-bit WAV holding `seconds` of a constant `level`
pub fn write_constant_wav(path: &Path, rate: u32, seconds: f32, level: f32) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    let sample = (level * 32768.0) as i16;
    for _ in 0..(rate as f32 * seconds) as usize {
        writer.write_sample(sample).unwrap();
    }
    writer.finalize().unwrap();
}
