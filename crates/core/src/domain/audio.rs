//! Audio buffers, media streams and the platform boundaries of the audio subsystem
//!
//! The routing graph works on planar `f32` blocks. Capturing from hardware and
//! decoding files happen behind the traits defined here; implementations for
//! cpal and symphonia live in the `infra` crate.

use async_trait::async_trait;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur in the audio subsystem
#[derive(Debug, Error)]
pub enum AudioError {
    /// Requested audio device was not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Error in audio stream creation or processing
    #[error("Stream error: {0}")]
    StreamError(String),

    /// A media file could not be read or decoded
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Invalid configuration for audio device
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Input/Output error at the OS level
    #[error("OS error: {0}")]
    OsError(String),
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// Unique identifier for an audio device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Audio sample rate in Hz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleRate {
    Hz44100,
    Hz48000,
    Hz96000,
    Custom(u32),
}

impl SampleRate {
    pub fn hz(&self) -> u32 {
        match self {
            SampleRate::Hz44100 => 44100,
            SampleRate::Hz48000 => 48000,
            SampleRate::Hz96000 => 96000,
            SampleRate::Custom(hz) => *hz,
        }
    }

    pub fn from_hz(hz: u32) -> Self {
        match hz {
            44100 => SampleRate::Hz44100,
            48000 => SampleRate::Hz48000,
            96000 => SampleRate::Hz96000,
            hz => SampleRate::Custom(hz),
        }
    }
}

/// Number of audio channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelCount {
    Mono,
    Stereo,
    Surround(u16),
}

impl ChannelCount {
    pub fn count(&self) -> u16 {
        match self {
            ChannelCount::Mono => 1,
            ChannelCount::Stereo => 2,
            ChannelCount::Surround(n) => *n,
        }
    }

    pub fn from_count(count: u16) -> Self {
        match count {
            1 => ChannelCount::Mono,
            2 => ChannelCount::Stereo,
            n => ChannelCount::Surround(n),
        }
    }
}

/// Configuration shared by the routing graph and every stream feeding it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub sample_rate: SampleRate,
    pub channels: ChannelCount,
    /// Frames rendered per graph block
    pub buffer_size: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: SampleRate::Hz48000,
            channels: ChannelCount::Stereo,
            buffer_size: 512,
        }
    }
}

/// Type of audio device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    Input,
    Output,
}

/// Information about an audio device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub device_type: DeviceType,
    pub default_sample_rate: Option<SampleRate>,
    pub default_channels: Option<ChannelCount>,
}

/// A block of planar audio: one `Vec<f32>` per channel, all of equal length
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    /// Create a silent buffer
    pub fn new(channels: usize, frames: usize) -> Self {
        Self {
            channels: vec![vec![0.0; frames]; channels],
        }
    }

    /// Wrap existing planar data. Shorter channels are padded with silence.
    pub fn from_channels(mut channels: Vec<Vec<f32>>) -> Self {
        let frames = channels.iter().map(Vec::len).max().unwrap_or(0);
        for channel in &mut channels {
            channel.resize(frames, 0.0);
        }
        Self { channels }
    }

    /// Split interleaved samples into planar channels
    pub fn from_interleaved(samples: &[f32], channels: usize) -> Self {
        let channels = channels.max(1);
        let frames = samples.len() / channels;
        let mut buffer = Self::new(channels, frames);
        for (frame, chunk) in samples.chunks_exact(channels).enumerate() {
            for (ch, sample) in chunk.iter().enumerate() {
                buffer.channels[ch][frame] = *sample;
            }
        }
        buffer
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        &mut self.channels[index]
    }

    pub fn channels(&self) -> impl Iterator<Item = &[f32]> {
        self.channels.iter().map(Vec::as_slice)
    }

    pub fn same_shape(&self, other: &AudioBuffer) -> bool {
        self.channel_count() == other.channel_count() && self.frames() == other.frames()
    }

    /// Zero every sample
    pub fn silence(&mut self) {
        for channel in &mut self.channels {
            channel.fill(0.0);
        }
    }

    pub fn is_silent(&self) -> bool {
        self.channels.iter().flatten().all(|s| *s == 0.0)
    }

    /// Overwrite with `other`. Where shapes differ, the overlap is copied and
    /// the remainder is silenced. Missing source channels repeat the last one.
    pub fn copy_from(&mut self, other: &AudioBuffer) {
        if other.channel_count() == 0 {
            self.silence();
            return;
        }
        let frames = self.frames().min(other.frames());
        for (ch, channel) in self.channels.iter_mut().enumerate() {
            let source = &other.channels[ch.min(other.channel_count() - 1)];
            channel[..frames].copy_from_slice(&source[..frames]);
            channel[frames..].fill(0.0);
        }
    }

    /// Sum `other` into this buffer over the overlapping region
    pub fn mix_from(&mut self, other: &AudioBuffer) {
        if other.channel_count() == 0 {
            return;
        }
        let frames = self.frames().min(other.frames());
        for (ch, channel) in self.channels.iter_mut().enumerate() {
            let source = &other.channels[ch.min(other.channel_count() - 1)];
            for (out, sample) in channel[..frames].iter_mut().zip(&source[..frames]) {
                *out += *sample;
            }
        }
    }

    /// Multiply every sample by `gain`
    pub fn scale(&mut self, gain: f32) {
        for sample in self.channels.iter_mut().flatten() {
            *sample *= gain;
        }
    }

    /// Interleave into a single vector (frame-major)
    pub fn interleaved(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.frames() * self.channel_count());
        for frame in 0..self.frames() {
            for channel in &self.channels {
                out.push(channel[frame]);
            }
        }
        out
    }
}

/// Anything that can fill a planar block with samples on demand
///
/// Called from the render path: implementations must not block.
pub trait SampleSource: Send {
    fn fill(&mut self, out: &mut AudioBuffer);
}

/// Handle to a live capture device
pub trait InputDevice: Send {
    fn name(&self) -> &str;

    /// Release the device. Called once when the owning producer switches off.
    fn stop(&mut self);
}

/// Result of acquiring a capture device: its samples and its release handle
pub struct CapturedInput {
    pub source: Box<dyn SampleSource>,
    pub device: Box<dyn InputDevice>,
}

impl fmt::Debug for CapturedInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedInput")
            .field("device", &self.device.name())
            .finish()
    }
}

/// Platform capture access
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Acquire the default capture device. May prompt the user on some platforms.
    async fn open_microphone(&self, config: &StreamConfig) -> Result<CapturedInput>;
}

/// Planar PCM decoded from a media file
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Embedded cover art
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverImage {
    pub media_type: String,
    pub data: Vec<u8>,
}

/// Tags read from a media file. Every field is optional in the file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SongMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub duration_seconds: Option<f64>,
    pub cover: Option<CoverImage>,
}

/// Reads tags from and decodes local media files
#[async_trait]
pub trait MediaLibrary: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<SongMetadata>;

    /// Decode the whole file, resampled to `target.sample_rate`
    async fn decode(&self, path: &Path, target: &StreamConfig) -> Result<DecodedAudio>;
}

/// A live stream of audio blocks that can be handed to the media layer or
/// read back into a graph
///
/// Clones share the same underlying channel, so each block is delivered to
/// exactly one reader.
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    config: StreamConfig,
    frames: Receiver<AudioBuffer>,
}

impl MediaStream {
    /// Create a stream and the writer feeding it. `capacity` is in blocks;
    /// writers drop blocks when readers fall behind.
    pub fn channel(
        id: impl Into<String>,
        config: StreamConfig,
        capacity: usize,
    ) -> (MediaStreamWriter, MediaStream) {
        let (tx, rx) = bounded(capacity.max(1));
        let id = id.into();
        (
            MediaStreamWriter {
                id: id.clone(),
                tx,
            },
            MediaStream {
                id,
                config,
                frames: rx,
            },
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Take the next pending block, if any
    pub fn try_next(&self) -> Option<AudioBuffer> {
        self.frames.try_recv().ok()
    }

    /// Number of blocks waiting to be read
    pub fn pending(&self) -> usize {
        self.frames.len()
    }

    /// Wrap this stream as a graph source
    pub fn reader(&self) -> MediaStreamReader {
        MediaStreamReader {
            stream: self.clone(),
            carry: None,
            offset: 0,
        }
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("pending", &self.frames.len())
            .finish()
    }
}

/// Producer side of a [`MediaStream`]
#[derive(Clone)]
pub struct MediaStreamWriter {
    id: String,
    tx: Sender<AudioBuffer>,
}

impl MediaStreamWriter {
    /// Push a block without blocking. Returns false when the block was dropped.
    pub fn push(&self, block: AudioBuffer) -> bool {
        match self.tx.try_send(block) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::trace!(stream = %self.id, "stream full, dropping block");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// [`SampleSource`] draining a [`MediaStream`], re-blocking as needed
pub struct MediaStreamReader {
    stream: MediaStream,
    carry: Option<AudioBuffer>,
    offset: usize,
}

impl SampleSource for MediaStreamReader {
    fn fill(&mut self, out: &mut AudioBuffer) {
        let frames = out.frames();
        let mut written = 0;
        while written < frames {
            if self.carry.is_none() {
                self.carry = self.stream.try_next();
                self.offset = 0;
            }
            let Some(block) = self.carry.as_ref() else {
                break;
            };
            let available = block.frames().saturating_sub(self.offset);
            let take = available.min(frames - written);
            if block.channel_count() > 0 {
                for ch in 0..out.channel_count() {
                    let source = block.channel(ch.min(block.channel_count() - 1));
                    out.channel_mut(ch)[written..written + take]
                        .copy_from_slice(&source[self.offset..self.offset + take]);
                }
            }
            written += take;
            self.offset += take;
            if self.offset >= block.frames() {
                self.carry = None;
            }
        }
        for ch in 0..out.channel_count() {
            out.channel_mut(ch)[written..].fill(0.0);
        }
    }
}
