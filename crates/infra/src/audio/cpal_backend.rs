//! CPAL-based capture backend and device enumeration
//!
//! cpal streams are not `Send` on every platform, so each open stream lives
//! on its own thread for as long as it runs. Captured audio crosses to the
//! graph over a bounded crossbeam channel.

use super::resample::Resampler;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam::channel::{bounded, Receiver, Sender};
use roomcast_core::domain::audio::{
    AudioBackend, AudioBuffer, AudioError, CapturedInput, ChannelCount, DeviceId, DeviceInfo,
    DeviceType, InputDevice, Result, SampleRate, SampleSource, StreamConfig,
};
use std::collections::VecDeque;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Captured chunks buffered between the device callback and the graph
const CAPTURE_QUEUE_CHUNKS: usize = 32;

/// Audio backend on the default cpal host
#[derive(Debug, Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AudioBackend for CpalBackend {
    async fn open_microphone(&self, config: &StreamConfig) -> Result<CapturedInput> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (chunk_tx, chunk_rx) = bounded(CAPTURE_QUEUE_CHUNKS);

        let thread = std::thread::Builder::new()
            .name("roomcast-capture".to_string())
            .spawn(move || run_capture(chunk_tx, stop_rx, ready_tx))
            .map_err(|e| AudioError::OsError(e.to_string()))?;

        let format = ready_rx
            .await
            .map_err(|_| AudioError::StreamError("Capture thread exited".to_string()))??;

        info!(
            device = %format.name,
            rate = format.sample_rate,
            channels = format.channels,
            "Capture started"
        );

        Ok(CapturedInput {
            source: Box::new(CpalInputReader::new(chunk_rx, &format, config)),
            device: Box::new(CpalInputDevice {
                name: format.name,
                stop: Some(stop_tx),
                thread: Some(thread),
            }),
        })
    }
}

/// What the capture device actually delivers
struct CaptureFormat {
    name: String,
    sample_rate: u32,
    channels: usize,
}

fn run_capture(
    chunks: Sender<Vec<f32>>,
    stop: Receiver<()>,
    ready: oneshot::Sender<Result<CaptureFormat>>,
) {
    let stream = match build_input_stream(chunks) {
        Ok((stream, format)) => {
            let _ = ready.send(Ok(format));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    // Blocks until the device handle is stopped or dropped
    let _ = stop.recv();
    drop(stream);
    debug!("Capture thread finished");
}

fn build_input_stream(chunks: Sender<Vec<f32>>) -> Result<(cpal::Stream, CaptureFormat)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string()))?;
    #[allow(deprecated)]
    let name = device
        .name()
        .unwrap_or_else(|_| "Unknown Device".to_string());

    let supported = device
        .default_input_config()
        .map_err(|e| AudioError::InvalidConfiguration(e.to_string()))?;
    let format = CaptureFormat {
        name,
        sample_rate: supported.sample_rate(),
        channels: supported.channels() as usize,
    };
    let config = supported.config();
    let on_error = |err: cpal::StreamError| error!("Input stream error: {}", err);

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let _ = chunks.try_send(data.to_vec());
            },
            on_error,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let chunk = data.iter().map(|s| f32::from(*s) / 32768.0).collect();
                let _ = chunks.try_send(chunk);
            },
            on_error,
            None,
        ),
        other => {
            return Err(AudioError::InvalidConfiguration(format!(
                "Unsupported capture sample format {other:?}"
            )))
        }
    }
    .map_err(|e| AudioError::StreamError(format!("Failed to build stream: {}", e)))?;

    stream
        .play()
        .map_err(|e| AudioError::StreamError(format!("Failed to start stream: {}", e)))?;
    Ok((stream, format))
}

/// Handle that stops the capture thread
pub struct CpalInputDevice {
    name: String,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl InputDevice for CpalInputDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CpalInputDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Graph source fed by the capture thread: deinterleaves, converts to the
/// graph rate and re-blocks
pub struct CpalInputReader {
    chunks: Receiver<Vec<f32>>,
    device_channels: usize,
    resampler: Resampler,
    pending: Vec<VecDeque<f32>>,
    scratch: Vec<Vec<f32>>,
}

impl CpalInputReader {
    fn new(chunks: Receiver<Vec<f32>>, format: &CaptureFormat, target: &StreamConfig) -> Self {
        let channels = format.channels.max(1);
        Self {
            chunks,
            device_channels: channels,
            resampler: Resampler::new(format.sample_rate, target.sample_rate.hz(), channels),
            pending: vec![VecDeque::new(); channels],
            scratch: vec![Vec::new(); channels],
        }
    }

    fn drain(&mut self) {
        while let Ok(chunk) = self.chunks.try_recv() {
            let split = AudioBuffer::from_interleaved(&chunk, self.device_channels);
            let planar: Vec<Vec<f32>> = split.channels().map(<[f32]>::to_vec).collect();
            for channel in &mut self.scratch {
                channel.clear();
            }
            self.resampler.process(&planar, &mut self.scratch);
            for (pending, converted) in self.pending.iter_mut().zip(&self.scratch) {
                pending.extend(converted.iter().copied());
            }
        }
    }
}

impl SampleSource for CpalInputReader {
    fn fill(&mut self, out: &mut AudioBuffer) {
        self.drain();
        let available = self.pending[0].len().min(out.frames());
        for ch in 0..out.channel_count() {
            let source = ch.min(self.device_channels - 1);
            let dest = out.channel_mut(ch);
            for (slot, sample) in dest.iter_mut().zip(self.pending[source].iter()) {
                *slot = *sample;
            }
            dest[available..].fill(0.0);
        }
        for pending in &mut self.pending {
            pending.drain(..available.min(pending.len()));
        }
    }
}

/// Enumerate the input and output devices of the default host
pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    info!("Enumerating all audio devices");
    let host = cpal::default_host();
    debug!("Using audio host: {:?}", host.id());

    let mut devices = Vec::new();
    let cpal_devices = host
        .devices()
        .map_err(|e| AudioError::OsError(e.to_string()))?;

    for device in cpal_devices {
        #[allow(deprecated)]
        let name = device
            .name()
            .unwrap_or_else(|_| "Unknown Device".to_string());

        if let Ok(config) = device.default_input_config() {
            devices.push(device_info(&name, DeviceType::Input, &config));
        }
        if let Ok(config) = device.default_output_config() {
            devices.push(device_info(&name, DeviceType::Output, &config));
        }
    }

    info!("Found {} audio devices", devices.len());
    Ok(devices)
}

fn device_info(name: &str, device_type: DeviceType, config: &cpal::SupportedStreamConfig) -> DeviceInfo {
    DeviceInfo {
        id: DeviceId::new(name.to_string()),
        name: name.to_string(),
        device_type,
        default_sample_rate: Some(SampleRate::from_hz(config.sample_rate())),
        default_channels: Some(ChannelCount::from_count(config.channels())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(rate: u32, channels: usize) -> (Sender<Vec<f32>>, CpalInputReader) {
        let (tx, rx) = bounded(8);
        let format = CaptureFormat {
            name: "test".to_string(),
            sample_rate: rate,
            channels,
        };
        (tx, CpalInputReader::new(rx, &format, &StreamConfig::default()))
    }

    #[test]
    fn test_mono_capture_fills_both_channels() {
        let (tx, mut reader) = reader(48000, 1);
        tx.send(vec![0.1, 0.2, 0.3]).unwrap();

        let mut out = AudioBuffer::new(2, 4);
        reader.fill(&mut out);
        assert_eq!(out.channel(0), &[0.1, 0.2, 0.3, 0.0]);
        assert_eq!(out.channel(1), &[0.1, 0.2, 0.3, 0.0]);
    }

    #[test]
    fn test_reader_reblocks_interleaved_chunks() {
        let (tx, mut reader) = reader(48000, 2);
        tx.send(vec![1.0, -1.0, 2.0, -2.0, 3.0, -3.0]).unwrap();

        let mut out = AudioBuffer::new(2, 2);
        reader.fill(&mut out);
        assert_eq!(out.channel(0), &[1.0, 2.0]);
        assert_eq!(out.channel(1), &[-1.0, -2.0]);

        reader.fill(&mut out);
        assert_eq!(out.channel(0), &[3.0, 0.0]);
        assert_eq!(out.channel(1), &[-3.0, 0.0]);
    }

    #[test]
    fn test_reader_converts_rate() {
        let (tx, mut reader) = reader(24000, 1);
        tx.send(vec![0.5; 100]).unwrap();

        let mut out = AudioBuffer::new(1, 256);
        reader.fill(&mut out);
        let filled = out.channel(0).iter().filter(|s| **s != 0.0).count();
        assert!((196..=200).contains(&filled));
    }

    #[test]
    fn test_enumerate_devices() {
        match list_devices() {
            Ok(devices) => {
                for device in &devices {
                    assert!(!device.name.is_empty());
                }
            }
            Err(e) => {
                // On CI or headless systems, there might not be audio devices
                eprintln!("Skipping test: {}", e);
            }
        }
    }
}
