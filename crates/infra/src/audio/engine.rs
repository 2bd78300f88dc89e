//! Render drivers for the routing graph
//!
//! The graph only produces audio when something pulls blocks out of it.
//! [`PlaybackEngine`] pulls from the default output device's callback, so
//! the speaker mix is heard and the capture stream advances in real time.
//! [`RenderClock`] pulls on a timer for machines without an output device.

use crossbeam::channel::{bounded, Sender};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use roomcast_core::domain::audio::{AudioBuffer, AudioError, Result};
use roomcast_core::domain::graph::{lock_graph, SharedGraph};
use std::sync::TryLockError;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Renders the graph into the default output device
pub struct PlaybackEngine {
    device_name: String,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PlaybackEngine {
    /// Open the default output device at the graph's sample rate and start
    /// rendering. Blocks until the stream is running or has failed.
    pub fn start(graph: SharedGraph) -> Result<Self> {
        let (ready_tx, ready_rx) = bounded(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let thread = std::thread::Builder::new()
            .name("roomcast-playback".to_string())
            .spawn(move || {
                let stream = match build_output_stream(graph) {
                    Ok((stream, name)) => {
                        let _ = ready_tx.send(Ok(name));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Playback thread finished");
            })
            .map_err(|e| AudioError::OsError(e.to_string()))?;

        let device_name = ready_rx
            .recv()
            .map_err(|_| AudioError::StreamError("Playback thread exited".to_string()))??;
        info!(device = %device_name, "Playback started");

        Ok(Self {
            device_name,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
            info!(device = %self.device_name, "Playback stopped");
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Playback thread panicked");
            }
        }
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_output_stream(graph: SharedGraph) -> Result<(cpal::Stream, String)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()))?;
    #[allow(deprecated)]
    let name = device
        .name()
        .unwrap_or_else(|_| "Unknown Device".to_string());

    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::InvalidConfiguration(e.to_string()))?;
    if supported.sample_format() != cpal::SampleFormat::F32 {
        return Err(AudioError::InvalidConfiguration(format!(
            "Unsupported output sample format {:?}",
            supported.sample_format()
        )));
    }

    let sample_rate = lock_graph(&graph).config().sample_rate.hz();
    let channels = supported.channels();
    let config = cpal::StreamConfig {
        channels,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };
    let channels = channels as usize;

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let guard = match graph.try_lock() {
                    Ok(guard) => Some(guard),
                    Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
                    // Never wait on the audio thread
                    Err(TryLockError::WouldBlock) => None,
                };
                match guard {
                    Some(mut graph) => {
                        let block = graph.render(data.len() / channels.max(1));
                        write_interleaved(&block.playback, data, channels);
                    }
                    None => data.fill(0.0),
                }
            },
            |err| error!("Output stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::StreamError(format!("Failed to build stream: {}", e)))?;

    stream
        .play()
        .map_err(|e| AudioError::StreamError(format!("Failed to start stream: {}", e)))?;
    Ok((stream, name))
}

/// Interleave `block` into a device buffer with `channels` channels. A mono
/// block feeds every device channel; extra device channels stay silent.
fn write_interleaved(block: &AudioBuffer, data: &mut [f32], channels: usize) {
    data.fill(0.0);
    if block.channel_count() == 0 || channels == 0 {
        return;
    }
    for (n, frame) in data.chunks_mut(channels).enumerate().take(block.frames()) {
        for (ch, slot) in frame.iter_mut().enumerate() {
            let source = if block.channel_count() == 1 { 0 } else { ch };
            if source < block.channel_count() {
                *slot = block.channel(source)[n];
            }
        }
    }
}

/// Renders the graph on a timer at the graph's own block rate
pub struct RenderClock {
    task: tokio::task::JoinHandle<()>,
}

impl RenderClock {
    pub fn start(graph: SharedGraph) -> Self {
        let config = *lock_graph(&graph).config();
        let frames = config.buffer_size.max(1) as usize;
        let period = Duration::from_secs_f64(frames as f64 / config.sample_rate.hz().max(1) as f64);
        debug!(?period, frames, "Render clock started");

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                lock_graph(&graph).render(frames);
            }
        });
        Self { task }
    }
}

impl Drop for RenderClock {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomcast_core::domain::audio::StreamConfig;
    use roomcast_core::domain::graph::RoutingGraph;

    #[test]
    fn test_interleave_stereo() {
        let block = AudioBuffer::from_channels(vec![vec![1.0, 2.0], vec![-1.0, -2.0]]);
        let mut data = vec![9.0; 4];
        write_interleaved(&block, &mut data, 2);
        assert_eq!(data, vec![1.0, -1.0, 2.0, -2.0]);
    }

    #[test]
    fn test_interleave_mono_to_surround() {
        let block = AudioBuffer::from_channels(vec![vec![0.5, 0.25]]);
        let mut data = vec![9.0; 8];
        write_interleaved(&block, &mut data, 4);
        assert_eq!(data, vec![0.5, 0.5, 0.5, 0.5, 0.25, 0.25, 0.25, 0.25]);
    }

    #[test]
    fn test_interleave_stereo_to_surround_leaves_extra_silent() {
        let block = AudioBuffer::from_channels(vec![vec![1.0], vec![2.0]]);
        let mut data = vec![9.0; 4];
        write_interleaved(&block, &mut data, 4);
        assert_eq!(data, vec![1.0, 2.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_render_clock_advances_capture() {
        let graph = RoutingGraph::new(StreamConfig::default()).into_shared();
        let capture = lock_graph(&graph).capture_stream();

        let clock = RenderClock::start(graph.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;
        drop(clock);

        assert!(capture.pending() > 0);
    }
}
