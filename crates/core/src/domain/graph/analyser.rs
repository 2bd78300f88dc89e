//! Frequency analyser for the incoming room audio
//!
//! The node sits between the remote stream and the playback sink, forwarding
//! audio untouched while keeping the most recent window of samples. The handle
//! turns that window into byte-scaled magnitudes on demand.

use super::{AudioNode, NodeKind};
use crate::domain::audio::AudioBuffer;
use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Transform size used for the remote stream
pub const FFT_SIZE: usize = 16384;

/// Magnitudes at or below this map to 0
pub const MIN_DECIBELS: f32 = -100.0;

/// Magnitudes at or above this map to 255
pub const MAX_DECIBELS: f32 = -30.0;

/// Pass-through node recording a mono mixdown of the last `size` frames
pub struct AnalyserNode {
    window: Arc<Mutex<VecDeque<f32>>>,
    size: usize,
}

impl AnalyserNode {
    /// Create the node and the handle reading from it
    pub fn new(size: usize) -> (Self, AnalyserHandle) {
        let size = size.max(2);
        let window = Arc::new(Mutex::new(VecDeque::from(vec![0.0; size])));
        let fft = FftPlanner::<f32>::new().plan_fft_forward(size);
        (
            Self {
                window: window.clone(),
                size,
            },
            AnalyserHandle { window, fft, size },
        )
    }
}

impl AudioNode for AnalyserNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Analyser
    }

    fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) {
        output.copy_from(input);

        let channels = input.channel_count().max(1) as f32;
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        for frame in 0..input.frames() {
            let mono = input.channels().map(|ch| ch[frame]).sum::<f32>() / channels;
            if window.len() == self.size {
                window.pop_front();
            }
            window.push_back(mono);
        }
    }
}

/// Reads frequency data from an [`AnalyserNode`]
#[derive(Clone)]
pub struct AnalyserHandle {
    window: Arc<Mutex<VecDeque<f32>>>,
    fft: Arc<dyn Fft<f32>>,
    size: usize,
}

impl AnalyserHandle {
    /// Number of bins returned by [`byte_frequency_data`](Self::byte_frequency_data)
    pub fn frequency_bin_count(&self) -> usize {
        self.size / 2
    }

    /// Blackman-windowed magnitude spectrum scaled to 0..=255 between
    /// [`MIN_DECIBELS`] and [`MAX_DECIBELS`]
    pub fn byte_frequency_data(&self) -> Vec<u8> {
        let mut buffer: Vec<Complex32> = {
            let window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
            window
                .iter()
                .enumerate()
                .map(|(n, sample)| Complex32::new(sample * blackman(n, self.size), 0.0))
                .collect()
        };
        buffer.resize(self.size, Complex32::new(0.0, 0.0));
        self.fft.process(&mut buffer);

        let range = MAX_DECIBELS - MIN_DECIBELS;
        buffer[..self.frequency_bin_count()]
            .iter()
            .map(|bin| {
                let magnitude = bin.norm() / self.size as f32;
                let db = if magnitude > 0.0 {
                    20.0 * magnitude.log10()
                } else {
                    MIN_DECIBELS
                };
                (255.0 * (db - MIN_DECIBELS) / range).clamp(0.0, 255.0) as u8
            })
            .collect()
    }
}

impl fmt::Debug for AnalyserHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyserHandle").field("size", &self.size).finish()
    }
}

fn blackman(n: usize, size: usize) -> f32 {
    let x = 2.0 * PI * n as f32 / size as f32;
    0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
}
