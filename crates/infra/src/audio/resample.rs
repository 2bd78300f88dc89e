//! Sample rate conversion using linear interpolation
//!
//! Works on planar audio and keeps the last input frame between calls, so a
//! stream can be converted chunk by chunk without seams.

use tracing::{debug, info};

/// Streaming linear-interpolation resampler
#[derive(Debug, Clone)]
pub struct Resampler {
    channels: usize,
    /// Input frames advanced per output frame
    step: f64,
    position: f64,
    history: Option<Vec<f32>>,
}

impl Resampler {
    pub fn new(source_rate: u32, target_rate: u32, channels: usize) -> Self {
        if source_rate == target_rate || source_rate == 0 || target_rate == 0 {
            debug!(
                "Source and target rates match ({}Hz), bypassing resampling",
                source_rate
            );
            return Self {
                channels,
                step: 1.0,
                position: 0.0,
                history: None,
            };
        }

        info!(
            "Creating resampler: {}Hz -> {}Hz, {} channels",
            source_rate, target_rate, channels
        );
        Self {
            channels,
            step: source_rate as f64 / target_rate as f64,
            position: 0.0,
            history: None,
        }
    }

    pub fn is_bypass(&self) -> bool {
        self.step == 1.0
    }

    /// Output frames per input frame
    pub fn ratio(&self) -> f64 {
        self.step.recip()
    }

    /// Convert `input` (one slice per channel) and append the result to
    /// `output`. Returns the number of frames appended.
    pub fn process(&mut self, input: &[Vec<f32>], output: &mut [Vec<f32>]) -> usize {
        let frames = input.first().map_or(0, Vec::len);
        if frames == 0 {
            return 0;
        }
        let channels = self.channels.min(input.len()).min(output.len());

        if self.is_bypass() {
            for ch in 0..channels {
                output[ch].extend_from_slice(&input[ch]);
            }
            return frames;
        }

        // Virtual sequence: the previous call's last frame, then `input`
        let offset = usize::from(self.history.is_some());
        let total = frames + offset;
        let sample = |ch: usize, index: usize| -> f32 {
            match (&self.history, index.checked_sub(offset)) {
                (_, Some(i)) => input[ch][i],
                (Some(history), None) => history[ch],
                (None, None) => 0.0,
            }
        };

        let mut produced = 0;
        let mut position = self.position;
        while position + 1.0 < total as f64 {
            let i0 = position.floor() as usize;
            let frac = (position - i0 as f64) as f32;
            for (ch, out) in output.iter_mut().enumerate().take(channels) {
                let a = sample(ch, i0);
                let b = sample(ch, i0 + 1);
                out.push(a + frac * (b - a));
            }
            produced += 1;
            position += self.step;
        }

        self.position = position - (total - 1) as f64;
        self.history = Some(input.iter().map(|channel| channel[frames - 1]).collect());
        produced
    }
}

/// Convert a whole planar signal from `source_rate` to `target_rate`
pub fn resample(channels: Vec<Vec<f32>>, source_rate: u32, target_rate: u32) -> Vec<Vec<f32>> {
    let mut resampler = Resampler::new(source_rate, target_rate, channels.len());
    if resampler.is_bypass() {
        return channels;
    }
    let mut output = vec![Vec::new(); channels.len()];
    resampler.process(&channels, &mut output);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(from: usize, to: usize) -> Vec<f32> {
        (from..to).map(|n| n as f32).collect()
    }

    #[test]
    fn test_resampler_bypass() {
        let mut resampler = Resampler::new(48000, 48000, 2);
        assert!(resampler.is_bypass());

        let input = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        let mut output = vec![Vec::new(), Vec::new()];
        assert_eq!(resampler.process(&input, &mut output), 2);
        assert_eq!(output, input);
    }

    #[test]
    fn test_upsampling_interpolates() {
        let mut resampler = Resampler::new(24000, 48000, 1);
        assert!((resampler.ratio() - 2.0).abs() < 1e-9);

        let mut output = vec![Vec::new()];
        let n = resampler.process(&[ramp(0, 4)], &mut output);
        assert_eq!(n, 6);
        assert_eq!(output[0], vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5]);
    }

    #[test]
    fn test_chunks_join_without_seams() {
        let mut whole = Resampler::new(24000, 48000, 1);
        let mut expected = vec![Vec::new()];
        whole.process(&[ramp(0, 8)], &mut expected);

        let mut chunked = Resampler::new(24000, 48000, 1);
        let mut output = vec![Vec::new()];
        chunked.process(&[ramp(0, 4)], &mut output);
        chunked.process(&[ramp(4, 8)], &mut output);

        assert_eq!(output, expected);
        assert_eq!(output[0].len(), 14);
    }

    #[test]
    fn test_downsampling_length() {
        let out = resample(vec![vec![0.5; 44100], vec![0.25; 44100]], 44100, 22050);
        assert_eq!(out.len(), 2);
        assert!((out[0].len() as i64 - 22050).abs() <= 1);
        assert!(out[1].iter().all(|s| (*s - 0.25).abs() < 1e-6));
    }
}
