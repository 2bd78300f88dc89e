//! Metering tap: a pass-through node that reports per-channel levels

use super::{AudioNode, NodeKind};
use crate::domain::audio::AudioBuffer;

/// Frames accumulated before each level report
pub const METER_WINDOW: usize = 4096;

/// Map the sum of squared samples over a window to the 0..100 level scale.
///
/// A full-scale constant signal reads 100, silence reads 0.
pub fn channel_level(sum_squares: f64, window: usize) -> f32 {
    if sum_squares <= 0.0 || window == 0 {
        return 0.0;
    }
    let exponent = (sum_squares.ln() - (window as f64).ln()) / (2.0 * std::f64::consts::LN_10);
    (100.0 * exponent.exp()) as f32
}

/// Forwards its input unchanged and invokes a callback with one level per
/// channel every [`METER_WINDOW`] frames
pub struct MeteringTap {
    window: usize,
    energy: Vec<f64>,
    filled: usize,
    on_levels: Box<dyn FnMut(&[f32]) + Send>,
}

impl MeteringTap {
    pub fn new(window: usize, on_levels: impl FnMut(&[f32]) + Send + 'static) -> Self {
        Self {
            window: window.max(1),
            energy: Vec::new(),
            filled: 0,
            on_levels: Box::new(on_levels),
        }
    }

    fn report(&mut self) {
        let window = self.window;
        let levels: Vec<f32> = self
            .energy
            .iter()
            .map(|sum| channel_level(*sum, window))
            .collect();
        (self.on_levels)(&levels);
        self.energy.fill(0.0);
        self.filled = 0;
    }
}

impl AudioNode for MeteringTap {
    fn kind(&self) -> NodeKind {
        NodeKind::MeteringTap
    }

    fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer) {
        output.copy_from(input);

        if self.energy.len() != input.channel_count() {
            self.energy = vec![0.0; input.channel_count()];
            self.filled = 0;
        }

        let mut frame = 0;
        while frame < input.frames() {
            let take = (self.window - self.filled).min(input.frames() - frame);
            for (ch, sum) in self.energy.iter_mut().enumerate() {
                *sum += input.channel(ch)[frame..frame + take]
                    .iter()
                    .map(|s| f64::from(*s) * f64::from(*s))
                    .sum::<f64>();
            }
            self.filled += take;
            frame += take;
            if self.filled == self.window {
                self.report();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_level_scale() {
        assert_eq!(channel_level(0.0, METER_WINDOW), 0.0);
        let full = channel_level(METER_WINDOW as f64, METER_WINDOW);
        assert!((full - 100.0).abs() < 1e-3);
        // amplitude 0.5 gives mean square 0.25 and a level of 100 * 0.25^(1/(2 ln 10))
        let half = channel_level(METER_WINDOW as f64 * 0.25, METER_WINDOW);
        assert!(half > 70.0 && half < 80.0);
    }

    #[test]
    fn test_tap_reports_per_window() {
        let reports: Arc<Mutex<Vec<Vec<f32>>>> = Arc::default();
        let sink = reports.clone();
        let mut tap = MeteringTap::new(8, move |levels| sink.lock().unwrap().push(levels.to_vec()));

        let input = AudioBuffer::from_channels(vec![vec![1.0; 5], vec![0.0; 5]]);
        let mut output = AudioBuffer::new(2, 5);
        tap.process(&input, &mut output);
        assert!(reports.lock().unwrap().is_empty());
        assert_eq!(output, input);

        tap.process(&input, &mut output);
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert!((reports[0][0] - 100.0).abs() < 1e-3);
        assert_eq!(reports[0][1], 0.0);
    }
}
