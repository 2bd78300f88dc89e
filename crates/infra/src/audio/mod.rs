//! Platform audio through CPAL
//!
//! CPAL abstracts the platform-specific APIs:
//! - Windows: WASAPI
//! - Linux: ALSA/PulseAudio
//! - macOS: CoreAudio

pub mod cpal_backend;
pub mod engine;
pub mod resample;

pub use cpal_backend::{list_devices, CpalBackend, CpalInputDevice, CpalInputReader};
pub use engine::{PlaybackEngine, RenderClock};
pub use resample::{resample, Resampler};
