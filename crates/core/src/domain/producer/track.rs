//! Playback of one decoded song
//!
//! A [`TrackHandle`] controls transport (play, pause, seek) through shared
//! atomics; the [`TrackReader`] created from it is the graph source and
//! reports position updates and the end of the song over a channel.

use crate::domain::audio::{AudioBuffer, DecodedAudio, SampleSource};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Progress reported by a playing track
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlaybackSignal {
    /// Current position in seconds
    TimeUpdate(f64),
    /// The last frame has been rendered
    Ended,
}

#[derive(Debug)]
struct TrackShared {
    audio: DecodedAudio,
    cursor: AtomicUsize,
    playing: AtomicBool,
}

impl TrackShared {
    fn at_end(&self) -> bool {
        self.cursor.load(Ordering::Acquire) >= self.audio.frames()
    }
}

/// Transport control for one decoded song
#[derive(Debug, Clone)]
pub struct TrackHandle {
    shared: Arc<TrackShared>,
}

impl TrackHandle {
    pub fn new(audio: DecodedAudio) -> Self {
        Self {
            shared: Arc::new(TrackShared {
                audio,
                cursor: AtomicUsize::new(0),
                playing: AtomicBool::new(false),
            }),
        }
    }

    /// Start or resume. A finished track restarts from the beginning.
    pub fn play(&self) {
        if self.shared.at_end() {
            self.shared.cursor.store(0, Ordering::Release);
        }
        self.shared.playing.store(true, Ordering::Release);
    }

    pub fn pause(&self) {
        self.shared.playing.store(false, Ordering::Release);
    }

    /// Pause and rewind
    pub fn stop(&self) {
        self.pause();
        self.shared.cursor.store(0, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        !self.shared.playing.load(Ordering::Acquire)
    }

    pub fn has_ended(&self) -> bool {
        self.shared.at_end()
    }

    /// Current position in seconds
    pub fn position(&self) -> f64 {
        self.frames_to_seconds(self.shared.cursor.load(Ordering::Acquire))
    }

    /// Length of the decoded audio in seconds
    pub fn duration(&self) -> f64 {
        self.shared.audio.duration_seconds()
    }

    /// Jump to `seconds`, clamped to the track
    pub fn seek_to(&self, seconds: f64) {
        let rate = self.shared.audio.sample_rate as f64;
        let frame = (seconds.max(0.0) * rate) as usize;
        self.shared
            .cursor
            .store(frame.min(self.shared.audio.frames()), Ordering::Release);
    }

    /// Graph source rendering this track and reporting on `signals`
    pub fn reader(&self, signals: mpsc::UnboundedSender<PlaybackSignal>) -> TrackReader {
        TrackReader {
            shared: self.shared.clone(),
            signals,
            ended_sent: false,
        }
    }

    fn frames_to_seconds(&self, frames: usize) -> f64 {
        match self.shared.audio.sample_rate {
            0 => 0.0,
            rate => frames as f64 / rate as f64,
        }
    }
}

/// Graph source for a [`TrackHandle`]
pub struct TrackReader {
    shared: Arc<TrackShared>,
    signals: mpsc::UnboundedSender<PlaybackSignal>,
    ended_sent: bool,
}

impl SampleSource for TrackReader {
    fn fill(&mut self, out: &mut AudioBuffer) {
        out.silence();
        if !self.shared.playing.load(Ordering::Acquire) {
            return;
        }

        let audio = &self.shared.audio;
        let total = audio.frames();
        let start = self.shared.cursor.load(Ordering::Acquire).min(total);
        let take = out.frames().min(total - start);

        if take > 0 && !audio.channels.is_empty() {
            for ch in 0..out.channel_count() {
                let source = &audio.channels[ch.min(audio.channels.len() - 1)];
                out.channel_mut(ch)[..take].copy_from_slice(&source[start..start + take]);
            }
            self.ended_sent = false;
            // A concurrent seek wins over this advance
            let _ = self.shared.cursor.compare_exchange(
                start,
                start + take,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            let position = (start + take) as f64 / audio.sample_rate.max(1) as f64;
            let _ = self.signals.send(PlaybackSignal::TimeUpdate(position));
        }

        if start + take >= total && !self.ended_sent {
            self.shared.playing.store(false, Ordering::Release);
            self.ended_sent = true;
            let _ = self.signals.send(PlaybackSignal::Ended);
        }
    }
}
