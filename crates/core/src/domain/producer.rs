//! Audio producers feeding the routing graph
//!
//! A producer owns a small chain of nodes in the shared graph and publishes
//! its own observable state. Each instance prefixes its node names with a
//! unique id, so several producers can coexist in one graph.

pub mod microphone;
pub mod playlist;
pub mod track;

use crate::domain::audio::AudioError;
use crate::domain::graph::{GraphError, NodeName};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub use microphone::{Microphone, MicrophoneState};
pub use playlist::{AddedSong, Playlist, PlaylistState, Song, SongId, SongStatus, TransportState};
pub use track::{PlaybackSignal, TrackHandle};

/// Errors raised by producers
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("Unknown song: {0}")]
    UnknownSong(String),

    #[error("Song '{0}' is not ready to play")]
    SongNotReady(String),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

pub type Result<T> = std::result::Result<T, ProducerError>;

static NEXT_PRODUCER: AtomicU64 = AtomicU64::new(1);

/// Unique prefix for one producer's graph nodes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProducerId(String);

impl ProducerId {
    pub fn next(kind: &str) -> Self {
        let n = NEXT_PRODUCER.fetch_add(1, Ordering::Relaxed);
        Self(format!("{kind}-{n}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of this producer's node with the given role
    pub fn node(&self, role: &str) -> NodeName {
        NodeName::new(format!("{}/{role}", self.0))
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
