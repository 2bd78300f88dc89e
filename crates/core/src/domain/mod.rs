//! Domain entities and business rules

pub mod audio;
pub mod config;
pub mod graph;
pub mod producer;
pub mod protocol;
pub mod session;
pub mod state;
pub mod throttle;

// Re-export specific items to avoid ambiguous glob imports
pub use audio::{
    AudioBackend, AudioBuffer, AudioError, ChannelCount, DeviceId, DeviceInfo, DeviceType,
    MediaLibrary, MediaStream, SampleRate, StreamConfig,
};
pub use config::{ConfigError, ConfigManager, RoomcastConfig};
pub use graph::{lock_graph, GraphError, NodeName, RoutingGraph, SharedGraph};
pub use producer::{Microphone, Playlist, ProducerError};
pub use protocol::{RoomState, SessionEngine, SessionError, SessionEvent};
pub use session::{ClientError, ClientState, Collaborators, RoomClient};
pub use state::StatePublisher;
