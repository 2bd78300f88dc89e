//! Room client facade
//!
//! Composes the routing graph, the session engine and the producers. The
//! capture sink's stream is the one thing handed from the audio side to the
//! protocol side, and it exists from construction on.

use crate::domain::audio::{AudioBackend, MediaLibrary, MediaStream};
use crate::domain::config::RoomcastConfig;
use crate::domain::graph::analyser::FFT_SIZE;
use crate::domain::graph::{
    lock_graph, AnalyserHandle, AnalyserNode, GraphError, RoutingGraph, SharedGraph, SourceNode,
    PLAYBACK_SINK,
};
use crate::domain::producer::{Microphone, Playlist, ProducerError};
use crate::domain::protocol::{
    MediaNegotiator, Participant, ParticipantId, RoomState, SessionEngine, SessionError,
    SessionEvent, SessionSnapshot, SignalingTransport,
};
use crate::domain::state::StatePublisher;
use serde::Serialize;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Graph node carrying the remote room mix
pub const REMOTE_SOURCE: &str = "remote";

/// Spectrum analyser between the remote mix and the speaker
pub const REMOTE_ANALYSER: &str = "remote-analyser";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Producer(#[from] ProducerError),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Platform services the client is built on
pub struct Collaborators {
    pub transport: Arc<dyn SignalingTransport>,
    pub negotiator: Arc<dyn MediaNegotiator>,
    pub audio: Arc<dyn AudioBackend>,
    pub media: Arc<dyn MediaLibrary>,
}

/// Stereo balance between the left and right output channels
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MixerBalance {
    pub value: f32,
    pub left_volume: f32,
    pub right_volume: f32,
}

impl MixerBalance {
    /// `value` runs from full left (0) to full right (1); the centre keeps
    /// both channels at unity
    pub fn new(value: f32) -> Self {
        let value = value.clamp(0.0, 1.0);
        Self {
            value,
            left_volume: Self::normalize(1.0 - value),
            right_volume: Self::normalize(value),
        }
    }

    fn normalize(value: f32) -> f32 {
        if value < 0.5 {
            2.0 * value
        } else {
            1.0
        }
    }
}

impl Default for MixerBalance {
    fn default() -> Self {
        Self::new(0.5)
    }
}

/// Published client state: the session flags and roster plus local
/// playback settings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientState {
    pub user_id: Option<ParticipantId>,
    pub room_state: RoomState,
    pub initialized: bool,
    pub starting: bool,
    pub streaming: bool,
    pub recording: bool,
    pub listeners: Vec<Participant>,
    pub has_remote_stream: bool,
    pub muted: bool,
    pub volume: f32,
    pub mixer: MixerBalance,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            user_id: None,
            room_state: RoomState::default(),
            initialized: false,
            starting: false,
            streaming: false,
            recording: false,
            listeners: Vec::new(),
            has_remote_stream: false,
            muted: false,
            volume: 1.0,
            mixer: MixerBalance::default(),
        }
    }
}

impl ClientState {
    fn absorb(&mut self, session: &SessionSnapshot) {
        self.room_state = session.room_state;
        self.initialized = session.initialized;
        self.starting = session.starting;
        self.streaming = session.streaming;
        self.recording = session.recording;
        self.listeners = session.participants.clone();
        if session.participant_id.is_some() {
            self.user_id = session.participant_id;
        }
    }
}

struct ClientShared {
    config: RoomcastConfig,
    graph: SharedGraph,
    engine: SessionEngine,
    audio: Arc<dyn AudioBackend>,
    media: Arc<dyn MediaLibrary>,
    analyser: AnalyserHandle,
    state: StatePublisher<ClientState>,
}

impl ClientShared {
    fn attach_remote(&self, stream: &MediaStream) -> Result<()> {
        {
            let mut graph = lock_graph(&self.graph);
            graph.set_node(REMOTE_SOURCE, Box::new(SourceNode::new(stream.reader())))?;
            graph.connect(REMOTE_SOURCE, REMOTE_ANALYSER)?;
        }
        self.state.update(|s| s.has_remote_stream = true);
        info!(stream = stream.id(), "Remote stream attached");
        Ok(())
    }

    fn detach_remote(&self) {
        if lock_graph(&self.graph).discard(REMOTE_SOURCE) {
            debug!("Remote stream detached");
        }
        self.state.update(|s| s.has_remote_stream = false);
    }

    fn apply_playback_gain(&self) {
        let (muted, volume) = self.state.read(|s| (s.muted, s.volume));
        lock_graph(&self.graph)
            .playback_gain()
            .set(if muted { 0.0 } else { volume });
    }
}

impl Drop for ClientShared {
    fn drop(&mut self) {
        let mut graph = lock_graph(&self.graph);
        graph.discard(REMOTE_SOURCE);
        graph.discard(REMOTE_ANALYSER);
    }
}

/// One participant's connection to the audio room
pub struct RoomClient {
    shared: Arc<ClientShared>,
    relay: JoinHandle<()>,
}

impl RoomClient {
    /// Build the client and its routing graph. Must be called inside a
    /// Tokio runtime.
    pub fn new(config: RoomcastConfig, collaborators: Collaborators) -> Result<Self> {
        let graph = RoutingGraph::new(config.app.stream_config()).into_shared();
        let (analyser, handle) = AnalyserNode::new(FFT_SIZE);
        {
            let mut g = lock_graph(&graph);
            g.set_node(REMOTE_ANALYSER, Box::new(analyser))?;
            g.connect(REMOTE_ANALYSER, PLAYBACK_SINK)?;
        }

        let engine = SessionEngine::new(&config, collaborators.transport, collaborators.negotiator);
        let snapshots = engine.subscribe();
        let events = engine.events();

        let shared = Arc::new(ClientShared {
            config,
            graph,
            engine,
            audio: collaborators.audio,
            media: collaborators.media,
            analyser: handle,
            state: StatePublisher::new(ClientState::default()),
        });
        let relay = tokio::spawn(relay_session(Arc::downgrade(&shared), snapshots, events));

        Ok(Self { shared, relay })
    }

    pub fn config(&self) -> &RoomcastConfig {
        &self.shared.config
    }

    pub fn graph(&self) -> &SharedGraph {
        &self.shared.graph
    }

    pub fn engine(&self) -> &SessionEngine {
        &self.shared.engine
    }

    /// Current state, including the latest session snapshot
    pub fn state(&self) -> ClientState {
        let mut state = self.shared.state.snapshot();
        state.absorb(&self.shared.engine.snapshot());
        state
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.shared.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.engine.events()
    }

    /// Join the configured room and start streaming the capture sink.
    ///
    /// Owners recreate the room first. On any failure the session is left
    /// and the error returned.
    #[instrument(skip(self), fields(room = %self.shared.config.room.id))]
    pub async fn start(&self, record: bool) -> Result<()> {
        let engine = &self.shared.engine;
        engine.set_starting(true);
        match self.run_start(record).await {
            Ok(()) => {
                engine.mark_streaming(record);
                info!(record, "Streaming");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Start failed, leaving");
                engine.set_starting(false);
                engine.leave().await;
                Err(err)
            }
        }
    }

    async fn run_start(&self, record: bool) -> Result<()> {
        let engine = &self.shared.engine;
        engine.open().await?;
        if !engine.is_attached() {
            engine.attach().await?;
        }

        let room = engine.room().with_record(record);
        if room.owner {
            if engine.room_exists(room.id).await? {
                debug!("Room already exists, recreating");
                engine.destroy_room(&room).await?;
            }
            engine.create_room(&room).await?;
        }

        if let Some(id) = engine.join_room(&room).await? {
            self.shared.state.update(|s| s.user_id = Some(id));
        }

        let stream = lock_graph(&self.shared.graph).capture_stream();
        engine.offer_media(&stream).await?;
        Ok(())
    }

    /// Detach the remote audio and leave. Never fails.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        self.shared.detach_remote();
        self.shared.engine.leave().await;
    }

    /// Ask the room to start mixing this client's audio
    pub async fn enable_to_transmit(&self) -> Result<()> {
        self.shared.engine.unmute().await?;
        Ok(())
    }

    /// Silence local playback
    pub fn mute(&self) {
        self.shared.state.update(|s| s.muted = true);
        self.shared.apply_playback_gain();
    }

    pub fn unmute(&self) {
        self.shared.state.update(|s| s.muted = false);
        self.shared.apply_playback_gain();
    }

    pub fn toggle_mute(&self) -> bool {
        let muted = !self.shared.state.read(|s| s.muted);
        if muted {
            self.mute();
        } else {
            self.unmute();
        }
        muted
    }

    /// Local playback volume, clamped to 0..=1
    pub fn set_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        self.shared.state.update(|s| s.volume = volume);
        self.shared.apply_playback_gain();
    }

    pub fn set_mixer_value(&self, value: f32) -> MixerBalance {
        let mixer = MixerBalance::new(value);
        self.shared.state.update(|s| s.mixer = mixer);
        mixer
    }

    /// Byte frequency data of the remote audio, one value per bin
    pub fn stream_audio_data(&self) -> Vec<u8> {
        self.shared.analyser.byte_frequency_data()
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.shared.analyser.frequency_bin_count()
    }

    pub fn create_microphone(&self) -> Result<Microphone> {
        Ok(Microphone::new(
            self.shared.graph.clone(),
            self.shared.audio.clone(),
            &self.shared.config.microphone,
            self.shared.config.app.level_refresh(),
        )?)
    }

    pub fn create_playlist(&self) -> Result<Playlist> {
        Ok(Playlist::new(
            self.shared.graph.clone(),
            self.shared.media.clone(),
            &self.shared.config.playlist,
            self.shared.config.app.level_refresh(),
            self.shared.config.app.time_refresh(),
        )?)
    }
}

impl Drop for RoomClient {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

/// Mirror session snapshots into the client state and route remote streams
/// into the graph
async fn relay_session(
    weak: Weak<ClientShared>,
    mut snapshots: watch::Receiver<SessionSnapshot>,
    mut events: broadcast::Receiver<SessionEvent>,
) {
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                shared.state.update(|s| s.absorb(&snapshot));
            }
            event = events.recv() => match event {
                Ok(SessionEvent::RemoteStream(stream)) => {
                    let Some(shared) = weak.upgrade() else {
                        break;
                    };
                    if let Err(err) = shared.attach_remote(&stream) {
                        warn!(error = %err, "Failed to attach remote stream");
                    }
                }
                Ok(SessionEvent::Closed) => {
                    let Some(shared) = weak.upgrade() else {
                        break;
                    };
                    shared.detach_remote();
                }
                Ok(SessionEvent::Error(err)) => debug!(error = %err, "Session error"),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => warn!(missed, "Session events lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}
