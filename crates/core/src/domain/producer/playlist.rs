//! Playlist producer
//!
//! Node chain, per instance:
//!
//! ```text
//! source -> gain -> meter -> mix -> [stream]
//!              \-> gate  -> [speaker]
//! ```
//!
//! `gain` is the local volume, `mix` scales only what goes into the room.
//! The source node belongs to the active song and is replaced whenever
//! another song starts.

use super::track::{PlaybackSignal, TrackHandle};
use super::{ProducerError, ProducerId, Result};
use crate::domain::audio::{CoverImage, MediaLibrary, SongMetadata};
use crate::domain::config::PlaylistConfig;
use crate::domain::graph::{
    lock_graph, GainControl, GainNode, GateControl, NodeName, RoutingGraph, SharedGraph,
    SourceNode, CAPTURE_SINK, PLAYBACK_SINK,
};
use crate::domain::state::StatePublisher;
use crate::domain::throttle::Throttle;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const UNKNOWN_ARTIST: &str = "Unknown Artist";

/// Identifier of a playlist entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SongId(String);

impl SongId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SongId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SongStatus {
    /// Metadata is still being read
    Loading,
    Ready,
    Failed(String),
}

/// One playlist entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Song {
    pub id: SongId,
    pub status: SongStatus,
    pub title: String,
    pub artist: String,
    pub duration_seconds: Option<f64>,
    pub cover: Option<CoverImage>,
    pub path: PathBuf,
}

impl Song {
    fn placeholder(id: SongId, path: &Path) -> Self {
        Self {
            id,
            status: SongStatus::Loading,
            title: file_stem(path),
            artist: UNKNOWN_ARTIST.to_string(),
            duration_seconds: None,
            cover: None,
            path: path.to_path_buf(),
        }
    }

    fn apply_metadata(&mut self, metadata: SongMetadata) {
        self.title = metadata
            .title
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| file_stem(&self.path));
        self.artist = metadata
            .artist
            .filter(|artist| !artist.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_ARTIST.to_string());
        self.duration_seconds = metadata.duration_seconds;
        self.cover = metadata.cover;
        self.status = SongStatus::Ready;
    }

    pub fn is_ready(&self) -> bool {
        self.status == SongStatus::Ready
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Transport of the active song
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum TransportState {
    /// No active song
    #[default]
    Idle,
    /// The active song is being decoded
    Loading,
    /// The active song reached its end and nothing followed it
    Ready,
    Playing,
    Paused,
}

/// Published playlist state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaylistState {
    pub initialized: bool,
    pub songs: Vec<Song>,
    pub active_song_id: Option<SongId>,
    pub selected_song_id: Option<SongId>,
    pub transport: TransportState,
    pub playing: bool,
    pub volume: f32,
    pub mix_volume: f32,
    pub muted: bool,
    pub looping: bool,
    pub play_through: bool,
    /// Position of the active song in seconds
    pub current_time: f64,
    pub channel_volume: Vec<f32>,
}

/// Returned by [`Playlist::add`]
#[derive(Debug)]
pub struct AddedSong {
    pub id: SongId,
    /// Completes once metadata has been read (or failed to read)
    pub loaded: JoinHandle<()>,
}

struct PlaylistNodes {
    gain: GainControl,
    mix: GainControl,
    gate: GateControl,
}

struct ActiveTrack {
    song: SongId,
    handle: TrackHandle,
    listener: JoinHandle<()>,
}

#[derive(Default)]
struct PlaylistCore {
    nodes: Option<PlaylistNodes>,
    track: Option<ActiveTrack>,
}

struct PlaylistShared {
    id: ProducerId,
    graph: SharedGraph,
    library: Arc<dyn MediaLibrary>,
    level_refresh: Duration,
    time_refresh: Duration,
    state: Arc<StatePublisher<PlaylistState>>,
    core: Mutex<PlaylistCore>,
}

impl PlaylistShared {
    fn node(&self, role: &str) -> NodeName {
        self.id.node(role)
    }

    fn chain(&self) -> [NodeName; 5] {
        [
            self.node("source"),
            self.node("gain"),
            self.node("meter"),
            self.node("mix"),
            self.node("gate"),
        ]
    }
}

impl Drop for PlaylistShared {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(track) = core.track.take() {
            track.handle.stop();
            track.listener.abort();
        }
        let mut graph = lock_graph(&self.graph);
        for node in self.chain() {
            graph.discard(node.as_str());
        }
    }
}

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// An ordered list of local songs played into the room
///
/// Cheap to clone; clones control the same playlist.
#[derive(Clone)]
pub struct Playlist {
    shared: Arc<PlaylistShared>,
}

impl Playlist {
    /// Create the producer and wire its processing chain into `graph`
    pub fn new(
        graph: SharedGraph,
        library: Arc<dyn MediaLibrary>,
        config: &PlaylistConfig,
        level_refresh: Duration,
        time_refresh: Duration,
    ) -> Result<Self> {
        let playlist = Self {
            shared: Arc::new(PlaylistShared {
                id: ProducerId::next("playlist"),
                graph,
                library,
                level_refresh,
                time_refresh,
                state: Arc::new(StatePublisher::new(PlaylistState {
                    initialized: false,
                    songs: Vec::new(),
                    active_song_id: None,
                    selected_song_id: None,
                    transport: TransportState::Idle,
                    playing: false,
                    volume: config.volume,
                    mix_volume: config.mix_volume,
                    muted: false,
                    looping: config.looping,
                    play_through: config.play_through,
                    current_time: 0.0,
                    channel_volume: Vec::new(),
                })),
                core: Mutex::new(PlaylistCore::default()),
            }),
        };
        playlist.ensure_setup()?;
        Ok(playlist)
    }

    fn core(&self) -> MutexGuard<'_, PlaylistCore> {
        self.shared.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> &StatePublisher<PlaylistState> {
        &self.shared.state
    }

    pub fn id(&self) -> &ProducerId {
        &self.shared.id
    }

    pub fn snapshot(&self) -> PlaylistState {
        self.state().snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaylistState> {
        self.state().subscribe()
    }

    pub fn source_node(&self) -> NodeName {
        self.shared.node("source")
    }

    pub fn gain_node(&self) -> NodeName {
        self.shared.node("gain")
    }

    pub fn mix_node(&self) -> NodeName {
        self.shared.node("mix")
    }

    pub fn gate_node(&self) -> NodeName {
        self.shared.node("gate")
    }

    pub fn song(&self, id: &SongId) -> Option<Song> {
        self.state()
            .read(|s| s.songs.iter().find(|song| &song.id == id).cloned())
    }

    fn ensure_setup(&self) -> Result<()> {
        let mut core = self.core();
        if core.nodes.is_some() {
            return Ok(());
        }

        let current = self.snapshot();
        let gain = GainControl::new(if current.muted { 0.0 } else { current.volume });
        let mix = GainControl::new(current.mix_volume);

        let state = self.shared.state.clone();
        let mut throttle = Throttle::new(self.shared.level_refresh);
        let meter = RoutingGraph::create_metering_tap(move |levels| {
            if throttle.ready() {
                state.update(|s| {
                    if s.playing {
                        s.channel_volume = levels.to_vec();
                    }
                });
            }
        });
        let (gate, gate_control) = RoutingGraph::create_pass_through_gate(current.play_through);

        let [_, gain_node, meter_node, mix_node, gate_node] = self.shared.chain();
        {
            let mut graph = lock_graph(&self.shared.graph);
            graph.set_node(gain_node.clone(), Box::new(GainNode::new(gain.clone())))?;
            graph.set_node(meter_node.clone(), Box::new(meter))?;
            graph.set_node(mix_node.clone(), Box::new(GainNode::new(mix.clone())))?;
            graph.set_node(gate_node.clone(), Box::new(gate))?;
            graph.connect(gain_node.clone(), meter_node.clone())?;
            graph.connect(meter_node, mix_node.clone())?;
            graph.connect(mix_node, CAPTURE_SINK)?;
            graph.connect(gain_node, gate_node.clone())?;
            graph.connect(gate_node, PLAYBACK_SINK)?;
        }

        core.nodes = Some(PlaylistNodes {
            gain,
            mix,
            gate: gate_control,
        });
        self.state().update(|s| s.initialized = true);
        debug!(producer = %self.shared.id, "Playlist chain ready");
        Ok(())
    }

    /// Append a song. A placeholder entry appears immediately; its metadata
    /// is filled in by a background task.
    pub fn add(&self, path: impl Into<PathBuf>) -> AddedSong {
        let path = path.into();
        let id = SongId::generate();
        let placeholder = Song::placeholder(id.clone(), &path);
        self.state().update(|s| s.songs.push(placeholder));
        debug!(song = %id, path = %path.display(), "Song added");

        let library = self.shared.library.clone();
        let state = self.shared.state.clone();
        let song_id = id.clone();
        let loaded = tokio::spawn(async move {
            let outcome = library.probe(&path).await;
            if let Err(err) = &outcome {
                warn!(song = %song_id, error = %err, "Failed to read song metadata");
            }
            state.update(|s| {
                // The song may have been removed while loading
                if let Some(song) = s.songs.iter_mut().find(|song| song.id == song_id) {
                    match outcome {
                        Ok(metadata) => song.apply_metadata(metadata),
                        Err(err) => song.status = SongStatus::Failed(err.to_string()),
                    }
                }
            });
        });

        AddedSong { id, loaded }
    }

    /// Mark a song as selected without playing it
    pub fn select(&self, id: &SongId) -> Result<()> {
        if self.song(id).is_none() {
            return Err(ProducerError::UnknownSong(id.to_string()));
        }
        self.state().update(|s| s.selected_song_id = Some(id.clone()));
        Ok(())
    }

    /// Remove a song. Removing the active song first advances to the next one.
    #[instrument(skip(self), fields(song = %id))]
    pub async fn remove(&self, id: &SongId) -> Result<()> {
        if self.song(id).is_none() {
            return Err(ProducerError::UnknownSong(id.to_string()));
        }

        if self.is_active(id) {
            let others = self.state().read(|s| s.songs.len() > 1);
            if others {
                if let Err(err) = self.next().await {
                    warn!(error = %err, "Could not advance past removed song");
                }
            }
            if self.is_active(id) {
                self.release_track();
                self.state().update(|s| {
                    s.active_song_id = None;
                    s.playing = false;
                    s.transport = TransportState::Idle;
                    s.current_time = 0.0;
                });
            }
        }

        self.state().update(|s| {
            s.songs.retain(|song| &song.id != id);
            if s.selected_song_id.as_ref() == Some(id) {
                s.selected_song_id = None;
            }
        });
        Ok(())
    }

    fn is_active(&self, id: &SongId) -> bool {
        self.state().read(|s| s.active_song_id.as_ref() == Some(id))
    }

    /// Pause when playing, otherwise play the active, selected or first song
    pub async fn toggle_play(&self) -> Result<()> {
        let (playing, target) = self.state().read(|s| {
            let target = s
                .active_song_id
                .clone()
                .or_else(|| s.selected_song_id.clone())
                .or_else(|| s.songs.first().map(|song| song.id.clone()));
            (s.playing, target)
        });
        if playing {
            self.pause();
            return Ok(());
        }
        match target {
            Some(id) => self.play(&id).await,
            None => Ok(()),
        }
    }

    /// Play `id`. Resumes it when it is already the active song; otherwise
    /// tears down the current song and decodes the new one. A song whose
    /// decode finishes after another song was chosen is discarded.
    #[instrument(skip(self), fields(producer = %self.shared.id, song = %id))]
    pub async fn play(&self, id: &SongId) -> Result<()> {
        let song = self
            .song(id)
            .ok_or_else(|| ProducerError::UnknownSong(id.to_string()))?;
        if !song.is_ready() {
            return Err(ProducerError::SongNotReady(id.to_string()));
        }
        self.ensure_setup()?;

        if self.is_active(id) {
            let resumed = {
                let core = self.core();
                match &core.track {
                    Some(track) if &track.song == id => {
                        track.handle.play();
                        true
                    }
                    _ => false,
                }
            };
            if resumed {
                self.state().update(|s| {
                    s.playing = true;
                    s.transport = TransportState::Playing;
                    s.selected_song_id = Some(id.clone());
                });
                return Ok(());
            }
            if self.state().read(|s| s.transport == TransportState::Loading) {
                return Ok(());
            }
        }

        self.release_track();
        self.state().update(|s| {
            s.active_song_id = Some(id.clone());
            s.selected_song_id = Some(id.clone());
            s.transport = TransportState::Loading;
            s.playing = false;
            s.current_time = 0.0;
        });

        let target = *lock_graph(&self.shared.graph).config();
        let decoded = match self.shared.library.decode(&song.path, &target).await {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(error = %err, "Failed to decode song");
                self.state().update(|s| {
                    if s.active_song_id.as_ref() == Some(id) {
                        s.active_song_id = None;
                        s.transport = TransportState::Idle;
                    }
                });
                return Err(err.into());
            }
        };

        let handle = TrackHandle::new(decoded);
        {
            let mut core = self.core();
            if !self.is_active(id) || core.nodes.is_none() {
                debug!("Discarding stale song");
                return Ok(());
            }

            let (tx, rx) = mpsc::unbounded_channel();
            {
                let mut graph = lock_graph(&self.shared.graph);
                graph.set_node(self.source_node(), Box::new(SourceNode::new(handle.reader(tx))))?;
                graph.connect(self.source_node(), self.gain_node())?;
            }
            let listener = tokio::spawn(relay_playback(
                Arc::downgrade(&self.shared),
                id.clone(),
                rx,
                self.shared.time_refresh,
            ));
            if let Some(previous) = core.track.replace(ActiveTrack {
                song: id.clone(),
                handle: handle.clone(),
                listener,
            }) {
                previous.handle.stop();
                previous.listener.abort();
            }
            handle.play();
        }

        self.state().update(|s| {
            s.playing = true;
            s.transport = TransportState::Playing;
        });
        info!(title = %song.title, "Playing");
        Ok(())
    }

    pub fn pause(&self) {
        let paused = match &self.core().track {
            Some(track) => {
                track.handle.pause();
                true
            }
            None => false,
        };
        if paused {
            self.state().update(|s| {
                s.playing = false;
                s.transport = TransportState::Paused;
            });
        }
    }

    /// Stop playback and remove the whole chain from the graph. The next
    /// `play` rebuilds it.
    pub fn stop(&self) {
        {
            let mut core = self.core();
            if let Some(track) = core.track.take() {
                track.handle.stop();
                track.listener.abort();
            }
            let mut graph = lock_graph(&self.shared.graph);
            for node in self.shared.chain() {
                graph.discard(node.as_str());
            }
            core.nodes = None;
        }
        self.state().update(|s| {
            s.initialized = false;
            s.playing = false;
            s.active_song_id = None;
            s.transport = TransportState::Idle;
            s.current_time = 0.0;
            s.channel_volume.clear();
        });
        debug!(producer = %self.shared.id, "Playlist stopped");
    }

    /// Stop the active song and remove its source node
    fn release_track(&self) {
        let mut core = self.core();
        if let Some(track) = core.track.take() {
            track.handle.stop();
            track.listener.abort();
            lock_graph(&self.shared.graph).discard(self.source_node().as_str());
        }
    }

    /// Play the song after the active one, wrapping when looping
    pub async fn next(&self) -> Result<()> {
        let (ids, index, looping) = self.positions();
        if ids.is_empty() {
            return Ok(());
        }
        let mut next = index.map_or(0, |i| i + 1);
        if next >= ids.len() {
            if !looping {
                return Ok(());
            }
            next = 0;
        }
        self.play(&ids[next]).await
    }

    /// Play the song before the active one, wrapping when looping
    pub async fn previous(&self) -> Result<()> {
        let (ids, index, looping) = self.positions();
        if ids.is_empty() {
            return Ok(());
        }
        let previous = match index {
            Some(i) if i > 0 => i - 1,
            _ if looping => ids.len() - 1,
            _ => return Ok(()),
        };
        self.play(&ids[previous]).await
    }

    fn positions(&self) -> (Vec<SongId>, Option<usize>, bool) {
        self.state().read(|s| {
            let ids: Vec<SongId> = s.songs.iter().map(|song| song.id.clone()).collect();
            let index = s
                .active_song_id
                .as_ref()
                .and_then(|active| ids.iter().position(|id| id == active));
            (ids, index, s.looping)
        })
    }

    fn advance_after(self, ended: SongId) -> BoxedTask {
        Box::pin(async move {
            if !self.is_active(&ended) {
                return;
            }
            if let Err(err) = self.next().await {
                warn!(error = %err, "Failed to advance to the next song");
            }
        })
    }

    /// Seek the active song to `percent` (0..=1) of its known duration.
    /// Returns the new position, or `None` when the duration is unknown.
    pub fn seek(&self, percent: f64) -> Option<f64> {
        let active = self.state().read(|s| s.active_song_id.clone())?;
        let duration = self.song(&active)?.duration_seconds?;
        let time = percent.clamp(0.0, 1.0) * duration;
        {
            let core = self.core();
            let track = core.track.as_ref().filter(|track| track.song == active)?;
            track.handle.seek_to(time);
        }
        self.state().update(|s| s.current_time = time);
        Some(time)
    }

    pub fn set_volume(&self, volume: f32) {
        let volume = volume.max(0.0);
        self.state().update(|s| s.volume = volume);
        self.apply_gain();
    }

    pub fn set_mix_volume(&self, volume: f32) {
        let volume = volume.max(0.0);
        self.state().update(|s| s.mix_volume = volume);
        if let Some(nodes) = &self.core().nodes {
            nodes.mix.set(volume);
        }
    }

    pub fn mute(&self) {
        self.state().update(|s| s.muted = true);
        self.apply_gain();
    }

    pub fn unmute(&self) {
        self.state().update(|s| s.muted = false);
        self.apply_gain();
    }

    pub fn toggle_mute(&self) -> bool {
        let muted = !self.state().read(|s| s.muted);
        if muted {
            self.mute();
        } else {
            self.unmute();
        }
        muted
    }

    pub fn set_loop(&self, looping: bool) {
        self.state().update(|s| s.looping = looping);
    }

    pub fn toggle_loop(&self) -> bool {
        let looping = !self.state().read(|s| s.looping);
        self.set_loop(looping);
        looping
    }

    pub fn set_play_through(&self, enabled: bool) {
        self.state().update(|s| s.play_through = enabled);
        if let Some(nodes) = &self.core().nodes {
            nodes.gate.set(enabled);
        }
    }

    pub fn toggle_play_through(&self) -> bool {
        let enabled = !self.state().read(|s| s.play_through);
        self.set_play_through(enabled);
        enabled
    }

    fn apply_gain(&self) {
        let (volume, muted) = self.state().read(|s| (s.volume, s.muted));
        if let Some(nodes) = &self.core().nodes {
            nodes.gain.set(if muted { 0.0 } else { volume });
        }
    }
}

/// Forward position updates and react to the end of `song`
async fn relay_playback(
    weak: Weak<PlaylistShared>,
    song: SongId,
    mut signals: mpsc::UnboundedReceiver<PlaybackSignal>,
    time_refresh: Duration,
) {
    let mut throttle = Throttle::new(time_refresh);
    while let Some(signal) = signals.recv().await {
        let Some(shared) = weak.upgrade() else {
            break;
        };
        match signal {
            PlaybackSignal::TimeUpdate(time) => {
                if throttle.ready() {
                    shared.state.update(|s| {
                        if s.active_song_id.as_ref() == Some(&song) {
                            s.current_time = time;
                        }
                    });
                }
            }
            PlaybackSignal::Ended => {
                debug!(song = %song, "Song ended");
                shared.state.update(|s| {
                    if s.active_song_id.as_ref() == Some(&song) {
                        s.playing = false;
                        s.transport = TransportState::Ready;
                    }
                });
                tokio::spawn(Playlist { shared }.advance_after(song.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audio::StreamConfig;
    use crate::domain::producer::testing::FakeLibrary;

    fn graph() -> SharedGraph {
        RoutingGraph::new(StreamConfig::default()).into_shared()
    }

    fn playlist_with(graph: &SharedGraph, library: FakeLibrary) -> Playlist {
        Playlist::new(
            graph.clone(),
            Arc::new(library),
            &PlaylistConfig::default(),
            Duration::ZERO,
            Duration::ZERO,
        )
        .unwrap()
    }

    async fn add_ready(playlist: &Playlist, path: &str) -> SongId {
        let added = playlist.add(path);
        added.loaded.await.unwrap();
        added.id
    }

    #[tokio::test]
    async fn test_defaults() {
        let graph = graph();
        let playlist = playlist_with(&graph, FakeLibrary::default());
        let state = playlist.snapshot();
        assert_eq!(state.volume, 0.75);
        assert_eq!(state.mix_volume, 0.5);
        assert!(state.looping);
        assert!(state.play_through);
        assert!(state.initialized);
        assert_eq!(state.transport, TransportState::Idle);
    }

    #[tokio::test]
    async fn test_add_fills_metadata_with_fallbacks() {
        let graph = graph();
        let playlist = playlist_with(&graph, FakeLibrary::default());

        let added = playlist.add("/music/first song.mp3");
        let placeholder = playlist.song(&added.id).unwrap();
        assert_eq!(placeholder.status, SongStatus::Loading);

        added.loaded.await.unwrap();
        let song = playlist.song(&added.id).unwrap();
        assert_eq!(song.status, SongStatus::Ready);
        assert_eq!(song.title, "first song");
        assert_eq!(song.artist, UNKNOWN_ARTIST);
        assert_eq!(song.duration_seconds, Some(0.1));

        let tagged = add_ready(&playlist, "/music/tagged.mp3").await;
        assert_eq!(playlist.song(&tagged).unwrap().title, "Tagged Title");
        assert_eq!(playlist.snapshot().songs[0].id, added.id);
    }

    #[tokio::test]
    async fn test_failed_probe_marks_song() {
        let graph = graph();
        let playlist = playlist_with(&graph, FakeLibrary::default());
        let id = add_ready(&playlist, "/music/broken.mp3").await;

        let song = playlist.song(&id).unwrap();
        assert!(matches!(song.status, SongStatus::Failed(_)));
        assert!(matches!(
            playlist.play(&id).await,
            Err(ProducerError::SongNotReady(_))
        ));
    }

    #[tokio::test]
    async fn test_play_routes_to_both_sinks() {
        let graph = graph();
        let playlist = playlist_with(&graph, FakeLibrary::default());
        let id = add_ready(&playlist, "a.mp3").await;

        playlist.play(&id).await.unwrap();

        let state = playlist.snapshot();
        assert!(state.playing);
        assert_eq!(state.transport, TransportState::Playing);
        assert_eq!(state.active_song_id, Some(id.clone()));
        assert_eq!(state.selected_song_id, Some(id));

        let block = lock_graph(&graph).render(32);
        // 0.5 source * 0.75 volume, then * 0.5 mix for the room
        assert!(block.playback.channel(0).iter().all(|s| (*s - 0.375).abs() < 1e-6));
        assert!(block.capture.channel(0).iter().all(|s| (*s - 0.1875).abs() < 1e-6));
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let graph = graph();
        let playlist = playlist_with(&graph, FakeLibrary::default());
        let id = add_ready(&playlist, "a.mp3").await;
        playlist.play(&id).await.unwrap();

        playlist.toggle_play().await.unwrap();
        assert_eq!(playlist.snapshot().transport, TransportState::Paused);
        assert!(lock_graph(&graph).render(16).playback.is_silent());

        playlist.toggle_play().await.unwrap();
        assert_eq!(playlist.snapshot().transport, TransportState::Playing);
        assert!(!lock_graph(&graph).render(16).playback.is_silent());
    }

    #[tokio::test]
    async fn test_next_and_previous_wrap_when_looping() {
        let graph = graph();
        let playlist = playlist_with(&graph, FakeLibrary::default());
        let a = add_ready(&playlist, "a.mp3").await;
        let b = add_ready(&playlist, "b.mp3").await;
        let c = add_ready(&playlist, "c.mp3").await;

        playlist.play(&c).await.unwrap();
        playlist.next().await.unwrap();
        assert_eq!(playlist.snapshot().active_song_id, Some(a.clone()));

        playlist.previous().await.unwrap();
        assert_eq!(playlist.snapshot().active_song_id, Some(c.clone()));

        playlist.set_loop(false);
        playlist.next().await.unwrap();
        assert_eq!(playlist.snapshot().active_song_id, Some(c));

        playlist.play(&a).await.unwrap();
        playlist.previous().await.unwrap();
        assert_eq!(playlist.snapshot().active_song_id, Some(a));
        playlist.next().await.unwrap();
        assert_eq!(playlist.snapshot().active_song_id, Some(b));
    }

    #[tokio::test]
    async fn test_song_end_advances() {
        let graph = graph();
        let playlist = playlist_with(
            &graph,
            FakeLibrary {
                frames: 64,
                ..FakeLibrary::default()
            },
        );
        let a = add_ready(&playlist, "a.mp3").await;
        let b = add_ready(&playlist, "b.mp3").await;
        playlist.play(&a).await.unwrap();
        let mut changes = playlist.subscribe();

        lock_graph(&graph).render(128);

        let state = changes
            .wait_for(|s| s.active_song_id.as_ref() == Some(&b) && s.playing)
            .await
            .unwrap()
            .clone();
        assert_eq!(state.transport, TransportState::Playing);
    }

    #[tokio::test]
    async fn test_stale_decode_is_discarded() {
        let graph = graph();
        let playlist = playlist_with(
            &graph,
            FakeLibrary {
                decode_delay: Duration::from_millis(50),
                ..FakeLibrary::default()
            },
        );
        let a = add_ready(&playlist, "a.mp3").await;
        let b = add_ready(&playlist, "b.mp3").await;

        let slow = {
            let playlist = playlist.clone();
            let a = a.clone();
            tokio::spawn(async move { playlist.play(&a).await })
        };
        tokio::task::yield_now().await;
        while playlist.snapshot().active_song_id.as_ref() != Some(&a) {
            tokio::task::yield_now().await;
        }
        playlist.play(&b).await.unwrap();
        slow.await.unwrap().unwrap();

        let state = playlist.snapshot();
        assert_eq!(state.active_song_id, Some(b));
        assert!(state.playing);
        let g = lock_graph(&graph);
        assert_eq!(g.inputs_of(playlist.gain_node().as_str()), vec![playlist.source_node()]);
    }

    #[tokio::test]
    async fn test_remove_active_advances() {
        let graph = graph();
        let playlist = playlist_with(&graph, FakeLibrary::default());
        let a = add_ready(&playlist, "a.mp3").await;
        let b = add_ready(&playlist, "b.mp3").await;
        playlist.play(&a).await.unwrap();

        playlist.remove(&a).await.unwrap();

        let state = playlist.snapshot();
        assert_eq!(state.songs.len(), 1);
        assert_eq!(state.active_song_id, Some(b.clone()));

        playlist.remove(&b).await.unwrap();
        let state = playlist.snapshot();
        assert!(state.songs.is_empty());
        assert_eq!(state.active_song_id, None);
        assert_eq!(state.transport, TransportState::Idle);
        assert!(!lock_graph(&graph).contains(playlist.source_node().as_str()));
    }

    #[tokio::test]
    async fn test_seek_requires_known_duration() {
        let graph = graph();
        let playlist = playlist_with(&graph, FakeLibrary::default());
        assert_eq!(playlist.seek(0.5), None);

        let id = add_ready(&playlist, "a.mp3").await;
        playlist.play(&id).await.unwrap();

        let time = playlist.seek(0.5).unwrap();
        assert!((time - 0.05).abs() < 1e-9);
        assert_eq!(playlist.snapshot().current_time, time);
    }

    #[tokio::test]
    async fn test_stop_tears_down_and_play_rebuilds() {
        let graph = graph();
        let playlist = playlist_with(&graph, FakeLibrary::default());
        let id = add_ready(&playlist, "a.mp3").await;
        playlist.play(&id).await.unwrap();

        playlist.stop();
        assert_eq!(lock_graph(&graph).node_count(), 2);
        assert!(!playlist.snapshot().initialized);

        playlist.set_volume(0.2);
        playlist.set_play_through(false);
        playlist.play(&id).await.unwrap();
        let block = lock_graph(&graph).render(8);
        assert!(block.playback.is_silent());
        assert!(block.capture.channel(0).iter().all(|s| (*s - 0.05).abs() < 1e-6));
    }
}
