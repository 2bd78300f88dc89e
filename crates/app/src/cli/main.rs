//! Roomcast CLI Application

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use roomcast_core::domain::audio::MediaStream;
use roomcast_core::domain::protocol::transport::{MediaEvent, MediaNegotiator};
use roomcast_core::domain::protocol::{
    LoopbackBridge, RoomId, SessionDescription, SessionError,
};
use roomcast_core::domain::{
    Collaborators, ConfigManager, RoomClient, RoomcastConfig, SessionEngine,
};
use roomcast_infra::audio::{list_devices, CpalBackend, PlaybackEngine, RenderClock};
use roomcast_infra::media::SymphoniaLibrary;
use roomcast_infra::signaling::JanusHttpTransport;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "roomcast")]
#[command(about = "Stream a microphone and a playlist into an audio room", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (defaults to the per-user config)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List audio input and output devices
    Devices,

    /// Manage rooms on the configured gateway
    Room {
        /// Room to act on instead of the configured one
        #[arg(long)]
        id: Option<u64>,

        #[command(subcommand)]
        action: RoomAction,
    },

    /// Run a session against the in-process bridge
    Demo {
        /// Audio files to queue in the playlist
        files: Vec<PathBuf>,

        /// Ask the room to record the session
        #[arg(long)]
        record: bool,

        /// Open the default microphone as well
        #[arg(long)]
        mic: bool,

        /// How long to stream before leaving
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },

    /// Write the factory default configuration
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Clone, Copy)]
enum RoomAction {
    Exists,
    Create,
    Destroy,
    Participants,
}

/// Negotiator for signaling-only sessions
struct NoMedia {
    events: broadcast::Sender<MediaEvent>,
}

impl NoMedia {
    fn new() -> Self {
        let (events, _) = broadcast::channel(1);
        Self { events }
    }
}

#[async_trait]
impl MediaNegotiator for NoMedia {
    async fn create_local_offer(
        &self,
        _stream: &MediaStream,
    ) -> Result<SessionDescription, SessionError> {
        Err(SessionError::Negotiation(
            "media is not available from the command line".to_string(),
        ))
    }

    async fn apply_remote_fragment(
        &self,
        _fragment: SessionDescription,
    ) -> Result<(), SessionError> {
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.subscribe()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    tracing::info!("Roomcast starting...");

    match cli.command {
        Command::Devices => devices(),
        Command::InitConfig { force } => init_config(cli.config, force).await,
        Command::Room { id, action } => {
            let mut config = load_config(cli.config).await?;
            if let Some(id) = id {
                config.room.id = RoomId(id);
            }
            room(config, action).await
        }
        Command::Demo {
            files,
            record,
            mic,
            seconds,
        } => {
            let config = load_config(cli.config).await?;
            demo(config, files, record, mic, Duration::from_secs(seconds)).await
        }
    }
}

async fn load_config(path: Option<PathBuf>) -> anyhow::Result<RoomcastConfig> {
    let config = match path {
        Some(path) => RoomcastConfig::load_from_file(&path)
            .await
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => {
            let dir = ConfigManager::default_config_dir()?;
            ConfigManager::new(dir).load().await
        }
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn init_config(path: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let config = RoomcastConfig::factory_default();
    let path = match path {
        Some(path) => path,
        None => ConfigManager::new(ConfigManager::default_config_dir()?)
            .config_path()
            .to_path_buf(),
    };
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    config
        .save_to_file(&path)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn devices() -> anyhow::Result<()> {
    let devices = list_devices().context("Failed to enumerate audio devices")?;
    if devices.is_empty() {
        println!("No audio devices found");
    }
    for device in devices {
        let rate = device
            .default_sample_rate
            .map(|rate| format!("{} Hz", rate.hz()))
            .unwrap_or_else(|| "-".to_string());
        println!("{:<7} {:<10} {}", format!("{:?}", device.device_type), rate, device.name);
    }
    Ok(())
}

async fn room(config: RoomcastConfig, action: RoomAction) -> anyhow::Result<()> {
    let engine = SessionEngine::new(
        &config,
        Arc::new(JanusHttpTransport::new()),
        Arc::new(NoMedia::new()),
    );
    engine
        .open()
        .await
        .with_context(|| format!("Failed to reach {}", config.server.address))?;

    let outcome = run_room_action(&engine, &config, action).await;
    engine.destroy().await;
    outcome
}

async fn run_room_action(
    engine: &SessionEngine,
    config: &RoomcastConfig,
    action: RoomAction,
) -> anyhow::Result<()> {
    engine.attach().await?;
    let room = &config.room;
    match action {
        RoomAction::Exists => {
            let exists = engine.room_exists(room.id).await?;
            println!("Room {} {}", room.id, if exists { "exists" } else { "does not exist" });
        }
        RoomAction::Create => {
            engine.create_room(room).await?;
            println!("Created room {}", room.id);
        }
        RoomAction::Destroy => {
            engine.destroy_room(room).await?;
            println!("Destroyed room {}", room.id);
        }
        RoomAction::Participants => {
            let participants = engine.list_participants(room.id).await?;
            println!("{}", serde_json::to_string_pretty(&participants)?);
        }
    }
    Ok(())
}

/// Output driving the graph: the sound card if one opens, a timer otherwise
#[allow(dead_code)]
enum Output {
    Device(PlaybackEngine),
    Clock(RenderClock),
}

async fn demo(
    config: RoomcastConfig,
    files: Vec<PathBuf>,
    record: bool,
    mic: bool,
    duration: Duration,
) -> anyhow::Result<()> {
    let bridge = Arc::new(LoopbackBridge::new(config.app.stream_config()));
    if !config.room.owner {
        bridge.add_room(config.room.id, Vec::new());
    }

    let client = RoomClient::new(
        config,
        Collaborators {
            transport: bridge.clone(),
            negotiator: bridge.clone(),
            audio: Arc::new(CpalBackend::new()),
            media: Arc::new(SymphoniaLibrary::new()),
        },
    )?;

    let _output = match PlaybackEngine::start(client.graph().clone()) {
        Ok(engine) => {
            println!("Playing through {}", engine.device_name());
            Output::Device(engine)
        }
        Err(err) => {
            tracing::warn!(error = %err, "No output device, rendering without one");
            Output::Clock(RenderClock::start(client.graph().clone()))
        }
    };

    client.start(record).await.context("Failed to join the room")?;
    if !client.config().room.owner {
        client.enable_to_transmit().await?;
    }
    println!("Joined room {}", client.config().room.id);

    let mut microphone = if mic {
        let mut microphone = client.create_microphone()?;
        match microphone.switch_on().await {
            Ok(()) => Some(microphone),
            Err(err) => {
                tracing::warn!(error = %err, "Microphone unavailable");
                None
            }
        }
    } else {
        None
    };

    let playlist = client.create_playlist()?;
    for file in files {
        let added = playlist.add(file);
        let _ = added.loaded.await;
    }
    if !playlist.snapshot().songs.is_empty() {
        playlist.toggle_play().await?;
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let deadline = tokio::time::Instant::now() + duration;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::time::sleep_until(deadline) => break,
            _ = tokio::signal::ctrl_c() => break,
        }
        let state = playlist.snapshot();
        let song = state
            .active_song_id
            .as_ref()
            .and_then(|id| playlist.song(id))
            .map(|song| format!("{} - {}", song.artist, song.title))
            .unwrap_or_else(|| "nothing".to_string());
        let level = state.channel_volume.iter().copied().fold(0.0f32, f32::max);
        let peak = client.stream_audio_data().into_iter().max().unwrap_or(0);
        println!(
            "{:?} {song} at {:.1}s, playlist level {level:.2}, spectrum peak {peak}",
            state.transport, state.current_time
        );
    }

    if let Some(microphone) = microphone.as_mut() {
        microphone.switch_off();
    }
    playlist.stop();
    client.stop().await;
    println!(
        "{}",
        serde_json::to_string_pretty(&client.state()).context("Failed to encode state")?
    );
    Ok(())
}
