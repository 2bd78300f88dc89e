//! Configuration management for Roomcast
//!
//! This module provides:
//! - Configuration structs for the audio graph, the signaling server, the
//!   room and both producers
//! - TOML load/save
//! - A manager for the per-user config file with factory defaults and
//!   corrupt-file backup

use crate::domain::audio::{ChannelCount, SampleRate, StreamConfig};
use crate::domain::protocol::message::RoomId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, instrument};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Graph sample rate in Hz
    pub sample_rate: u32,

    /// Graph channel count
    pub channels: u16,

    /// Frames per render block
    pub buffer_size: u32,

    /// Minimum interval between channel level reports
    pub level_refresh_ms: u64,

    /// Minimum interval between playback position reports
    pub time_refresh_ms: u64,

    /// Timeout for requests answered by asynchronous events (0 = wait forever)
    pub request_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            buffer_size: 512,
            level_refresh_ms: 500,
            time_refresh_ms: 500,
            request_timeout_secs: 0,
        }
    }
}

impl AppConfig {
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            sample_rate: SampleRate::from_hz(self.sample_rate),
            channels: ChannelCount::from_count(self.channels),
            buffer_size: self.buffer_size,
        }
    }

    pub fn level_refresh(&self) -> Duration {
        Duration::from_millis(self.level_refresh_ms)
    }

    pub fn time_refresh(&self) -> Duration {
        Duration::from_millis(self.time_refresh_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

/// Signaling server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the signaling endpoint
    pub address: String,

    /// Conference plugin to attach to
    pub plugin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "http://localhost:8088/janus".to_string(),
            plugin: "janus.plugin.audiobridge".to_string(),
        }
    }
}

/// The room this client joins
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomConfig {
    pub id: RoomId,

    #[serde(default)]
    pub description: String,

    /// Owners recreate the room on start and destroy it on stop
    #[serde(default)]
    pub owner: bool,

    /// Secret required to destroy the room
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Display name announced to other participants
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,

    /// Extra fields passed through on create (bitrate, sampling rate, ...)
    #[serde(default)]
    pub options: BTreeMap<String, toml::Value>,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            id: RoomId(1234),
            description: "Roomcast room".to_string(),
            owner: false,
            secret: None,
            display: None,
            options: BTreeMap::new(),
        }
    }
}

impl RoomConfig {
    /// Copy of this room with the `record` creation option set
    pub fn with_record(&self, record: bool) -> Self {
        let mut room = self.clone();
        room.options
            .insert("record".to_string(), toml::Value::Boolean(record));
        room
    }

    pub fn records(&self) -> bool {
        matches!(self.options.get("record"), Some(toml::Value::Boolean(true)))
    }

    /// Extra creation options as JSON request fields
    pub fn request_options(&self) -> serde_json::Map<String, serde_json::Value> {
        self.options
            .iter()
            .filter_map(|(key, value)| {
                serde_json::to_value(value)
                    .ok()
                    .map(|value| (key.clone(), value))
            })
            .collect()
    }
}

/// Microphone producer defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MicrophoneConfig {
    pub volume: f32,
    pub play_through: bool,
}

impl Default for MicrophoneConfig {
    fn default() -> Self {
        Self {
            volume: 1.0,
            play_through: false,
        }
    }
}

/// Playlist producer defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaylistConfig {
    /// Local gain of the playlist
    pub volume: f32,

    /// Gain applied only to what goes into the room
    pub mix_volume: f32,

    /// Wrap around at either end of the list
    pub looping: bool,

    /// Monitor the playlist on the local speaker
    pub play_through: bool,
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            volume: 0.75,
            mix_volume: 0.5,
            looping: true,
            play_through: true,
        }
    }
}

/// Complete Roomcast configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomcastConfig {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub room: RoomConfig,
    #[serde(default)]
    pub microphone: MicrophoneConfig,
    #[serde(default)]
    pub playlist: PlaylistConfig,
}

impl RoomcastConfig {
    /// Load configuration from TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }

    /// Create factory default configuration
    pub fn factory_default() -> Self {
        let mut config = Self::default();
        config.room.owner = true;
        config.room.display = Some("roomcast".to_string());
        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.app.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample_rate must be positive".to_string()));
        }
        if self.app.channels == 0 {
            return Err(ConfigError::Invalid("channels must be positive".to_string()));
        }
        if self.app.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be positive".to_string()));
        }
        if self.server.plugin.is_empty() {
            return Err(ConfigError::Invalid("server.plugin must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Configuration manager for the main Roomcast config
///
/// Manages the configuration file at `~/.config/roomcast/config.toml`.
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("config.toml");

        Self {
            config_dir,
            config_path,
        }
    }

    /// Get the default config directory path
    ///
    /// Returns `~/.config/roomcast` on Linux, the platform equivalent elsewhere
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("roomcast"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration from file
    ///
    /// If the config file doesn't exist, returns factory default.
    /// If the config file is corrupt, logs an error, keeps a `.toml.corrupt`
    /// copy and returns factory default.
    #[instrument(skip(self))]
    pub async fn load(&self) -> RoomcastConfig {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, creating factory default"
            );

            let config = RoomcastConfig::factory_default();

            if let Err(e) = config.save_to_file(&self.config_path).await {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to save factory default config"
                );
            }

            return config;
        }

        match RoomcastConfig::load_from_file(&self.config_path).await {
            Ok(config) => config,
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to load config, using factory default"
                );

                let backup_path = self.config_path.with_extension("toml.corrupt");
                if let Err(copy_err) = fs::copy(&self.config_path, &backup_path).await {
                    error!(
                        path = %backup_path.display(),
                        error = %copy_err,
                        "Failed to backup corrupt config"
                    );
                }

                RoomcastConfig::factory_default()
            }
        }
    }

    #[instrument(skip(self, config))]
    pub async fn save(&self, config: &RoomcastConfig) -> Result<()> {
        fs::create_dir_all(&self.config_dir).await?;
        config.save_to_file(&self.config_path).await
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }
}
