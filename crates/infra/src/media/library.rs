//! Symphonia-backed [`MediaLibrary`]
//!
//! Probing reads tags, embedded artwork and the track length. Decoding reads
//! the whole file into planar `f32` and converts it to the graph rate. Both
//! run on the blocking pool.

use crate::audio::resample;
use async_trait::async_trait;
use roomcast_core::domain::audio::{
    AudioError, CoverImage, DecodedAudio, MediaLibrary, Result, SongMetadata, StreamConfig,
};
use std::fs::File;
use std::path::{Path, PathBuf};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, Track};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, MetadataRevision, StandardTagKey};
use symphonia::core::probe::{Hint, ProbeResult};
use tracing::{debug, instrument, warn};

/// Reads local files with Symphonia's default codec and format registry
#[derive(Debug, Default, Clone)]
pub struct SymphoniaLibrary;

impl SymphoniaLibrary {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaLibrary for SymphoniaLibrary {
    #[instrument(skip(self), fields(path = %path.display()))]
    async fn probe(&self, path: &Path) -> Result<SongMetadata> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || probe_file(&path))
            .await
            .map_err(|e| AudioError::DecodeError(format!("Probe task failed: {e}")))?
    }

    #[instrument(skip(self, target), fields(path = %path.display()))]
    async fn decode(&self, path: &Path, target: &StreamConfig) -> Result<DecodedAudio> {
        let path: PathBuf = path.to_path_buf();
        let target_rate = target.sample_rate.hz();
        tokio::task::spawn_blocking(move || decode_file(&path, target_rate))
            .await
            .map_err(|e| AudioError::DecodeError(format!("Decode task failed: {e}")))?
    }
}

fn open(path: &Path) -> Result<ProbeResult> {
    let file = File::open(path)
        .map_err(|e| AudioError::DecodeError(format!("{}: {e}", path.display())))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    // Build a hint from the file extension
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let format_opts = FormatOptions {
        enable_gapless: true,
        ..Default::default()
    };
    symphonia::default::get_probe()
        .format(&hint, mss, &format_opts, &MetadataOptions::default())
        .map_err(|e| AudioError::DecodeError(format!("Unsupported format: {e}")))
}

fn audio_track(reader: &dyn FormatReader) -> Result<Track> {
    reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .cloned()
        .ok_or_else(|| AudioError::DecodeError("No audio track".to_string()))
}

fn probe_file(path: &Path) -> Result<SongMetadata> {
    let mut probed = open(path)?;
    let track = audio_track(probed.format.as_ref())?;

    let mut metadata = SongMetadata {
        duration_seconds: match (track.codec_params.n_frames, track.codec_params.sample_rate) {
            (Some(frames), Some(rate)) if rate > 0 => Some(frames as f64 / rate as f64),
            _ => None,
        },
        ..SongMetadata::default()
    };

    // Tags found in the container take precedence over those found while
    // probing (ID3 ahead of an MP3 stream, for instance)
    if let Some(revision) = probed.format.metadata().current() {
        apply_revision(revision, &mut metadata);
    }
    if let Some(probe_metadata) = probed.metadata.get() {
        if let Some(revision) = probe_metadata.current() {
            apply_revision(revision, &mut metadata);
        }
    }

    debug!(
        title = ?metadata.title,
        artist = ?metadata.artist,
        duration = ?metadata.duration_seconds,
        "Probed media file"
    );
    Ok(metadata)
}

fn apply_revision(revision: &MetadataRevision, metadata: &mut SongMetadata) {
    for tag in revision.tags() {
        match tag.std_key {
            Some(StandardTagKey::TrackTitle) if metadata.title.is_none() => {
                metadata.title = Some(tag.value.to_string());
            }
            Some(StandardTagKey::Artist) if metadata.artist.is_none() => {
                metadata.artist = Some(tag.value.to_string());
            }
            _ => {}
        }
    }
    if metadata.cover.is_none() {
        metadata.cover = revision.visuals().first().map(|visual| CoverImage {
            media_type: visual.media_type.clone(),
            data: visual.data.to_vec(),
        });
    }
}

fn decode_file(path: &Path, target_rate: u32) -> Result<DecodedAudio> {
    let probed = open(path)?;
    let mut reader = probed.format;
    let track = audio_track(reader.as_ref())?;
    let track_id = track.id;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| AudioError::DecodeError(format!("Codec init failed: {e}")))?;

    let mut channels: Vec<Vec<f32>> = Vec::new();
    let mut source_rate = track.codec_params.sample_rate.unwrap_or(target_rate);

    loop {
        let packet = match reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(AudioError::DecodeError(format!("{e}"))),
        };

        // Skip packets that don't belong to our track
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(msg)) => {
                warn!(error = %msg, "Skipping corrupted audio packet");
                continue;
            }
            Err(e) => return Err(AudioError::DecodeError(format!("{e}"))),
        };

        let spec = *decoded.spec();
        let frames = decoded.frames();
        if frames == 0 {
            continue;
        }
        source_rate = spec.rate;
        let count = spec.channels.count().max(1);
        if channels.is_empty() {
            channels = vec![Vec::new(); count];
        }

        let mut samples = SampleBuffer::<f32>::new(frames as u64, spec);
        samples.copy_interleaved_ref(decoded);
        for frame in samples.samples().chunks(count) {
            for (channel, sample) in channels.iter_mut().zip(frame) {
                channel.push(*sample);
            }
        }
    }

    if channels.is_empty() {
        return Err(AudioError::DecodeError("No audio decoded".to_string()));
    }

    let frames = channels[0].len();
    debug!(frames, source_rate, target_rate, "Decoded media file");
    Ok(DecodedAudio {
        channels: resample(channels, source_rate, target_rate),
        sample_rate: target_rate,
    })
}
