//! Integration tests for a full client session
//!
//! A [`RoomClient`] runs against the in-process bridge with a constant
//! microphone and real media decoding, and the shared graph is rendered by
//! hand to check what reaches the room and the local speaker.

use crate::support::{client, write_constant_wav, ConstantMic};
use roomcast_core::domain::audio::AudioBuffer;
use roomcast_core::domain::producer::{SongStatus, TransportState};
use roomcast_core::domain::protocol::TransportEvent;
use roomcast_core::domain::{lock_graph, RoomState};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const BLOCK: usize = 256;

fn assert_level(samples: &[f32], expected: f32) {
    for sample in samples {
        assert!(
            (sample - expected).abs() < 1e-3,
            "expected {expected}, got {sample}"
        );
    }
}

// ============================================================================
// MIXING INTO THE ROOM
// ============================================================================

#[tokio::test]
async fn test_microphone_and_playlist_reach_the_room() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("intro.wav");
    write_constant_wav(&path, 48000, 1.0, 0.5);

    let mic = Arc::new(ConstantMic::new(0.2));
    let (client, _bridge) = client(true, mic.clone());
    client.start(false).await.unwrap();

    let mut microphone = client.create_microphone().unwrap();
    microphone.switch_on().await.unwrap();

    let playlist = client.create_playlist().unwrap();
    let added = playlist.add(&path);
    added.loaded.await.unwrap();

    let song = playlist.song(&added.id).unwrap();
    assert_eq!(song.status, SongStatus::Ready);
    assert_eq!(song.title, "intro");
    assert_eq!(song.artist, "Unknown Artist");
    assert!((song.duration_seconds.unwrap() - 1.0).abs() < 0.01);

    playlist.play(&added.id).await.unwrap();
    assert_eq!(playlist.snapshot().transport, TransportState::Playing);

    let block = lock_graph(client.graph()).render(BLOCK);
    // Microphone at full volume plus the playlist at volume times mix volume
    for ch in 0..block.capture.channel_count() {
        assert_level(block.capture.channel(ch), 0.2 + 0.5 * 0.75 * 0.5);
    }
    // Only the playlist is monitored locally
    for ch in 0..block.playback.channel_count() {
        assert_level(block.playback.channel(ch), 0.5 * 0.75);
    }

    microphone.switch_off();
    assert!(mic.released.load(Ordering::SeqCst));
    let block = lock_graph(client.graph()).render(BLOCK);
    assert_level(block.capture.channel(0), 0.5 * 0.75 * 0.5);

    client.stop().await;
}

#[tokio::test]
async fn test_playlist_mix_volume_only_affects_the_room() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bed.wav");
    write_constant_wav(&path, 44100, 0.5, 0.5);

    let (client, _bridge) = client(true, Arc::new(ConstantMic::new(0.0)));
    let playlist = client.create_playlist().unwrap();
    let added = playlist.add(&path);
    added.loaded.await.unwrap();
    playlist.play(&added.id).await.unwrap();

    playlist.set_mix_volume(0.0);
    let block = lock_graph(client.graph()).render(BLOCK);
    assert!(block.capture.is_silent());
    assert_level(block.playback.channel(0), 0.375);

    playlist.set_play_through(false);
    playlist.set_mix_volume(1.0);
    let block = lock_graph(client.graph()).render(BLOCK);
    assert!(block.playback.is_silent());
    assert_level(block.capture.channel(0), 0.375);
}

#[tokio::test]
async fn test_remote_audio_is_heard_but_not_sent_back() {
    let (client, bridge) = client(false, Arc::new(ConstantMic::new(0.1)));
    let mut changes = client.subscribe();
    client.start(false).await.unwrap();
    changes.wait_for(|s| s.has_remote_stream).await.unwrap();

    let mut microphone = client.create_microphone().unwrap();
    microphone.switch_on().await.unwrap();

    assert!(bridge.push_remote_audio(AudioBuffer::from_channels(vec![vec![0.3; BLOCK]; 2])));
    let block = lock_graph(client.graph()).render(BLOCK);
    assert_level(block.playback.channel(0), 0.3);
    assert_level(block.capture.channel(0), 0.1);

    client.set_volume(0.5);
    assert!(bridge.push_remote_audio(AudioBuffer::from_channels(vec![vec![0.3; BLOCK]; 2])));
    let block = lock_graph(client.graph()).render(BLOCK);
    assert_level(block.playback.channel(1), 0.15);
}

// ============================================================================
// ROOM LIFECYCLE
// ============================================================================

#[tokio::test]
async fn test_roster_reaches_client_state() {
    let (client, bridge) = client(false, Arc::new(ConstantMic::new(0.0)));
    let mut changes = client.subscribe();
    client.start(false).await.unwrap();
    let room = client.config().room.id;

    let state = client.state();
    assert!(state.streaming);
    assert_eq!(state.room_state, RoomState::Joined);
    // Guests join without transmitting until enabled
    let configure = bridge
        .requests()
        .into_iter()
        .rfind(|r| r["request"] == "configure")
        .unwrap();
    assert_eq!(configure["muted"], json!(true));

    client.enable_to_transmit().await.unwrap();
    let configure = bridge
        .requests()
        .into_iter()
        .rfind(|r| r["request"] == "configure")
        .unwrap();
    assert_eq!(configure["muted"], json!(false));

    bridge.inject(json!({
        "audiobridge": "event",
        "room": room,
        "participants": [{"id": 501, "display": "carol"}]
    }));
    changes
        .wait_for(|s| s.listeners.iter().any(|p| p.id.0 == 501))
        .await
        .unwrap();

    bridge.inject(json!({"audiobridge": "event", "room": room, "leaving": 501}));
    changes
        .wait_for(|s| s.listeners.iter().all(|p| p.id.0 != 501))
        .await
        .unwrap();

    client.stop().await;
    assert_eq!(client.state().room_state, RoomState::Closed);
    // Guests leave the room in place
    assert!(bridge.has_room(room));
}

#[tokio::test]
async fn test_owner_recording_flag_is_sent_on_create() {
    let (client, bridge) = client(true, Arc::new(ConstantMic::new(0.0)));
    client.start(true).await.unwrap();

    let create = bridge
        .requests()
        .into_iter()
        .find(|r| r["request"] == "create")
        .unwrap();
    assert_eq!(create["record"], json!(true));
    assert!(client.state().recording);

    client.stop().await;
    assert!(!bridge.has_room(client.config().room.id));
}

#[tokio::test]
async fn test_client_recovers_after_channel_failure() {
    let (client, bridge) = client(true, Arc::new(ConstantMic::new(0.0)));
    let mut changes = client.subscribe();
    client.start(false).await.unwrap();

    bridge.inject_transport(TransportEvent::Error("connection reset".to_string()));
    tokio::time::timeout(
        Duration::from_secs(2),
        changes.wait_for(|s| s.room_state == RoomState::Failed),
    )
    .await
    .expect("client never saw the failure")
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let state = client.state();
    assert_eq!(state.room_state, RoomState::Failed);
    assert!(!state.streaming);
    assert!(!bridge.is_open());

    client.start(false).await.unwrap();
    assert_eq!(client.state().room_state, RoomState::Joined);
    assert_eq!(bridge.open_count(), 2);
}
