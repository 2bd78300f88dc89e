//! In-process conference backend
//!
//! Implements both [`SignalingTransport`] and [`MediaNegotiator`] against an
//! in-memory room table that behaves like the audiobridge plugin: inline
//! replies for `exists`/`create`/`destroy`/`listparticipants`, later events
//! for `join`/`configure`/`leave`. Used by the test suites and the CLI demo.

use super::message::{Participant, ParticipantId, RoomId, SdpType, SessionDescription};
use super::transport::{
    HandleId, InboundEvents, MediaEvent, MediaNegotiator, SignalingTransport, TransportEvent,
};
use super::{Result, SessionError};
use crate::domain::audio::{AudioBuffer, MediaStream, MediaStreamWriter, StreamConfig};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

const REMOTE_QUEUE_BLOCKS: usize = 64;

#[derive(Debug, Default)]
struct LoopbackRoom {
    secret: Option<String>,
    participants: Vec<Participant>,
}

#[derive(Default)]
struct BridgeState {
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    handle: Option<HandleId>,
    next_id: u64,
    opens: usize,
    rooms: BTreeMap<RoomId, LoopbackRoom>,
    joined: Option<(RoomId, ParticipantId)>,
    log: Vec<Value>,
    refuse_open: bool,
    refuse_attach: bool,
    refuse_offer: bool,
    silent: bool,
    remote: Option<MediaStreamWriter>,
}

impl BridgeState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn push(&self, body: Value, jsep: Option<SessionDescription>) {
        if self.silent {
            trace!("loopback event suppressed");
            return;
        }
        if let Some(events) = &self.events {
            let _ = events.send(TransportEvent::Message { body, jsep });
        }
    }

    fn leave_current_room(&mut self) -> Option<RoomId> {
        let (room, id) = self.joined.take()?;
        if let Some(entry) = self.rooms.get_mut(&room) {
            entry.participants.retain(|p| p.id != id);
        }
        Some(room)
    }
}

/// In-memory stand-in for the conference backend and the media layer
pub struct LoopbackBridge {
    state: Mutex<BridgeState>,
    media: broadcast::Sender<MediaEvent>,
    config: StreamConfig,
}

fn error_event(code: i64, reason: impl Into<String>) -> Value {
    json!({"audiobridge": "event", "error_code": code, "error": reason.into()})
}

impl LoopbackBridge {
    pub fn new(config: StreamConfig) -> Self {
        let (media, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(BridgeState::default()),
            media,
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a room directly, with `participants` already inside
    pub fn add_room(&self, room: RoomId, participants: Vec<Participant>) {
        self.lock().rooms.insert(
            room,
            LoopbackRoom {
                secret: None,
                participants,
            },
        );
    }

    pub fn has_room(&self, room: RoomId) -> bool {
        self.lock().rooms.contains_key(&room)
    }

    pub fn room_participants(&self, room: RoomId) -> Vec<Participant> {
        self.lock()
            .rooms
            .get(&room)
            .map(|entry| entry.participants.clone())
            .unwrap_or_default()
    }

    /// Make the next `open` fail
    pub fn refuse_open(&self) {
        self.lock().refuse_open = true;
    }

    /// Make `attach` fail
    pub fn refuse_attach(&self) {
        self.lock().refuse_attach = true;
    }

    /// Make offer creation fail
    pub fn refuse_negotiation(&self) {
        self.lock().refuse_offer = true;
    }

    /// Stop emitting asynchronous events; requests waiting on them hang
    pub fn silence_events(&self) {
        self.lock().silent = true;
    }

    /// Deliver an unsolicited plugin message
    pub fn inject(&self, body: Value) {
        let state = self.lock();
        if let Some(events) = &state.events {
            let _ = events.send(TransportEvent::Message { body, jsep: None });
        }
    }

    /// Deliver a channel-level event
    pub fn inject_transport(&self, event: TransportEvent) {
        if let Some(events) = &self.lock().events {
            let _ = events.send(event);
        }
    }

    /// Every request received, in order
    pub fn requests(&self) -> Vec<Value> {
        self.lock().log.clone()
    }

    /// The `request` verb of every request received, in order
    pub fn request_verbs(&self) -> Vec<String> {
        self.lock()
            .log
            .iter()
            .filter_map(|request| request.get("request").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    pub fn is_open(&self) -> bool {
        self.lock().events.is_some()
    }

    /// Feed audio into the remote stream once an answer has been applied
    pub fn push_remote_audio(&self, block: AudioBuffer) -> bool {
        self.lock()
            .remote
            .as_ref()
            .is_some_and(|writer| writer.push(block))
    }

    fn handle_request(
        state: &mut BridgeState,
        request: &Value,
        jsep: Option<SessionDescription>,
    ) -> Option<Value> {
        let verb = request
            .get("request")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let room = request.get("room").and_then(Value::as_u64).map(RoomId);

        match (verb, room) {
            ("exists", Some(room)) => Some(json!({
                "audiobridge": "success",
                "room": room,
                "exists": state.rooms.contains_key(&room),
            })),
            ("create", Some(room)) => {
                if state.rooms.contains_key(&room) {
                    return Some(error_event(486, format!("Room {room} already exists")));
                }
                let secret = request.get("secret").and_then(Value::as_str).map(str::to_string);
                state.rooms.insert(
                    room,
                    LoopbackRoom {
                        secret,
                        participants: Vec::new(),
                    },
                );
                Some(json!({"audiobridge": "created", "room": room, "permanent": false}))
            }
            ("destroy", Some(room)) => {
                let Some(entry) = state.rooms.get(&room) else {
                    return Some(error_event(485, format!("No such room ({room})")));
                };
                let secret = request.get("secret").and_then(Value::as_str);
                if entry.secret.is_some() && entry.secret.as_deref() != secret {
                    return Some(error_event(487, "Unauthorized (wrong secret)"));
                }
                state.rooms.remove(&room);
                if state.joined.is_some_and(|(joined, _)| joined == room) {
                    state.joined = None;
                    state.push(json!({"audiobridge": "destroyed", "room": room}), None);
                }
                Some(json!({"audiobridge": "destroyed", "room": room}))
            }
            ("listparticipants", Some(room)) => match state.rooms.get(&room) {
                Some(entry) => Some(json!({
                    "audiobridge": "participants",
                    "room": room,
                    "participants": entry.participants,
                })),
                None => Some(error_event(485, format!("No such room ({room})"))),
            },
            ("join", Some(room)) => {
                if !state.rooms.contains_key(&room) {
                    state.push(error_event(485, format!("No such room ({room})")), None);
                    return None;
                }
                state.leave_current_room();
                let id = ParticipantId(state.next_id());
                let mut me = Participant::new(id);
                me.display_name = request
                    .get("display")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let others = state
                    .rooms
                    .get_mut(&room)
                    .map(|entry| {
                        let others = entry.participants.clone();
                        entry.participants.push(me);
                        others
                    })
                    .unwrap_or_default();
                state.joined = Some((room, id));
                state.push(
                    json!({"audiobridge": "joined", "room": room, "id": id, "participants": others}),
                    None,
                );
                None
            }
            ("configure", _) => {
                let Some((room, id)) = state.joined else {
                    state.push(error_event(484, "Can't configure (not in a room)"), None);
                    return None;
                };
                let muted = request.get("muted").and_then(Value::as_bool);
                if let (Some(muted), Some(entry)) = (muted, state.rooms.get_mut(&room)) {
                    if let Some(me) = entry.participants.iter_mut().find(|p| p.id == id) {
                        me.muted = muted;
                    }
                }
                let answer = jsep
                    .filter(|offer| offer.kind == SdpType::Offer)
                    .map(|_| SessionDescription::answer("v=0\r\ns=roomcast loopback answer\r\n"));
                state.push(
                    json!({"audiobridge": "event", "room": room, "result": "ok"}),
                    answer,
                );
                None
            }
            ("leave", _) => {
                let room = state.leave_current_room();
                state.push(json!({"audiobridge": "left", "room": room}), None);
                None
            }
            (verb, _) => Some(error_event(481, format!("Unknown request '{verb}'"))),
        }
    }
}

#[async_trait]
impl SignalingTransport for LoopbackBridge {
    async fn open(&self, server: &str) -> Result<InboundEvents> {
        let mut state = self.lock();
        if state.refuse_open {
            state.refuse_open = false;
            return Err(SessionError::Transport(format!("cannot reach {server}")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.events = Some(tx);
        state.opens += 1;
        debug!(server, "loopback channel open");
        Ok(rx)
    }

    async fn attach(&self, plugin: &str, _opaque_id: &str) -> Result<HandleId> {
        let mut state = self.lock();
        if state.events.is_none() {
            return Err(SessionError::Transport("channel is not open".to_string()));
        }
        if state.refuse_attach {
            return Err(SessionError::Transport(format!("no such plugin {plugin}")));
        }
        let handle = HandleId(state.next_id());
        state.handle = Some(handle);
        Ok(handle)
    }

    async fn send(&self, message: Value, jsep: Option<SessionDescription>) -> Result<Option<Value>> {
        let mut state = self.lock();
        if state.events.is_none() || state.handle.is_none() {
            return Err(SessionError::Transport("no attached handle".to_string()));
        }
        state.log.push(message.clone());
        Ok(Self::handle_request(&mut state, &message, jsep))
    }

    async fn close(&self) {
        let mut state = self.lock();
        state.leave_current_room();
        state.events = None;
        state.handle = None;
        state.remote = None;
    }
}

#[async_trait]
impl MediaNegotiator for LoopbackBridge {
    async fn create_local_offer(&self, stream: &MediaStream) -> Result<SessionDescription> {
        if self.lock().refuse_offer {
            return Err(SessionError::Negotiation("offer refused".to_string()));
        }
        let _ = self.media.send(MediaEvent::LocalStream(stream.clone()));
        Ok(SessionDescription::offer(format!(
            "v=0\r\ns=roomcast {}\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
            stream.id()
        )))
    }

    async fn apply_remote_fragment(&self, fragment: SessionDescription) -> Result<()> {
        if fragment.kind != SdpType::Answer {
            return Err(SessionError::Negotiation(format!(
                "unexpected {:?} from backend",
                fragment.kind
            )));
        }
        let (writer, stream) = MediaStream::channel("remote", self.config, REMOTE_QUEUE_BLOCKS);
        self.lock().remote = Some(writer);
        let _ = self.media.send(MediaEvent::RemoteStream(stream));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.media.subscribe()
    }

    async fn hangup(&self) {
        self.lock().remote = None;
    }
}
