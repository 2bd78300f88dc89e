//! Session engine: channel lifecycle, request correlation and roster upkeep
//!
//! Inbound traffic is handled by a single dispatcher task per open channel.
//! For every plugin message it, in order:
//! 1. resolves the earliest pending request whose predicate matches
//! 2. updates the roster (upsert on participant lists, removal on `leaving`)
//! 3. reacts to lifecycle signals (`destroyed` closes the session, error
//!    events are surfaced and abort a start in progress)
//! 4. forwards any media fragment to the negotiator

use super::message::{
    BridgeMessage, BridgeRequest, InboundMessage, Participant, ParticipantId, RoomId,
    SessionDescription,
};
use super::pending::{PendingTable, Predicate};
use super::transport::{
    HandleId, InboundEvents, MediaEvent, MediaNegotiator, SignalingTransport, TransportEvent,
};
use super::{Result, RoomState, SessionError};
use crate::domain::audio::MediaStream;
use crate::domain::config::{RoomConfig, RoomcastConfig, ServerConfig};
use crate::domain::state::StatePublisher;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;

/// Published view of the session
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub room_state: RoomState,
    pub initialized: bool,
    pub attaching: bool,
    pub attached: bool,
    pub starting: bool,
    pub streaming: bool,
    pub recording: bool,
    pub participant_id: Option<ParticipantId>,
    pub participants: Vec<Participant>,
}

/// Notifications emitted by the engine
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// This client joined the room
    Joined(Option<ParticipantId>),
    /// Any plugin message, after it has been processed
    Message(BridgeMessage),
    LocalStream(MediaStream),
    RemoteStream(MediaStream),
    Error(SessionError),
    Closed,
}

/// A plugin request together with how its reply is recognized
pub struct Request {
    label: &'static str,
    payload: Value,
    jsep: Option<SessionDescription>,
    correlated: bool,
    predicate: Predicate,
    timeout: Option<Duration>,
}

impl Request {
    /// Build from a typed request. Asynchronous verbs are correlated with a
    /// later event; the rest resolve from the inline reply.
    pub fn new(request: &BridgeRequest) -> Result<Self> {
        Ok(Self {
            label: request.verb(),
            payload: serde_json::to_value(request)?,
            jsep: None,
            correlated: request.is_asynchronous(),
            predicate: Box::new(|_| true),
            timeout: None,
        })
    }

    /// Build from an arbitrary payload, resolved from the inline reply
    pub fn raw(label: &'static str, payload: Value) -> Self {
        Self {
            label,
            payload,
            jsep: None,
            correlated: false,
            predicate: Box::new(|_| true),
            timeout: None,
        }
    }

    /// Accept only replies satisfying `predicate`
    pub fn matching(
        mut self,
        predicate: impl Fn(&BridgeMessage) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Box::new(predicate);
        self
    }

    pub fn correlated(mut self, correlated: bool) -> Self {
        self.correlated = correlated;
        self
    }

    pub fn with_jsep(mut self, jsep: SessionDescription) -> Self {
        self.jsep = Some(jsep);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Readiness {
    Pending,
    Ready,
    Failed(SessionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Closed,
    Opening,
    Open,
}

struct EngineCore {
    channel: ChannelState,
    generation: u64,
    handle: Option<HandleId>,
    pending: PendingTable,
    dispatcher: Option<JoinHandle<()>>,
}

struct EngineInner {
    server: ServerConfig,
    room: RoomConfig,
    default_timeout: Option<Duration>,
    transport: Arc<dyn SignalingTransport>,
    negotiator: Arc<dyn MediaNegotiator>,
    core: Mutex<EngineCore>,
    state: StatePublisher<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    ready: watch::Sender<Readiness>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(dispatcher) = core.dispatcher.take() {
            dispatcher.abort();
        }
    }
}

/// Client side of one session with the conference plugin
///
/// Cheap to clone; clones drive the same session.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<EngineInner>,
}

impl SessionEngine {
    pub fn new(
        config: &RoomcastConfig,
        transport: Arc<dyn SignalingTransport>,
        negotiator: Arc<dyn MediaNegotiator>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (ready, _) = watch::channel(Readiness::Pending);
        Self {
            inner: Arc::new(EngineInner {
                server: config.server.clone(),
                room: config.room.clone(),
                default_timeout: config.app.request_timeout(),
                transport,
                negotiator,
                core: Mutex::new(EngineCore {
                    channel: ChannelState::Closed,
                    generation: 0,
                    handle: None,
                    pending: PendingTable::new(),
                    dispatcher: None,
                }),
                state: StatePublisher::new(SessionSnapshot::default()),
                events,
                ready,
            }),
        }
    }

    fn core(&self) -> MutexGuard<'_, EngineCore> {
        self.inner.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, mutate: impl FnOnce(&mut SessionSnapshot)) -> bool {
        self.inner.state.update(mutate)
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// The room this session is configured for
    pub fn room(&self) -> &RoomConfig {
        &self.inner.room
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn room_state(&self) -> RoomState {
        self.inner.state.read(|s| s.room_state)
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.inner.state.read(|s| s.participants.clone())
    }

    pub fn is_open(&self) -> bool {
        self.core().channel == ChannelState::Open
    }

    pub fn is_attached(&self) -> bool {
        let core = self.core();
        core.channel == ChannelState::Open && core.handle.is_some()
    }

    /// Number of correlated requests still waiting for their event
    pub fn pending_requests(&self) -> usize {
        self.core().pending.len()
    }

    /// Open the signaling channel. Concurrent callers share one attempt and
    /// all observe its outcome.
    #[instrument(skip(self))]
    pub async fn open(&self) -> Result<()> {
        let generation = {
            let mut core = self.core();
            match core.channel {
                ChannelState::Open => return Ok(()),
                ChannelState::Opening => None,
                ChannelState::Closed => {
                    core.channel = ChannelState::Opening;
                    core.generation += 1;
                    self.inner.ready.send_replace(Readiness::Pending);
                    Some(core.generation)
                }
            }
        };
        let Some(generation) = generation else {
            return self.wait_ready().await;
        };

        let server = self.inner.server.address.clone();
        info!(server = %server, "Opening signaling channel");
        match self.inner.transport.open(&server).await {
            Ok(events) => {
                let media = self.inner.negotiator.subscribe();
                let dispatcher = tokio::spawn(dispatch(
                    Arc::downgrade(&self.inner),
                    generation,
                    events,
                    media,
                ));
                {
                    let mut core = self.core();
                    core.channel = ChannelState::Open;
                    core.dispatcher = Some(dispatcher);
                }
                self.set_state(|s| {
                    s.initialized = true;
                    s.room_state = RoomState::Unattached;
                });
                self.inner.ready.send_replace(Readiness::Ready);
                debug!("Signaling channel open");
                Ok(())
            }
            Err(err) => {
                let err = into_transport(err);
                warn!(error = %err, "Failed to open signaling channel");
                self.core().channel = ChannelState::Closed;
                self.set_state(|s| s.room_state = RoomState::Failed);
                self.inner.ready.send_replace(Readiness::Failed(err.clone()));
                self.emit(SessionEvent::Error(err.clone()));
                Err(err)
            }
        }
    }

    async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.inner.ready.subscribe();
        let outcome = rx
            .wait_for(|ready| *ready != Readiness::Pending)
            .await
            .map(|ready| ready.clone());
        match outcome {
            Ok(Readiness::Ready) => Ok(()),
            Ok(Readiness::Failed(err)) => Err(err),
            _ => Err(SessionError::Closed),
        }
    }

    /// Attach a handle to the configured plugin on the open channel
    #[instrument(skip(self))]
    pub async fn attach(&self) -> Result<HandleId> {
        {
            let core = self.core();
            if core.channel != ChannelState::Open {
                drop(core);
                return Err(SessionError::InvalidState {
                    expected: "open channel",
                    found: self.room_state(),
                });
            }
            if let Some(handle) = core.handle {
                return Ok(handle);
            }
        }
        let found = self.room_state();
        if found == RoomState::Attaching {
            return Err(SessionError::InvalidState {
                expected: "unattached",
                found,
            });
        }

        self.set_state(|s| {
            s.room_state = RoomState::Attaching;
            s.attaching = true;
        });
        let opaque_id = format!("roomcast-{}", Uuid::new_v4().simple());
        let plugin = &self.inner.server.plugin;
        match self.inner.transport.attach(plugin, &opaque_id).await {
            Ok(handle) => {
                self.core().handle = Some(handle);
                self.set_state(|s| {
                    s.room_state = RoomState::Attached;
                    s.attaching = false;
                    s.attached = true;
                });
                info!(%handle, plugin = %plugin, "Attached to plugin");
                Ok(handle)
            }
            Err(err) => {
                let err = into_transport(err);
                warn!(error = %err, plugin = %plugin, "Failed to attach");
                self.emit(SessionEvent::Error(err.clone()));
                self.teardown(RoomState::Failed).await;
                Err(err)
            }
        }
    }

    fn ensure_attached(&self, request: &'static str) -> Result<()> {
        if self.is_attached() {
            return Ok(());
        }
        debug!(request, "Request refused without an attached handle");
        Err(SessionError::InvalidState {
            expected: "attached handle",
            found: self.room_state(),
        })
    }

    /// Send a request and wait for the reply that satisfies its predicate
    pub async fn send_request(&self, request: Request) -> Result<InboundMessage> {
        let Request {
            label,
            payload,
            jsep,
            correlated,
            predicate,
            timeout,
        } = request;
        self.ensure_attached(label)?;

        if !correlated {
            debug!(request = label, "Sending request");
            let Some(body) = self.inner.transport.send(payload, jsep).await? else {
                return Ok(InboundMessage::new(Value::Null, None));
            };
            let message = InboundMessage::new(body, None);
            if message.body.error().is_none() && !predicate(&message.body) {
                return Err(SessionError::RequestRejected {
                    request: label.to_string(),
                    code: None,
                    reason: format!("unexpected reply '{}'", message.body.verb()),
                });
            }
            return check_reply(label, message);
        }

        let (id, rx) = self.core().pending.register(label, predicate);
        debug!(request = label, "Sending correlated request");
        if let Err(err) = self.inner.transport.send(payload, jsep).await {
            self.core().pending.cancel(id);
            return Err(err);
        }

        let reply = match timeout.or(self.inner.default_timeout) {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.core().pending.cancel(id);
                    warn!(request = label, timeout_ms = limit.as_millis() as u64, "Request timed out");
                    return Err(SessionError::Timeout(label.to_string()));
                }
            },
            None => rx.await,
        };
        check_reply(label, reply.unwrap_or(Err(SessionError::Closed))?)
    }

    /// [`send_request`](Self::send_request) followed by a mapping of the reply
    pub async fn send_request_with<T>(
        &self,
        request: Request,
        map: impl FnOnce(InboundMessage) -> T,
    ) -> Result<T> {
        self.send_request(request).await.map(map)
    }

    pub async fn room_exists(&self, room: RoomId) -> Result<bool> {
        let request = Request::new(&BridgeRequest::Exists { room })?
            .matching(|m| matches!(m, BridgeMessage::Success { exists: Some(_), .. }));
        self.send_request_with(request, |m| {
            matches!(m.body, BridgeMessage::Success { exists: Some(true), .. })
        })
        .await
    }

    #[instrument(skip(self, room), fields(room = %room.id))]
    pub async fn create_room(&self, room: &RoomConfig) -> Result<()> {
        let request = Request::new(&BridgeRequest::Create {
            room: room.id,
            description: room.description.clone(),
            secret: room.secret.clone(),
            options: room.request_options(),
        })?
        .matching(|m| matches!(m, BridgeMessage::Created { .. }));
        self.send_request(request).await?;
        info!("Room created");
        Ok(())
    }

    #[instrument(skip(self, room), fields(room = %room.id))]
    pub async fn destroy_room(&self, room: &RoomConfig) -> Result<()> {
        let request = Request::new(&BridgeRequest::Destroy {
            room: room.id,
            secret: room.secret.clone(),
        })?
        .matching(|m| matches!(m, BridgeMessage::Destroyed { .. }));
        self.send_request(request).await?;
        info!("Room destroyed");
        Ok(())
    }

    /// Join `room`, returning the id the backend assigned to this client
    #[instrument(skip(self, room), fields(room = %room.id))]
    pub async fn join_room(&self, room: &RoomConfig) -> Result<Option<ParticipantId>> {
        let request = Request::new(&BridgeRequest::Join {
            room: room.id,
            display: room.display.clone(),
        })?
        .matching(|m| {
            matches!(m, BridgeMessage::Joined { id: Some(_), .. }) || m.error().is_some()
        });

        self.set_state(|s| s.room_state = RoomState::Joining);
        match self.send_request(request).await {
            Ok(message) => {
                let id = match message.body {
                    BridgeMessage::Joined { id, .. } => id,
                    _ => None,
                };
                self.set_state(|s| {
                    s.room_state = RoomState::Joined;
                    s.participant_id = id;
                });
                info!(participant = ?id, "Joined room");
                self.emit(SessionEvent::Joined(id));
                Ok(id)
            }
            Err(err) => {
                self.set_state(|s| {
                    if s.room_state == RoomState::Joining {
                        s.room_state = RoomState::Attached;
                    }
                });
                Err(err)
            }
        }
    }

    /// Publish `stream` into the room. Owners publish unmuted, everyone else
    /// starts muted.
    #[instrument(skip(self, stream), fields(stream = stream.id()))]
    pub async fn offer_media(&self, stream: &MediaStream) -> Result<()> {
        let offer = self
            .inner
            .negotiator
            .create_local_offer(stream)
            .await
            .map_err(into_negotiation)?;
        let request = Request::new(&BridgeRequest::set_muted(!self.inner.room.owner))?
            .with_jsep(offer)
            .matching(|m| m.is_ok_result() || m.error().is_some());
        self.send_request(request).await?;
        debug!("Media offer accepted");
        Ok(())
    }

    pub async fn mute(&self) -> Result<()> {
        self.configure_muted(true).await
    }

    pub async fn unmute(&self) -> Result<()> {
        self.configure_muted(false).await
    }

    async fn configure_muted(&self, muted: bool) -> Result<()> {
        let request = Request::new(&BridgeRequest::set_muted(muted))?
            .matching(|m| m.is_ok_result() || m.error().is_some());
        self.send_request(request).await?;
        debug!(muted, "Configured mute state");
        Ok(())
    }

    /// Send arbitrary configure options
    pub async fn configure(&self, options: Map<String, Value>) -> Result<()> {
        let request = Request::new(&BridgeRequest::Configure { options })?
            .matching(|m| m.is_ok_result() || m.error().is_some());
        self.send_request(request).await.map(|_| ())
    }

    /// Fetch the roster of `room`. For this session's room the published
    /// roster is replaced with the result.
    pub async fn list_participants(&self, room: RoomId) -> Result<Vec<Participant>> {
        let request = Request::new(&BridgeRequest::ListParticipants { room })?
            .matching(|m| matches!(m, BridgeMessage::Participants { .. }));
        let participants = self
            .send_request_with(request, |m| {
                m.body.participants().map(<[Participant]>::to_vec).unwrap_or_default()
            })
            .await?;
        if room == self.inner.room.id {
            let roster = participants.clone();
            self.set_state(|s| s.participants = roster);
        }
        Ok(participants)
    }

    /// Leave the room and close the channel. Owners destroy the room first.
    /// Safe to call in any state, any number of times.
    #[instrument(skip(self))]
    pub async fn leave(&self) {
        if self.is_attached() {
            self.set_state(|s| s.room_state = RoomState::Leaving);
            if self.inner.room.owner {
                if let Err(err) = self.destroy_room(&self.inner.room).await {
                    warn!(error = %err, "Failed to destroy room while leaving");
                }
            }
        }
        self.teardown(RoomState::Closed).await;
    }

    /// Alias of [`leave`](Self::leave) used on final shutdown
    pub async fn destroy(&self) {
        self.leave().await;
    }

    pub(crate) fn set_starting(&self, starting: bool) {
        self.set_state(|s| s.starting = starting);
    }

    pub(crate) fn mark_streaming(&self, recording: bool) {
        self.set_state(|s| {
            s.starting = false;
            s.streaming = true;
            s.recording = recording;
        });
    }

    async fn teardown(&self, final_state: RoomState) {
        let (was_open, dispatcher, failed) = {
            let mut core = self.core();
            let was_open = core.channel != ChannelState::Closed;
            core.channel = ChannelState::Closed;
            // Signals still queued from the channel being torn down are stale
            core.generation += 1;
            core.handle = None;
            let failed = core.pending.fail_all(&SessionError::Closed);
            (was_open, core.dispatcher.take(), failed)
        };
        if failed > 0 {
            debug!(count = failed, "Failed outstanding requests");
        }
        if was_open {
            self.inner.transport.close().await;
            self.inner.negotiator.hangup().await;
        }
        self.inner.ready.send_replace(Readiness::Pending);

        let changed = self.set_state(|s| {
            *s = SessionSnapshot {
                room_state: final_state,
                ..SessionSnapshot::default()
            }
        });
        if was_open || changed {
            info!(state = ?final_state, "Session closed");
            self.emit(SessionEvent::Closed);
        }
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }
    }

    /// Shut down in response to the backend, unless a newer channel has
    /// replaced the one the signal came from
    async fn close_from_backend(&self, generation: u64, final_state: RoomState) {
        if self.core().generation != generation {
            return;
        }
        self.teardown(final_state).await;
    }

    async fn handle_transport_event(&self, generation: u64, event: TransportEvent) {
        match event {
            TransportEvent::Message { body, jsep } => {
                self.handle_message(generation, InboundMessage::new(body, jsep))
                    .await;
            }
            TransportEvent::Closed { reason } => {
                info!(%reason, "Backend closed the session");
                self.close_from_backend(generation, RoomState::Closed).await;
            }
            TransportEvent::Error(reason) => {
                let err = SessionError::Transport(reason);
                warn!(error = %err, "Signaling channel failed");
                self.emit(SessionEvent::Error(err));
                self.close_from_backend(generation, RoomState::Failed).await;
            }
        }
    }

    async fn handle_message(&self, generation: u64, message: InboundMessage) {
        trace!(verb = message.body.verb(), "Inbound message");

        self.core().pending.resolve(&message);

        self.apply_roster(&message.body);

        let mut close = false;
        match &message.body {
            BridgeMessage::Destroyed { room } => {
                info!(room = ?room, "Room destroyed");
                close = true;
            }
            body => {
                if let Some((code, reason)) = body.error() {
                    let err = SessionError::Backend {
                        code,
                        message: reason,
                    };
                    warn!(error = %err, "Backend reported an error");
                    self.emit(SessionEvent::Error(err));
                    if self.inner.state.read(|s| s.starting) {
                        let engine = self.clone();
                        tokio::spawn(async move { engine.leave().await });
                    }
                }
            }
        }

        if let Some(jsep) = message.jsep.clone() {
            if let Err(err) = self.inner.negotiator.apply_remote_fragment(jsep).await {
                let err = into_negotiation(err);
                warn!(error = %err, "Failed to apply remote description");
                self.emit(SessionEvent::Error(err));
            }
        }

        self.emit(SessionEvent::Message(message.body));
        if close {
            self.close_from_backend(generation, RoomState::Closed).await;
        }
    }

    fn apply_roster(&self, body: &BridgeMessage) {
        if let Some(list) = body.participants() {
            self.set_state(|s| {
                for participant in list {
                    match s.participants.iter_mut().find(|p| p.id == participant.id) {
                        Some(existing) => *existing = participant.clone(),
                        None => s.participants.push(participant.clone()),
                    }
                }
            });
        } else if let Some(id) = body.leaving() {
            self.set_state(|s| s.participants.retain(|p| p.id != id));
        }

        let talking = match body {
            BridgeMessage::Talking { id, .. } => Some((*id, true)),
            BridgeMessage::StoppedTalking { id, .. } => Some((*id, false)),
            _ => None,
        };
        if let Some((id, talking)) = talking {
            self.set_state(|s| {
                if let Some(participant) = s.participants.iter_mut().find(|p| p.id == id) {
                    participant.talking = talking;
                }
            });
        }
    }

    fn relay_media(&self, event: MediaEvent) {
        match event {
            MediaEvent::LocalStream(stream) => {
                debug!(stream = stream.id(), "Local stream ready");
                self.emit(SessionEvent::LocalStream(stream));
            }
            MediaEvent::RemoteStream(stream) => {
                debug!(stream = stream.id(), "Remote stream ready");
                self.emit(SessionEvent::RemoteStream(stream));
            }
        }
    }
}

fn check_reply(label: &'static str, message: InboundMessage) -> Result<InboundMessage> {
    match message.body.error() {
        Some((code, reason)) => Err(SessionError::RequestRejected {
            request: label.to_string(),
            code,
            reason,
        }),
        None => Ok(message),
    }
}

/// Channel setup failures are transport failures, whatever the gateway said
fn into_transport(err: SessionError) -> SessionError {
    match err {
        SessionError::Transport(_) => err,
        other => SessionError::Transport(other.to_string()),
    }
}

fn into_negotiation(err: SessionError) -> SessionError {
    match err {
        SessionError::Negotiation(_) => err,
        other => SessionError::Negotiation(other.to_string()),
    }
}

/// Inbound event loop for one open channel
async fn dispatch(
    weak: Weak<EngineInner>,
    generation: u64,
    mut events: InboundEvents,
    mut media: broadcast::Receiver<MediaEvent>,
) {
    let mut media_open = true;
    loop {
        tokio::select! {
            biased;

            event = events.recv() => {
                let Some(inner) = weak.upgrade() else { break };
                let engine = SessionEngine { inner };
                match event {
                    Some(event) => engine.handle_transport_event(generation, event).await,
                    None => {
                        debug!("Signaling channel ended");
                        engine.close_from_backend(generation, RoomState::Closed).await;
                        break;
                    }
                }
            }

            event = media.recv(), if media_open => {
                let Some(inner) = weak.upgrade() else { break };
                match event {
                    Ok(event) => SessionEngine { inner }.relay_media(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Media events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => media_open = false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::protocol::loopback::LoopbackBridge;
    use async_trait::async_trait;
    use serde_json::json;

    fn config(owner: bool) -> RoomcastConfig {
        let mut config = RoomcastConfig::default();
        config.room.owner = owner;
        config.app.request_timeout_secs = 5;
        config
    }

    fn engine(owner: bool) -> (SessionEngine, Arc<LoopbackBridge>) {
        let bridge = Arc::new(LoopbackBridge::new(RoomcastConfig::default().app.stream_config()));
        let engine = SessionEngine::new(&config(owner), bridge.clone(), bridge.clone());
        (engine, bridge)
    }

    async fn attached(owner: bool) -> (SessionEngine, Arc<LoopbackBridge>) {
        let (engine, bridge) = engine(owner);
        engine.open().await.unwrap();
        engine.attach().await.unwrap();
        (engine, bridge)
    }

    /// Gateway that answers channel setup with a plugin-level error
    struct RejectingGateway {
        bridge: Arc<LoopbackBridge>,
        reject_open: bool,
    }

    impl RejectingGateway {
        fn rejection() -> SessionError {
            SessionError::Backend {
                code: Some(460),
                message: "plugin not available".to_string(),
            }
        }
    }

    #[async_trait]
    impl SignalingTransport for RejectingGateway {
        async fn open(&self, server: &str) -> Result<InboundEvents> {
            if self.reject_open {
                return Err(Self::rejection());
            }
            self.bridge.open(server).await
        }

        async fn attach(&self, _plugin: &str, _opaque_id: &str) -> Result<HandleId> {
            Err(Self::rejection())
        }

        async fn send(
            &self,
            message: Value,
            jsep: Option<SessionDescription>,
        ) -> Result<Option<Value>> {
            self.bridge.send(message, jsep).await
        }

        async fn close(&self) {
            self.bridge.close().await;
        }
    }

    fn rejecting(reject_open: bool) -> SessionEngine {
        let bridge = Arc::new(LoopbackBridge::new(RoomcastConfig::default().app.stream_config()));
        let gateway = Arc::new(RejectingGateway {
            bridge: bridge.clone(),
            reject_open,
        });
        SessionEngine::new(&config(false), gateway, bridge)
    }

    #[tokio::test]
    async fn test_requests_require_attach() {
        let (engine, _bridge) = engine(false);
        let err = engine.room_exists(RoomId(1)).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidState { .. }));

        engine.open().await.unwrap();
        let err = engine.room_exists(RoomId(1)).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_open_shares_attempt() {
        let (engine, bridge) = engine(false);
        let (a, b) = tokio::join!(engine.open(), engine.open());
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(bridge.open_count(), 1);
        assert!(engine.snapshot().initialized);
    }

    #[tokio::test]
    async fn test_open_failure_is_surfaced() {
        let (engine, bridge) = engine(false);
        bridge.refuse_open();
        let mut events = engine.events();

        assert!(matches!(engine.open().await, Err(SessionError::Transport(_))));
        assert_eq!(engine.room_state(), RoomState::Failed);
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Error(_)));
    }

    #[tokio::test]
    async fn test_attach_failure_fails_session() {
        let (engine, bridge) = engine(false);
        bridge.refuse_attach();
        engine.open().await.unwrap();

        assert!(engine.attach().await.is_err());
        assert_eq!(engine.room_state(), RoomState::Failed);
        assert!(!engine.is_open());
    }

    #[tokio::test]
    async fn test_create_exists_destroy() {
        let (engine, _bridge) = attached(true).await;
        let room = engine.room().clone();

        assert!(!engine.room_exists(room.id).await.unwrap());
        engine.create_room(&room).await.unwrap();
        assert!(engine.room_exists(room.id).await.unwrap());
        engine.destroy_room(&room).await.unwrap();
        assert!(!engine.room_exists(room.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_twice_is_rejected() {
        let (engine, _bridge) = attached(true).await;
        let room = engine.room().clone();
        engine.create_room(&room).await.unwrap();

        let err = engine.create_room(&room).await.unwrap_err();
        assert!(matches!(err, SessionError::RequestRejected { code: Some(486), .. }));
    }

    #[tokio::test]
    async fn test_join_updates_roster() {
        let (engine, bridge) = attached(false).await;
        let room = engine.room().clone();
        let mut other = Participant::new(ParticipantId(500));
        other.display_name = Some("alice".to_string());
        bridge.add_room(room.id, vec![other]);

        let id = engine.join_room(&room).await.unwrap();

        assert!(id.is_some());
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.room_state, RoomState::Joined);
        assert_eq!(snapshot.participant_id, id);
        assert_eq!(snapshot.participants.len(), 1);
        assert_eq!(snapshot.participants[0].display_name.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_join_missing_room_is_rejected() {
        let (engine, _bridge) = attached(false).await;
        let room = engine.room().clone();

        let err = engine.join_room(&room).await.unwrap_err();
        assert!(matches!(err, SessionError::RequestRejected { code: Some(485), .. }));
        assert_eq!(engine.room_state(), RoomState::Attached);
    }

    #[tokio::test]
    async fn test_roster_upsert_and_leaving() {
        let (engine, bridge) = attached(false).await;
        let room = engine.room().clone();
        bridge.add_room(room.id, Vec::new());
        engine.join_room(&room).await.unwrap();
        let mut changes = engine.subscribe();

        bridge.inject(json!({"audiobridge": "event", "room": room.id, "participants": [{"id": 7, "display": "bob"}]}));
        changes.wait_for(|s| s.participants.len() == 1).await.unwrap();

        bridge.inject(json!({"audiobridge": "event", "room": room.id, "participants": [{"id": 7, "display": "bob", "muted": true}]}));
        changes.wait_for(|s| s.participants.first().is_some_and(|p| p.muted)).await.unwrap();

        bridge.inject(json!({"audiobridge": "talking", "room": room.id, "id": 7}));
        changes.wait_for(|s| s.participants[0].talking).await.unwrap();

        bridge.inject(json!({"audiobridge": "event", "room": room.id, "leaving": 7}));
        changes.wait_for(|s| s.participants.is_empty()).await.unwrap();
    }

    #[tokio::test]
    async fn test_correlated_request_times_out() {
        let (engine, bridge) = attached(false).await;
        bridge.silence_events();

        let request = Request::new(&BridgeRequest::Leave)
            .unwrap()
            .with_timeout(Duration::from_millis(50));
        let err = engine.send_request(request).await.unwrap_err();

        assert_eq!(err, SessionError::Timeout("leave".to_string()));
        assert_eq!(engine.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_leave_fails_pending_and_is_idempotent() {
        let (engine, bridge) = attached(false).await;
        bridge.silence_events();

        let waiting = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .send_request(Request::new(&BridgeRequest::Leave).unwrap())
                    .await
            })
        };
        while engine.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }

        engine.leave().await;
        assert_eq!(waiting.await.unwrap(), Err(SessionError::Closed));
        assert_eq!(engine.room_state(), RoomState::Closed);

        engine.leave().await;
        engine.leave().await;
        assert_eq!(engine.room_state(), RoomState::Closed);
        assert!(!bridge.is_open());
    }

    #[tokio::test]
    async fn test_owner_leave_destroys_room() {
        let (engine, bridge) = attached(true).await;
        let room = engine.room().clone();
        engine.create_room(&room).await.unwrap();

        engine.leave().await;

        assert!(!bridge.has_room(room.id));
        assert_eq!(bridge.request_verbs().last().map(String::as_str), Some("destroy"));
    }

    #[tokio::test]
    async fn test_backend_destroy_closes_session() {
        let (engine, bridge) = attached(false).await;
        let room = engine.room().clone();
        bridge.add_room(room.id, Vec::new());
        engine.join_room(&room).await.unwrap();
        let mut changes = engine.subscribe();

        bridge.inject(json!({"audiobridge": "destroyed", "room": room.id}));

        changes.wait_for(|s| s.room_state == RoomState::Closed).await.unwrap();
        assert!(!engine.is_open());
    }

    #[tokio::test]
    async fn test_error_event_is_emitted() {
        let (engine, bridge) = attached(false).await;
        let mut events = engine.events();

        bridge.inject(json!({"audiobridge": "event", "error_code": 490, "error": "boom"}));

        loop {
            match events.recv().await.unwrap() {
                SessionEvent::Error(SessionError::Backend { code, message }) => {
                    assert_eq!(code, Some(490));
                    assert_eq!(message, "boom");
                    break;
                }
                _ => continue,
            }
        }
        assert!(engine.is_open());
    }

    #[tokio::test]
    async fn test_list_participants_replaces_roster() {
        let (engine, bridge) = attached(false).await;
        let room = engine.room().clone();
        bridge.add_room(
            room.id,
            vec![Participant::new(ParticipantId(1)), Participant::new(ParticipantId(2))],
        );

        let roster = engine.list_participants(room.id).await.unwrap();

        assert_eq!(roster.len(), 2);
        assert_eq!(engine.participants(), roster);
    }

    #[tokio::test]
    async fn test_transport_error_leaves_session_failed() {
        let (engine, bridge) = attached(false).await;
        let mut changes = engine.subscribe();

        bridge.inject_transport(TransportEvent::Error("connection reset".to_string()));

        tokio::time::timeout(
            Duration::from_secs(2),
            changes.wait_for(|s| s.room_state == RoomState::Failed),
        )
        .await
        .expect("session never failed")
        .unwrap();
        // The closed channel must not overwrite the failure afterwards
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.room_state(), RoomState::Failed);
        assert!(!engine.is_open());
        assert!(!bridge.is_open());
    }

    #[tokio::test]
    async fn test_open_rejection_is_a_transport_error() {
        let engine = rejecting(true);
        let err = engine.open().await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)), "{err:?}");
        assert_eq!(engine.room_state(), RoomState::Failed);
    }

    #[tokio::test]
    async fn test_attach_rejection_is_a_transport_error() {
        let engine = rejecting(false);
        engine.open().await.unwrap();

        let err = engine.attach().await.unwrap_err();
        match err {
            SessionError::Transport(message) => assert!(message.contains("plugin not available")),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(engine.room_state(), RoomState::Failed);
    }

    #[tokio::test]
    async fn test_error_while_starting_closes_channel() {
        let (engine, bridge) = attached(false).await;
        let mut changes = engine.subscribe();
        engine.set_starting(true);

        bridge.inject(json!({"audiobridge": "event", "error_code": 490, "error": "no such room"}));

        tokio::time::timeout(
            Duration::from_secs(2),
            changes.wait_for(|s| s.room_state == RoomState::Closed),
        )
        .await
        .expect("session never closed")
        .unwrap();
        assert!(!engine.is_open());
        assert!(!bridge.is_open());
    }
}
