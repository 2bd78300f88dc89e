//! Boundaries between the session engine and the outside world
//!
//! A [`SignalingTransport`] carries plugin messages to and from the backend.
//! A [`MediaNegotiator`] turns the local capture stream into an offer and
//! applies the backend's answer, surfacing the resulting streams as events.

use super::message::SessionDescription;
use super::Result;
use crate::domain::audio::MediaStream;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use tokio::sync::{broadcast, mpsc};

/// Backend identifier of an attached plugin handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Something that happened on the signaling channel
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Plugin payload, optionally carrying a media fragment
    Message {
        body: Value,
        jsep: Option<SessionDescription>,
    },
    /// The backend closed the handle or the session
    Closed { reason: String },
    /// The channel failed
    Error(String),
}

/// Stream of events from an open channel
pub type InboundEvents = mpsc::UnboundedReceiver<TransportEvent>;

#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Open the channel to `server`
    async fn open(&self, server: &str) -> Result<InboundEvents>;

    /// Attach a handle to `plugin` on the open channel
    async fn attach(&self, plugin: &str, opaque_id: &str) -> Result<HandleId>;

    /// Send a plugin message. Returns the inline reply body when the backend
    /// answers synchronously, or `None` for a bare acknowledgement.
    async fn send(&self, message: Value, jsep: Option<SessionDescription>) -> Result<Option<Value>>;

    /// Tear the channel down. Must be safe to call more than once.
    async fn close(&self);
}

/// Streams surfaced by media negotiation
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// Our outgoing stream is live
    LocalStream(MediaStream),
    /// Audio from the room is available
    RemoteStream(MediaStream),
}

#[async_trait]
pub trait MediaNegotiator: Send + Sync {
    /// Build an offer publishing `stream`
    async fn create_local_offer(&self, stream: &MediaStream) -> Result<SessionDescription>;

    /// Apply an answer or other fragment received from the backend
    async fn apply_remote_fragment(&self, fragment: SessionDescription) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent>;

    /// Drop any negotiated media
    async fn hangup(&self) {}
}
