//! Session protocol with a conference-room backend
//!
//! The [`SessionEngine`](engine::SessionEngine) owns the signaling channel and
//! the plugin handle, correlates asynchronous replies with the requests that
//! caused them, and keeps the room roster current. Transports and media
//! negotiation are plugged in through the traits in [`transport`].

pub mod engine;
pub mod loopback;
pub mod message;
pub mod pending;
pub mod transport;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use engine::{Request, SessionEngine, SessionEvent, SessionSnapshot};
pub use loopback::LoopbackBridge;
pub use message::{
    BridgeMessage, BridgeRequest, InboundMessage, Participant, ParticipantId, RoomId,
    SdpType, SessionDescription,
};
pub use transport::{HandleId, MediaEvent, MediaNegotiator, SignalingTransport, TransportEvent};

/// Errors surfaced by the session protocol
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    /// The signaling channel failed or was lost
    #[error("Transport error: {0}")]
    Transport(String),

    /// The backend refused a request
    #[error("Request '{request}' rejected: {reason}")]
    RequestRejected {
        request: String,
        code: Option<i64>,
        reason: String,
    },

    /// The backend reported an error outside of any request
    #[error("Backend error {code:?}: {message}")]
    Backend { code: Option<i64>, message: String },

    /// Local offer creation or remote answer application failed
    #[error("Media negotiation failed: {0}")]
    Negotiation(String),

    /// The session closed while the operation was outstanding
    #[error("Session closed")]
    Closed,

    /// No matching reply arrived in time
    #[error("Request '{0}' timed out")]
    Timeout(String),

    /// The operation is not valid in the current lifecycle state
    #[error("Invalid session state: expected {expected}, found {found:?}")]
    InvalidState {
        expected: &'static str,
        found: RoomState,
    },

    /// A request could not be serialized
    #[error("Failed to encode request: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Encode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Lifecycle of the session with the room backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomState {
    /// Channel not yet open or handle not attached
    #[default]
    Unattached,
    Attaching,
    Attached,
    Joining,
    Joined,
    Leaving,
    /// Orderly or forced shutdown completed
    Closed,
    /// Channel-level failure; recovering requires opening and attaching again
    Failed,
}
