//! Typed messages exchanged with the conference plugin
//!
//! Outbound requests are tagged by their `request` verb, inbound messages by
//! their `audiobridge` verb. Inbound payloads with an unrecognized verb parse
//! as [`BridgeMessage::Unknown`] so they still flow through correlation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Numeric room identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub u64);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric participant identifier assigned by the backend on join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub u64);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry of the room roster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    #[serde(default, rename = "display", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub setup: bool,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub talking: bool,
}

impl Participant {
    pub fn new(id: ParticipantId) -> Self {
        Self {
            id,
            display_name: None,
            setup: false,
            muted: false,
            talking: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A media negotiation fragment (offer or answer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Requests understood by the conference plugin
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "request", rename_all = "lowercase")]
pub enum BridgeRequest {
    Exists {
        room: RoomId,
    },
    Create {
        room: RoomId,
        description: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
        #[serde(flatten)]
        options: Map<String, Value>,
    },
    Destroy {
        room: RoomId,
        #[serde(skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },
    Join {
        room: RoomId,
        #[serde(skip_serializing_if = "Option::is_none")]
        display: Option<String>,
    },
    Configure {
        #[serde(flatten)]
        options: Map<String, Value>,
    },
    #[serde(rename = "listparticipants")]
    ListParticipants {
        room: RoomId,
    },
    Leave,
}

impl BridgeRequest {
    /// The `request` verb on the wire
    pub fn verb(&self) -> &'static str {
        match self {
            BridgeRequest::Exists { .. } => "exists",
            BridgeRequest::Create { .. } => "create",
            BridgeRequest::Destroy { .. } => "destroy",
            BridgeRequest::Join { .. } => "join",
            BridgeRequest::Configure { .. } => "configure",
            BridgeRequest::ListParticipants { .. } => "listparticipants",
            BridgeRequest::Leave => "leave",
        }
    }

    /// Whether the plugin answers with a later event rather than inline
    pub fn is_asynchronous(&self) -> bool {
        matches!(
            self,
            BridgeRequest::Join { .. } | BridgeRequest::Configure { .. } | BridgeRequest::Leave
        )
    }

    /// A configure request carrying only the `muted` flag
    pub fn set_muted(muted: bool) -> Self {
        let mut options = Map::new();
        options.insert("muted".to_string(), Value::Bool(muted));
        BridgeRequest::Configure { options }
    }
}

/// Messages emitted by the conference plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "audiobridge", rename_all = "kebab-case")]
pub enum BridgeMessage {
    Joined {
        #[serde(default)]
        room: Option<RoomId>,
        #[serde(default)]
        id: Option<ParticipantId>,
        #[serde(default)]
        participants: Option<Vec<Participant>>,
    },
    Created {
        #[serde(default)]
        room: Option<RoomId>,
        #[serde(default)]
        permanent: bool,
    },
    Destroyed {
        #[serde(default)]
        room: Option<RoomId>,
    },
    Success {
        #[serde(default)]
        room: Option<RoomId>,
        #[serde(default)]
        exists: Option<bool>,
    },
    Participants {
        #[serde(default)]
        room: Option<RoomId>,
        #[serde(default)]
        participants: Option<Vec<Participant>>,
    },
    Event {
        #[serde(default)]
        room: Option<RoomId>,
        #[serde(default)]
        participants: Option<Vec<Participant>>,
        #[serde(default)]
        leaving: Option<Value>,
        #[serde(default)]
        error_code: Option<i64>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        result: Option<String>,
    },
    Talking {
        #[serde(default)]
        room: Option<RoomId>,
        id: ParticipantId,
    },
    StoppedTalking {
        #[serde(default)]
        room: Option<RoomId>,
        id: ParticipantId,
    },
    Left {
        #[serde(default)]
        room: Option<RoomId>,
    },
    #[serde(other)]
    Unknown,
}

impl BridgeMessage {
    /// Parse a plugin payload. Anything unrecognized becomes `Unknown`.
    pub fn parse(body: &Value) -> Self {
        serde_json::from_value(body.clone()).unwrap_or(BridgeMessage::Unknown)
    }

    pub fn verb(&self) -> &'static str {
        match self {
            BridgeMessage::Joined { .. } => "joined",
            BridgeMessage::Created { .. } => "created",
            BridgeMessage::Destroyed { .. } => "destroyed",
            BridgeMessage::Success { .. } => "success",
            BridgeMessage::Participants { .. } => "participants",
            BridgeMessage::Event { .. } => "event",
            BridgeMessage::Talking { .. } => "talking",
            BridgeMessage::StoppedTalking { .. } => "stopped-talking",
            BridgeMessage::Left { .. } => "left",
            BridgeMessage::Unknown => "unknown",
        }
    }

    /// Roster entries carried by this message, if it has a participant list
    pub fn participants(&self) -> Option<&[Participant]> {
        match self {
            BridgeMessage::Joined { participants, .. }
            | BridgeMessage::Participants { participants, .. }
            | BridgeMessage::Event { participants, .. } => participants.as_deref(),
            _ => None,
        }
    }

    /// Participant announced as leaving, if any
    pub fn leaving(&self) -> Option<ParticipantId> {
        match self {
            BridgeMessage::Event {
                leaving: Some(value),
                ..
            } => value.as_u64().map(ParticipantId),
            _ => None,
        }
    }

    /// Error code and reason when this is an error-bearing event
    pub fn error(&self) -> Option<(Option<i64>, String)> {
        match self {
            BridgeMessage::Event {
                error: Some(error),
                error_code,
                ..
            } => Some((*error_code, error.clone())),
            BridgeMessage::Event {
                error: None,
                error_code: Some(code),
                ..
            } => Some((Some(*code), format!("error code {code}"))),
            _ => None,
        }
    }

    /// Whether this is the `result: ok` event acknowledging a configure
    pub fn is_ok_result(&self) -> bool {
        matches!(self, BridgeMessage::Event { result: Some(result), .. } if result == "ok")
    }
}

/// A parsed plugin message together with its raw payload and any media fragment
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub body: BridgeMessage,
    pub raw: Value,
    pub jsep: Option<SessionDescription>,
}

impl InboundMessage {
    pub fn new(raw: Value, jsep: Option<SessionDescription>) -> Self {
        Self {
            body: BridgeMessage::parse(&raw),
            raw,
            jsep,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let mut options = Map::new();
        options.insert("record".to_string(), json!(true));
        let create = BridgeRequest::Create {
            room: RoomId(1234),
            description: "demo".to_string(),
            secret: None,
            options,
        };
        assert_eq!(
            serde_json::to_value(&create).unwrap(),
            json!({"request": "create", "room": 1234, "description": "demo", "record": true})
        );

        assert_eq!(
            serde_json::to_value(BridgeRequest::ListParticipants { room: RoomId(7) }).unwrap(),
            json!({"request": "listparticipants", "room": 7})
        );
        assert_eq!(
            serde_json::to_value(BridgeRequest::set_muted(true)).unwrap(),
            json!({"request": "configure", "muted": true})
        );
        assert_eq!(
            serde_json::to_value(BridgeRequest::Leave).unwrap(),
            json!({"request": "leave"})
        );
    }

    #[test]
    fn test_asynchronous_verbs() {
        assert!(BridgeRequest::Join { room: RoomId(1), display: None }.is_asynchronous());
        assert!(BridgeRequest::set_muted(false).is_asynchronous());
        assert!(BridgeRequest::Leave.is_asynchronous());
        assert!(!BridgeRequest::Exists { room: RoomId(1) }.is_asynchronous());
        assert!(!BridgeRequest::Destroy { room: RoomId(1), secret: None }.is_asynchronous());
    }

    #[test]
    fn test_parse_joined_with_roster() {
        let message = BridgeMessage::parse(&json!({
            "audiobridge": "joined",
            "room": 1234,
            "id": 99,
            "participants": [{"id": 5, "display": "bob", "muted": true}]
        }));

        let roster = message.participants().unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].display_name.as_deref(), Some("bob"));
        assert!(roster[0].muted);
        assert!(matches!(
            message,
            BridgeMessage::Joined { id: Some(ParticipantId(99)), .. }
        ));
    }

    #[test]
    fn test_parse_event_fields() {
        let leaving = BridgeMessage::parse(&json!({"audiobridge": "event", "room": 1, "leaving": 5}));
        assert_eq!(leaving.leaving(), Some(ParticipantId(5)));
        assert!(leaving.error().is_none());

        let error = BridgeMessage::parse(&json!({
            "audiobridge": "event", "error_code": 485, "error": "No such room"
        }));
        assert_eq!(error.error(), Some((Some(485), "No such room".to_string())));

        let ok = BridgeMessage::parse(&json!({"audiobridge": "event", "result": "ok"}));
        assert!(ok.is_ok_result());
    }

    #[test]
    fn test_parse_unknown_verbs() {
        assert_eq!(
            BridgeMessage::parse(&json!({"audiobridge": "roomchanged", "room": 3})),
            BridgeMessage::Unknown
        );
        assert_eq!(BridgeMessage::parse(&json!({"videoroom": "joined"})), BridgeMessage::Unknown);
    }

    #[test]
    fn test_session_description_wire_format() {
        let jsep: SessionDescription =
            serde_json::from_value(json!({"type": "answer", "sdp": "v=0"})).unwrap();
        assert_eq!(jsep, SessionDescription::answer("v=0"));
    }
}
