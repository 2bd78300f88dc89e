//! Janus gateway over its REST interface
//!
//! Session and handle creation are plain POSTs. Asynchronous plugin events
//! arrive through a long-poll GET on the session endpoint, which a background
//! task keeps running until the channel is closed.

use reqwest::Client;
use roomcast_core::domain::protocol::transport::{
    HandleId, InboundEvents, SignalingTransport, TransportEvent,
};
use roomcast_core::domain::protocol::{Result, SessionDescription, SessionError};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

struct Connection {
    address: String,
    session: u64,
    handle: Option<HandleId>,
    poller: JoinHandle<()>,
}

/// [`SignalingTransport`] speaking the Janus HTTP API
pub struct JanusHttpTransport {
    client: Client,
    connection: Mutex<Option<Connection>>,
}

impl Default for JanusHttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl JanusHttpTransport {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            connection: Mutex::new(None),
        }
    }

    fn connection(&self) -> MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Session endpoint and attached handle, if any
    fn endpoint(&self) -> Result<(String, u64, Option<HandleId>)> {
        self.connection()
            .as_ref()
            .map(|c| (c.address.clone(), c.session, c.handle))
            .ok_or(SessionError::Closed)
    }

    async fn post(&self, url: &str, body: Value) -> Result<Value> {
        trace!(%url, %body, "POST");
        let reply = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?
            .error_for_status()
            .map_err(transport_error)?
            .json::<Value>()
            .await
            .map_err(transport_error)?;
        check_reply(reply)
    }
}

fn transaction() -> String {
    Uuid::new_v4().simple().to_string()
}

fn transport_error(err: reqwest::Error) -> SessionError {
    SessionError::Transport(err.to_string())
}

/// Reject gateway-level errors, pass everything else through
fn check_reply(reply: Value) -> Result<Value> {
    if reply["janus"] != "error" {
        return Ok(reply);
    }
    Err(SessionError::Backend {
        code: reply["error"]["code"].as_i64(),
        message: reply["error"]["reason"]
            .as_str()
            .unwrap_or("unknown gateway error")
            .to_string(),
    })
}

/// Identifier in the `data.id` field of a `success` reply
fn created_id(reply: &Value) -> Result<u64> {
    reply["data"]["id"]
        .as_u64()
        .ok_or_else(|| SessionError::Transport(format!("Reply without an id: {reply}")))
}

fn parse_jsep(message: &Value) -> Option<SessionDescription> {
    let jsep = message.get("jsep")?;
    match serde_json::from_value(jsep.clone()) {
        Ok(jsep) => Some(jsep),
        Err(err) => {
            warn!(error = %err, "Ignoring malformed media fragment");
            None
        }
    }
}

/// Inline plugin reply to a `message` POST. `None` for an acknowledgement
/// whose real answer follows as an event.
fn sync_reply(reply: &Value) -> Option<Value> {
    match reply["janus"].as_str() {
        Some("success") => reply
            .get("plugindata")
            .and_then(|p| p.get("data"))
            .cloned(),
        _ => None,
    }
}

/// Translate one long-poll message. Keepalives and media notifications are
/// not interesting to the session engine.
fn poll_event(message: &Value) -> Option<TransportEvent> {
    match message["janus"].as_str()? {
        "event" => {
            let body = message.get("plugindata")?.get("data")?.clone();
            Some(TransportEvent::Message {
                body,
                jsep: parse_jsep(message),
            })
        }
        "hangup" => Some(TransportEvent::Closed {
            reason: message["reason"].as_str().unwrap_or("hangup").to_string(),
        }),
        "detached" => Some(TransportEvent::Closed {
            reason: "handle detached".to_string(),
        }),
        "error" => Some(TransportEvent::Error(
            message["error"]["reason"]
                .as_str()
                .unwrap_or("gateway error")
                .to_string(),
        )),
        other => {
            trace!(kind = other, "Ignoring gateway notification");
            None
        }
    }
}

/// Long-poll the session until the gateway or the receiver goes away
async fn poll_events(
    client: Client,
    url: String,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    loop {
        let reply = match client.get(&url).send().await {
            Ok(response) => match response.error_for_status() {
                Ok(response) => response.json::<Value>().await,
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };
        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error = %err, "Long poll failed");
                let _ = events.send(TransportEvent::Error(err.to_string()));
                return;
            }
        };

        // With maxev the gateway may batch several messages in an array
        let messages = match reply {
            Value::Array(messages) => messages,
            single => vec![single],
        };
        for message in &messages {
            let Some(event) = poll_event(message) else {
                continue;
            };
            let closed = matches!(event, TransportEvent::Closed { .. });
            if events.send(event).is_err() {
                debug!("Event receiver dropped, stopping long poll");
                return;
            }
            if closed {
                return;
            }
        }
    }
}

#[async_trait]
impl SignalingTransport for JanusHttpTransport {
    #[instrument(skip(self))]
    async fn open(&self, server: &str) -> Result<InboundEvents> {
        let address = server.trim_end_matches('/').to_string();
        let reply = self
            .post(
                &address,
                json!({"janus": "create", "transaction": transaction()}),
            )
            .await?;
        let session = created_id(&reply)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let poller = tokio::spawn(poll_events(
            self.client.clone(),
            format!("{address}/{session}?maxev=1"),
            tx,
        ));

        let previous = self.connection().replace(Connection {
            address,
            session,
            handle: None,
            poller,
        });
        if let Some(previous) = previous {
            previous.poller.abort();
        }
        info!(session, "Gateway session created");
        Ok(rx)
    }

    #[instrument(skip(self))]
    async fn attach(&self, plugin: &str, opaque_id: &str) -> Result<HandleId> {
        let (address, session, _) = self.endpoint()?;
        let reply = self
            .post(
                &format!("{address}/{session}"),
                json!({
                    "janus": "attach",
                    "plugin": plugin,
                    "opaque_id": opaque_id,
                    "transaction": transaction(),
                }),
            )
            .await?;
        let handle = HandleId(created_id(&reply)?);
        if let Some(connection) = self.connection().as_mut() {
            connection.handle = Some(handle);
        }
        Ok(handle)
    }

    async fn send(&self, message: Value, jsep: Option<SessionDescription>) -> Result<Option<Value>> {
        let (address, session, handle) = self.endpoint()?;
        let handle = handle.ok_or(SessionError::Closed)?;
        let mut body = json!({
            "janus": "message",
            "body": message,
            "transaction": transaction(),
        });
        if let Some(jsep) = jsep {
            body["jsep"] = serde_json::to_value(jsep)?;
        }
        let reply = self
            .post(&format!("{address}/{session}/{handle}"), body)
            .await?;
        Ok(sync_reply(&reply))
    }

    async fn close(&self) {
        let Some(connection) = self.connection().take() else {
            return;
        };
        connection.poller.abort();
        let url = format!("{}/{}", connection.address, connection.session);
        match self
            .post(&url, json!({"janus": "destroy", "transaction": transaction()}))
            .await
        {
            Ok(_) => debug!(session = connection.session, "Gateway session destroyed"),
            Err(err) => debug!(error = %err, "Gateway session already gone"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomcast_core::domain::protocol::SdpType;

    #[test]
    fn test_created_id() {
        let reply = json!({"janus": "success", "transaction": "t", "data": {"id": 42}});
        assert_eq!(created_id(&reply).unwrap(), 42);
        assert!(created_id(&json!({"janus": "success"})).is_err());
    }

    #[test]
    fn test_gateway_error_is_rejected() {
        let reply = json!({
            "janus": "error",
            "error": {"code": 458, "reason": "No such session"}
        });
        assert_eq!(
            check_reply(reply).unwrap_err(),
            SessionError::Backend {
                code: Some(458),
                message: "No such session".to_string(),
            }
        );
        assert!(check_reply(json!({"janus": "ack"})).is_ok());
    }

    #[test]
    fn test_sync_reply_and_ack() {
        let success = json!({
            "janus": "success",
            "plugindata": {"plugin": "janus.plugin.audiobridge", "data": {"audiobridge": "success", "exists": true}}
        });
        assert_eq!(
            sync_reply(&success),
            Some(json!({"audiobridge": "success", "exists": true}))
        );
        assert_eq!(sync_reply(&json!({"janus": "ack"})), None);
    }

    #[test]
    fn test_event_with_answer() {
        let message = json!({
            "janus": "event",
            "sender": 7,
            "plugindata": {"data": {"audiobridge": "event", "result": "ok"}},
            "jsep": {"type": "answer", "sdp": "v=0"}
        });
        match poll_event(&message) {
            Some(TransportEvent::Message { body, jsep }) => {
                assert_eq!(body["result"], "ok");
                let jsep = jsep.unwrap();
                assert_eq!(jsep.kind, SdpType::Answer);
                assert_eq!(jsep.sdp, "v=0");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_hangup_and_noise() {
        assert_eq!(
            poll_event(&json!({"janus": "hangup", "reason": "DTLS alert"})),
            Some(TransportEvent::Closed {
                reason: "DTLS alert".to_string()
            })
        );
        assert_eq!(poll_event(&json!({"janus": "keepalive"})), None);
        assert_eq!(poll_event(&json!({"janus": "webrtcup"})), None);
        // An event without plugin data carries nothing for the engine
        assert_eq!(poll_event(&json!({"janus": "event"})), None);
    }

    #[tokio::test]
    async fn test_send_requires_open_session() {
        let transport = JanusHttpTransport::new();
        let err = transport.send(json!({"request": "exists"}), None).await;
        assert_eq!(err.unwrap_err(), SessionError::Closed);
        // Closing an unopened transport is a no-op
        transport.close().await;
    }
}
