//! Correlation of asynchronous replies with outstanding requests
//!
//! The plugin answers some requests with a later event instead of an inline
//! reply. Each such request registers a predicate here; every inbound message
//! is offered to the entries in registration order and resolves at most one.

use super::message::{BridgeMessage, InboundMessage};
use super::SessionError;
use std::fmt;
use tokio::sync::oneshot;
use tracing::trace;

/// Decides whether an inbound message answers a given request
pub type Predicate = Box<dyn Fn(&BridgeMessage) -> bool + Send + Sync>;

/// Outcome delivered to the waiting caller
pub type Reply = Result<InboundMessage, SessionError>;

/// Identifier of a registered request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingId(u64);

struct PendingRequest {
    id: PendingId,
    label: &'static str,
    predicate: Predicate,
    responder: oneshot::Sender<Reply>,
}

/// Ordered table of requests awaiting a matching event
#[derive(Default)]
pub struct PendingTable {
    next_id: u64,
    entries: Vec<PendingRequest>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and get the receiver its reply will arrive on
    pub fn register(
        &mut self,
        label: &'static str,
        predicate: Predicate,
    ) -> (PendingId, oneshot::Receiver<Reply>) {
        let id = PendingId(self.next_id);
        self.next_id += 1;
        let (responder, rx) = oneshot::channel();
        self.entries.push(PendingRequest {
            id,
            label,
            predicate,
            responder,
        });
        trace!(request = label, id = id.0, "registered pending request");
        (id, rx)
    }

    /// Resolve the earliest entry whose predicate accepts `message`
    pub fn resolve(&mut self, message: &InboundMessage) -> Option<PendingId> {
        let position = self
            .entries
            .iter()
            .position(|entry| (entry.predicate)(&message.body))?;
        let entry = self.entries.remove(position);
        trace!(request = entry.label, id = entry.id.0, verb = message.body.verb(), "resolved pending request");
        // The caller may have stopped waiting; that is not an error here
        let _ = entry.responder.send(Ok(message.clone()));
        Some(entry.id)
    }

    /// Drop an entry without resolving it
    pub fn cancel(&mut self, id: PendingId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.entries.len() != before
    }

    /// Reject every outstanding entry with `error`
    pub fn fail_all(&mut self, error: &SessionError) -> usize {
        let count = self.entries.len();
        for entry in self.entries.drain(..) {
            let _ = entry.responder.send(Err(error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Labels of outstanding entries in registration order
    pub fn labels(&self) -> Vec<&'static str> {
        self.entries.iter().map(|entry| entry.label).collect()
    }
}

impl fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTable")
            .field("entries", &self.labels())
            .finish()
    }
}
