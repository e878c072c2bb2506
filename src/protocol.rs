//! Binary wire protocol between clients and the authority.
//!
//! Wire format (bincode-encoded):
//! ```text
//! client ──► ClientFrame { seq, request }
//! client ◄── ServerFrame::Reply { seq, result }      (exactly one per request)
//! client ◄── ServerFrame::Event(Event)               (broadcast, all clients)
//! ```
//!
//! Every request is acknowledged exactly once, correlated by `seq`.
//! Broadcast events carry well-known topics of the form
//! `<resource>:<kind>`, e.g. `card:update`.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The five remote event kinds a resource exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Create,
    Update,
    Delete,
    Lock,
    Unlock,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
            EventKind::Lock => "lock",
            EventKind::Unlock => "unlock",
        }
    }
}

/// A named remote event: resource plus kind, rendered as `card:update`.
///
/// Topics are the keys of the channel's subscription registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    pub resource: String,
    pub kind: EventKind,
}

impl Topic {
    pub fn new(resource: impl Into<String>, kind: EventKind) -> Self {
        Self {
            resource: resource.into(),
            kind,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.kind.as_str())
    }
}

/// Canonical record payload as the authority stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordBody {
    pub id: Uuid,
    pub title: String,
    pub order: i64,
    pub done: bool,
    /// Creation time, epoch milliseconds.
    pub created_ms: u64,
    /// Optional due time, epoch milliseconds.
    pub due_ms: Option<u64>,
}

impl RecordBody {
    /// View this body as a full patch (every field present).
    pub fn as_patch(&self) -> RecordPatch {
        RecordPatch {
            id: Some(self.id),
            title: Some(self.title.clone()),
            order: Some(self.order),
            done: Some(self.done),
            created_ms: Some(self.created_ms),
            due_ms: self.due_ms,
        }
    }
}

/// Partial record attributes. `None` means "leave unchanged".
///
/// This is both the merge unit for local `set` calls and the payload of
/// create/update traffic on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    pub id: Option<Uuid>,
    pub title: Option<String>,
    pub order: Option<i64>,
    pub done: Option<bool>,
    pub created_ms: Option<u64>,
    pub due_ms: Option<u64>,
}

impl RecordPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Patch carrying only a title.
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    /// Patch carrying only a completion flag.
    pub fn done(done: bool) -> Self {
        Self {
            done: Some(done),
            ..Self::default()
        }
    }
}

/// Client intent sent to the authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Connection handshake: announces the client and the resources it
    /// will follow. Answered with [`ReplyBody::Welcome`].
    Hello {
        client_id: Uuid,
        resources: Vec<String>,
    },
    /// Fetch the current record set for a resource.
    Fetch { resource: String },
    Create {
        resource: String,
        attrs: RecordPatch,
    },
    Update {
        resource: String,
        id: Uuid,
        attrs: RecordPatch,
    },
    Delete { resource: String, id: Uuid },
    Lock { resource: String, id: Uuid },
    Unlock { resource: String, id: Uuid },
}

/// A sequenced request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    pub seq: u64,
    pub request: Request,
}

/// Successful acknowledgment payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplyBody {
    /// Handshake answer: which records are currently locked, per resource.
    Welcome { locked: Vec<(String, Uuid)> },
    /// Canonical record state after a create or update.
    Record(RecordBody),
    /// Current record set for a fetched resource.
    Records(Vec<RecordBody>),
    /// Acknowledged with no payload (delete, lock, unlock).
    Done,
}

/// Structured refusal from the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Refusal {
    /// The referenced record does not exist (any more).
    NotFound { id: Uuid },
    /// Lock request denied: another client holds the lock.
    LockHeld { id: Uuid },
    /// Unlock request denied: the requester is not the holder.
    NotHolder { id: Uuid },
}

impl fmt::Display for Refusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Refusal::NotFound { id } => write!(f, "record {id} not found"),
            Refusal::LockHeld { id } => write!(f, "record {id} is locked by another client"),
            Refusal::NotHolder { id } => write!(f, "record {id} is not locked by this client"),
        }
    }
}

/// Broadcast event from the authority, delivered to every connected
/// client including the originator of the mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    Created { resource: String, body: RecordBody },
    Updated { resource: String, patch: RecordPatch },
    Deleted { resource: String, id: Uuid },
    Locked { resource: String, id: Uuid },
    Unlocked { resource: String, id: Uuid },
}

impl Event {
    /// The topic this event is dispatched under.
    pub fn topic(&self) -> Topic {
        match self {
            Event::Created { resource, .. } => Topic::new(resource.clone(), EventKind::Create),
            Event::Updated { resource, .. } => Topic::new(resource.clone(), EventKind::Update),
            Event::Deleted { resource, .. } => Topic::new(resource.clone(), EventKind::Delete),
            Event::Locked { resource, .. } => Topic::new(resource.clone(), EventKind::Lock),
            Event::Unlocked { resource, .. } => Topic::new(resource.clone(), EventKind::Unlock),
        }
    }

    /// The record identity the event refers to, when it has one.
    pub fn id(&self) -> Option<Uuid> {
        match self {
            Event::Created { body, .. } => Some(body.id),
            Event::Updated { patch, .. } => patch.id,
            Event::Deleted { id, .. }
            | Event::Locked { id, .. }
            | Event::Unlocked { id, .. } => Some(*id),
        }
    }
}

/// Top-level frame from the authority to one client.
///
/// Per connection the authority writes frames in decision order; a reply
/// always precedes the broadcast echo of the same request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerFrame {
    Reply {
        seq: u64,
        result: Result<ReplyBody, Refusal>,
    },
    Event(Event),
}

impl ClientFrame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    ConnectionClosed,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
