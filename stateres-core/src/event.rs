// SPDX-License-Identifier: MIT OR Apache-2.0

//! Immutable events, the nodes of the room DAG.
use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::room_version::RoomVersion;
use crate::state_key::StateKey;

pub const ROOM_CREATE: &str = "m.room.create";
pub const ROOM_MEMBER: &str = "m.room.member";
pub const ROOM_POWER_LEVELS: &str = "m.room.power_levels";
pub const ROOM_JOIN_RULES: &str = "m.room.join_rules";
pub const ROOM_THIRD_PARTY_INVITE: &str = "m.room.third_party_invite";

/// Globally unique, content-addressed identifier of an event.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventId").field(&self.0).finish()
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for EventId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for EventId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for EventId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Event fetched from the remote authority.
///
/// Besides the fields required to walk and authorize the graph, the full (opaque) payload is kept
/// around so collaborators can inspect whatever else they need. Events are cheap to clone, the
/// payload is shared.
#[derive(Clone, Debug)]
pub struct Event {
    id: EventId,
    room_version: RoomVersion,
    event_type: String,
    state_key: Option<String>,
    sender: String,
    room_id: Option<String>,
    depth: u64,
    origin_server_ts: u64,
    auth_events: Vec<EventId>,
    prev_events: Vec<EventId>,
    payload: Arc<Map<String, Value>>,
}

impl Event {
    /// Build an event from its raw JSON form.
    ///
    /// The identifier is supplied by the caller: payloads on the wire are not supposed to carry
    /// their own `event_id` and any such field is stripped.
    pub fn from_json(
        id: EventId,
        room_version: RoomVersion,
        value: Value,
    ) -> Result<Self, EventError> {
        let Value::Object(mut payload) = value else {
            return Err(EventError::NotAnObject);
        };
        payload.remove("event_id");

        let event_type = required_str(&payload, "type")?;
        let sender = required_str(&payload, "sender")?;
        let state_key = optional_str(&payload, "state_key")?;
        let room_id = optional_str(&payload, "room_id")?;
        let depth = optional_u64(&payload, "depth")?;
        let origin_server_ts = optional_u64(&payload, "origin_server_ts")?;
        let auth_events = event_references(&payload, "auth_events")?;
        let prev_events = event_references(&payload, "prev_events")?;

        Ok(Self {
            id,
            room_version,
            event_type,
            state_key,
            sender,
            room_id,
            depth,
            origin_server_ts,
            auth_events,
            prev_events,
            payload: Arc::new(payload),
        })
    }

    pub fn id(&self) -> &EventId {
        &self.id
    }

    /// Version of the rule-set governing this event.
    pub fn room_version(&self) -> RoomVersion {
        self.room_version
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn state_key(&self) -> Option<&str> {
        self.state_key.as_deref()
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn depth(&self) -> u64 {
        self.depth
    }

    pub fn origin_server_ts(&self) -> u64 {
        self.origin_server_ts
    }

    /// Events this event's authorization depends on.
    pub fn auth_events(&self) -> &[EventId] {
        &self.auth_events
    }

    pub fn prev_events(&self) -> &[EventId] {
        &self.prev_events
    }

    /// Returns `true` if this is a state event, that is it carries a state key.
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// Composite key this event occupies in the room state, `None` for non-state events.
    pub fn key(&self) -> Option<StateKey> {
        self.state_key
            .as_ref()
            .map(|state_key| StateKey::new(self.event_type.clone(), state_key.clone()))
    }

    pub fn content(&self) -> Option<&Map<String, Value>> {
        self.payload.get("content").and_then(Value::as_object)
    }

    /// String field from the event content.
    pub fn content_str(&self, field: &str) -> Option<&str> {
        self.content()
            .and_then(|content| content.get(field))
            .and_then(Value::as_str)
    }

    /// Raw payload of the event, without `event_id`.
    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.payload == other.payload
    }
}

impl Eq for Event {}

fn required_str(payload: &Map<String, Value>, field: &'static str) -> Result<String, EventError> {
    optional_str(payload, field)?
        .ok_or(EventError::MissingField(field))
}

fn optional_str(
    payload: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, EventError> {
    match payload.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(EventError::InvalidField(field)),
    }
}

fn optional_u64(payload: &Map<String, Value>, field: &'static str) -> Result<u64, EventError> {
    match payload.get(field) {
        None | Some(Value::Null) => Ok(0),
        Some(value) => value.as_u64().ok_or(EventError::InvalidField(field)),
    }
}

/// Read a list of event references.
///
/// Room versions 1 and 2 reference events as `[event_id, {hashes}]` pairs, later versions use
/// plain event id strings. Both forms are accepted.
fn event_references(
    payload: &Map<String, Value>,
    field: &'static str,
) -> Result<Vec<EventId>, EventError> {
    let references = match payload.get(field) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(references)) => references,
        Some(_) => return Err(EventError::InvalidField(field)),
    };

    references
        .iter()
        .map(|reference| match reference {
            Value::String(id) => Ok(EventId::from(id.as_str())),
            Value::Array(pair) => pair
                .first()
                .and_then(Value::as_str)
                .map(EventId::from)
                .ok_or(EventError::InvalidField(field)),
            _ => Err(EventError::InvalidField(field)),
        })
        .collect()
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("event payload is not a JSON object")]
    NotAnObject,

    #[error("event is missing required field \"{0}\"")]
    MissingField(&'static str),

    #[error("event field \"{0}\" has an invalid value")]
    InvalidField(&'static str),

    #[error("event id {expected} does not match its reference hash {derived}")]
    IdMismatch { expected: EventId, derived: EventId },
}
