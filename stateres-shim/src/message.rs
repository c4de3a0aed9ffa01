// SPDX-License-Identifier: MIT OR Apache-2.0

//! Messages exchanged with the remote peer.
//!
//! Every WebSocket text frame carries one JSON object `{ id, type, error?, data }`. Requests and
//! responses share the same shape: a response echoes the `id` and `type` of its request, which
//! side issued the request is only known from the correlation tables.
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use stateres_core::{EventId, StateMap};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Outbound request for an event, or the remote's response to it.
    GetEvent,

    /// Inbound request to resolve state, or our response to it.
    ResolveState,

    /// Any type we don't know about.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            MessageKind::GetEvent => "get_event",
            MessageKind::ResolveState => "resolve_state",
            MessageKind::Unknown => "unknown",
        };
        f.write_str(value)
    }
}

/// Envelope of every message on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Correlation identifier pairing a request with its response.
    pub id: String,

    #[serde(rename = "type")]
    pub kind: MessageKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub data: Value,
}

impl WireMessage {
    pub fn new(id: impl Into<String>, kind: MessageKind, data: Value) -> Self {
        Self {
            id: id.into(),
            kind,
            error: None,
            data,
        }
    }

    /// Request for a single event.
    pub fn get_event(id: impl Into<String>, event_id: &EventId) -> Self {
        Self::new(id, MessageKind::GetEvent, json!({ "event_id": event_id }))
    }

    /// Response carrying the outcome of a `resolve_state` request.
    pub fn resolve_state(
        id: impl Into<String>,
        response: &ResolveStateResponse,
    ) -> Result<Self, MessageError> {
        let data = serde_json::to_value(response)
            .map_err(MessageError::Encode)?;
        Ok(Self::new(id, MessageKind::ResolveState, data))
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn decode(text: &str) -> Result<Self, MessageError> {
        serde_json::from_str(text).map_err(MessageError::Malformed)
    }

    pub fn encode(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(MessageError::Encode)
    }

    /// Deserialize the payload.
    pub fn data<T>(&self) -> Result<T, MessageError>
    where
        T: DeserializeOwned,
    {
        T::deserialize(&self.data).map_err(|source| MessageError::Payload {
            kind: self.kind,
            source,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetEventRequest {
    pub event_id: EventId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetEventResponse {
    /// Raw event payload.
    pub event: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolveStateRequest {
    pub room_id: String,

    pub room_version: String,

    /// State sets to resolve, keyed by the string form of their composite keys.
    pub state: Vec<StateMap<EventId>>,

    /// Proposed new event to authorize against the resolved state.
    #[serde(default)]
    pub event: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolveStateResponse {
    pub result: StateMap<EventId>,

    /// Empty if no error occurred.
    pub error: String,
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: MessageKind,
        source: serde_json::Error,
    },

    #[error("could not encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use stateres_core::{EventId, StateKey};

    use super::{
        GetEventRequest, MessageError, MessageKind, ResolveStateRequest, ResolveStateResponse,
        WireMessage,
    };

    #[test]
    fn decode_resolve_state_request() {
        let message = WireMessage::decode(
            r#"{
                "id": "r1",
                "type": "resolve_state",
                "data": {
                    "room_id": "!room:example.org",
                    "room_version": "10",
                    "state": [
                        { "[\"m.room.create\",\"\"]": "$E1" },
                        { "[\"m.room.create\", \"\"]": "$E2" }
                    ]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(message.id, "r1");
        assert_eq!(message.kind, MessageKind::ResolveState);
        assert_eq!(message.error, None);

        let request: ResolveStateRequest = message.data().unwrap();
        let key = StateKey::new("m.room.create", "");
        assert_eq!(request.state.len(), 2);
        assert_eq!(request.state[0][&key], EventId::from("$E1"));
        assert_eq!(request.state[1][&key], EventId::from("$E2"));
        assert_eq!(request.event, None);
    }

    #[test]
    fn unknown_types_and_errors() {
        let message =
            WireMessage::decode(r#"{"id":"x","type":"subscribe","data":{}}"#).unwrap();
        assert_eq!(message.kind, MessageKind::Unknown);

        let message = WireMessage::decode(
            r#"{"id":"x","type":"get_event","error":"not found","data":{}}"#,
        )
        .unwrap();
        assert_eq!(message.error.as_deref(), Some("not found"));

        assert_matches!(
            WireMessage::decode("not json"),
            Err(MessageError::Malformed(_))
        );
        assert_matches!(
            WireMessage::decode(r#"{"type":"get_event","data":{}}"#),
            Err(MessageError::Malformed(_))
        );

        let message =
            WireMessage::decode(r#"{"id":"x","type":"resolve_state","data":{}}"#).unwrap();
        assert_matches!(
            message.data::<ResolveStateRequest>(),
            Err(MessageError::Payload {
                kind: MessageKind::ResolveState,
                ..
            })
        );
    }

    #[test]
    fn encode_messages() {
        let request = WireMessage::get_event("abc", &EventId::from("$event"));
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&request.encode().unwrap()).unwrap(),
            json!({ "id": "abc", "type": "get_event", "data": { "event_id": "$event" } })
        );
        assert_eq!(
            request.data::<GetEventRequest>().unwrap().event_id,
            EventId::from("$event")
        );

        let key = StateKey::new("m.room.member", "@alice:example.org");
        let response = ResolveStateResponse {
            result: [(key, EventId::from("$join"))].into_iter().collect(),
            error: String::new(),
        };
        let message = WireMessage::resolve_state("r1", &response).unwrap();
        assert_eq!(
            message.data,
            json!({
                "result": { "[\"m.room.member\",\"@alice:example.org\"]": "$join" },
                "error": "",
            })
        );
    }
}
