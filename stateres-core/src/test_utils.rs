// SPDX-License-Identifier: MIT OR Apache-2.0

//! Helpers to build events and small rooms in tests.
use serde_json::{Map, Value, json};

use crate::event::{Event, EventId};
use crate::memory::MemoryEventStore;
use crate::room_version::RoomVersion;

pub const TEST_ROOM_ID: &str = "!room:example.org";

/// Builder for raw event payloads.
#[derive(Clone, Debug)]
pub struct EventBuilder {
    payload: Map<String, Value>,
}

impl EventBuilder {
    pub fn new(event_type: &str, sender: &str) -> Self {
        let mut payload = Map::new();
        payload.insert("type".into(), json!(event_type));
        payload.insert("sender".into(), json!(sender));
        payload.insert("room_id".into(), json!(TEST_ROOM_ID));
        payload.insert("content".into(), json!({}));
        payload.insert("depth".into(), json!(1));
        payload.insert("origin_server_ts".into(), json!(0));
        payload.insert("auth_events".into(), json!([]));
        payload.insert("prev_events".into(), json!([]));
        Self { payload }
    }

    pub fn state_key(mut self, state_key: &str) -> Self {
        self.payload.insert("state_key".into(), json!(state_key));
        self
    }

    pub fn content(mut self, content: Value) -> Self {
        self.payload.insert("content".into(), content);
        self
    }

    pub fn auth_events(mut self, auth_events: &[&str]) -> Self {
        self.payload
            .insert("auth_events".into(), json!(auth_events));
        self
    }

    pub fn prev_events(mut self, prev_events: &[&str]) -> Self {
        self.payload
            .insert("prev_events".into(), json!(prev_events));
        self
    }

    pub fn depth(mut self, depth: u64) -> Self {
        self.payload.insert("depth".into(), json!(depth));
        self
    }

    pub fn origin_server_ts(mut self, ts: u64) -> Self {
        self.payload.insert("origin_server_ts".into(), json!(ts));
        self
    }

    pub fn room_id(mut self, room_id: &str) -> Self {
        self.payload.insert("room_id".into(), json!(room_id));
        self
    }

    pub fn json(&self) -> Value {
        Value::Object(self.payload.clone())
    }

    pub fn build(self, event_id: &str) -> Event {
        Event::from_json(
            EventId::from(event_id),
            RoomVersion::default(),
            Value::Object(self.payload),
        )
        .expect("valid test event")
    }
}

/// Store holding one `m.room.message` event per entry, with the given auth events.
pub fn graph_store(graph: &[(&str, &[&str])]) -> MemoryEventStore {
    graph
        .iter()
        .map(|(event_id, auth_events)| {
            EventBuilder::new("m.room.message", "@alice:example.org")
                .auth_events(auth_events)
                .build(event_id)
        })
        .collect()
}

/// Room created by Alice with the usual initial state.
///
/// Contains `$create`, `$alice_join`, `$power` (Alice at 100), `$join_rules` (public) and
/// `$bob_join`.
pub struct TestRoom {
    pub events: Vec<(String, EventBuilder)>,
}

impl TestRoom {
    pub const ALICE: &'static str = "@alice:example.org";
    pub const BOB: &'static str = "@bob:example.org";
    pub const CHARLIE: &'static str = "@charlie:example.org";

    pub fn new() -> Self {
        let alice = Self::ALICE;
        let bob = Self::BOB;
        let events = vec![
            (
                "$create".to_string(),
                EventBuilder::new("m.room.create", alice)
                    .state_key("")
                    .content(json!({ "creator": alice, "room_version": "10" }))
                    .depth(1),
            ),
            (
                "$alice_join".to_string(),
                EventBuilder::new("m.room.member", alice)
                    .state_key(alice)
                    .content(json!({ "membership": "join" }))
                    .auth_events(&["$create"])
                    .prev_events(&["$create"])
                    .depth(2),
            ),
            (
                "$power".to_string(),
                EventBuilder::new("m.room.power_levels", alice)
                    .state_key("")
                    .content(json!({
                        "users": { alice: 100 },
                        "users_default": 0,
                        "events_default": 0,
                        "state_default": 50,
                    }))
                    .auth_events(&["$create", "$alice_join"])
                    .prev_events(&["$alice_join"])
                    .depth(3),
            ),
            (
                "$join_rules".to_string(),
                EventBuilder::new("m.room.join_rules", alice)
                    .state_key("")
                    .content(json!({ "join_rule": "public" }))
                    .auth_events(&["$create", "$alice_join", "$power"])
                    .prev_events(&["$power"])
                    .depth(4),
            ),
            (
                "$bob_join".to_string(),
                EventBuilder::new("m.room.member", bob)
                    .state_key(bob)
                    .content(json!({ "membership": "join" }))
                    .auth_events(&["$create", "$power", "$join_rules"])
                    .prev_events(&["$join_rules"])
                    .depth(5),
            ),
        ];
        Self { events }
    }

    /// Add another event to the room.
    pub fn with(mut self, event_id: &str, builder: EventBuilder) -> Self {
        self.events.push((event_id.to_string(), builder));
        self
    }

    pub fn event(&self, event_id: &str) -> Event {
        self.events
            .iter()
            .find(|(id, _)| id == event_id)
            .map(|(id, builder)| builder.clone().build(id))
            .expect("event exists in test room")
    }

    pub fn store(&self) -> MemoryEventStore {
        self.events
            .iter()
            .map(|(id, builder)| builder.clone().build(id))
            .collect()
    }

    /// Raw payloads by event id, as a remote would serve them.
    pub fn payloads(&self) -> Vec<(EventId, Value)> {
        self.events
            .iter()
            .map(|(id, builder)| (EventId::from(id.as_str()), builder.json()))
            .collect()
    }
}

impl Default for TestRoom {
    fn default() -> Self {
        Self::new()
    }
}
