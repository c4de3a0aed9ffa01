// SPDX-License-Identifier: MIT OR Apache-2.0

//! Simplified authorization rules for room events.
//!
//! Covers the rules which matter for resolving state: auth event selection, room membership and
//! power levels. Redactions, aliases, third-party invite signatures and server ACLs are not
//! checked.
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde_json::Value;

use crate::event::{
    Event, ROOM_CREATE, ROOM_JOIN_RULES, ROOM_MEMBER, ROOM_POWER_LEVELS, ROOM_THIRD_PARTY_INVITE,
};
use crate::state_key::StateKey;
use crate::traits::{AuthChecker, AuthError, EventStore, StoreError};

/// Event types which may appear among the auth events of an event.
const AUTH_TYPES: [&str; 5] = [
    ROOM_CREATE,
    ROOM_POWER_LEVELS,
    ROOM_JOIN_RULES,
    ROOM_MEMBER,
    ROOM_THIRD_PARTY_INVITE,
];

/// State keys consulted when authorizing the given event.
pub fn auth_types_for_event(event: &Event) -> Vec<StateKey> {
    let mut keys = vec![
        StateKey::new(ROOM_CREATE, ""),
        StateKey::new(ROOM_POWER_LEVELS, ""),
        StateKey::new(ROOM_MEMBER, event.sender()),
    ];

    if event.event_type() == ROOM_MEMBER {
        if let Some(target) = event.state_key() {
            keys.push(StateKey::new(ROOM_MEMBER, target));
        }
        keys.push(StateKey::new(ROOM_JOIN_RULES, ""));
    }

    keys.dedup();
    keys
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RuleAuthChecker;

impl RuleAuthChecker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuthChecker for RuleAuthChecker {
    async fn check_independent(
        &self,
        store: &dyn EventStore,
        event: &Event,
    ) -> Result<(), AuthError> {
        if event.event_type() == ROOM_CREATE {
            if !event.auth_events().is_empty() {
                return Err(reject(event, "create event must not have auth events"));
            }
            return Ok(());
        }

        let auth_events = store.get_events(event.auth_events()).await?;

        let mut seen = HashSet::new();
        let mut has_create = false;
        for auth_id in event.auth_events() {
            let auth_event = auth_events
                .get(auth_id)
                .ok_or_else(|| StoreError::NotFound(auth_id.clone()))?;

            let Some(key) = auth_event.key() else {
                return Err(reject(
                    event,
                    format!("auth event {auth_id} is not a state event"),
                ));
            };

            if let (Some(room_id), Some(auth_room_id)) = (event.room_id(), auth_event.room_id()) {
                if room_id != auth_room_id {
                    return Err(reject(
                        event,
                        format!("auth event {auth_id} belongs to room {auth_room_id}"),
                    ));
                }
            }

            if !AUTH_TYPES.contains(&key.event_type.as_str()) {
                return Err(reject(
                    event,
                    format!(
                        "auth event {auth_id} has type {} which is not relevant for authorization",
                        key.event_type
                    ),
                ));
            }

            if key.event_type == ROOM_CREATE {
                has_create = true;
            }

            if !seen.insert(key.clone()) {
                return Err(reject(event, format!("duplicate auth event for {key}")));
            }
        }

        if !has_create {
            return Err(reject(event, "no create event among auth events"));
        }

        Ok(())
    }

    fn check_dependent(&self, event: &Event, state: &[Event]) -> Result<(), AuthError> {
        if event.event_type() == ROOM_CREATE {
            return Ok(());
        }

        let state = AuthState::new(state);
        let Some(create) = state.get(ROOM_CREATE, "") else {
            return Err(reject(event, "room has no create event"));
        };
        let power_levels = PowerLevels::from_state(&state, create);

        if event.event_type() == ROOM_MEMBER {
            return check_membership(event, &state, create, &power_levels);
        }

        if state.membership(event.sender()) != Some("join") {
            return Err(reject(
                event,
                format!("sender {} is not joined to the room", event.sender()),
            ));
        }

        let required = power_levels.required_for(event);
        let level = power_levels.user_level(event.sender());
        if level < required {
            return Err(reject(
                event,
                format!(
                    "sender power level {level} is below the {required} required to send {}",
                    event.event_type()
                ),
            ));
        }

        Ok(())
    }
}

fn check_membership(
    event: &Event,
    state: &AuthState<'_>,
    create: &Event,
    power_levels: &PowerLevels,
) -> Result<(), AuthError> {
    let Some(target) = event.state_key() else {
        return Err(reject(event, "membership event without state key"));
    };
    let Some(membership) = event.content_str("membership") else {
        return Err(reject(event, "membership event without membership"));
    };

    let sender = event.sender();
    let sender_membership = state.membership(sender);
    let target_membership = state.membership(target);

    match membership {
        "join" => {
            if sender != target {
                return Err(reject(event, "can't join on behalf of another user"));
            }
            if target_membership == Some("ban") {
                return Err(reject(event, format!("{target} is banned from the room")));
            }
            // The creator's first join.
            if target == creator(create) && target_membership.is_none() {
                return Ok(());
            }
            if target_membership == Some("join") {
                return Ok(());
            }

            match state.join_rule() {
                "public" => Ok(()),
                "invite" | "knock" if target_membership == Some("invite") => Ok(()),
                "restricted" | "knock_restricted"
                    if event.room_version().restricted_join_rules()
                        && (target_membership == Some("invite")
                            || event
                                .content_str("join_authorised_via_users_server")
                                .is_some()) =>
                {
                    Ok(())
                }
                rule => Err(reject(
                    event,
                    format!("{target} is not allowed to join a room with join rule {rule}"),
                )),
            }
        }
        "invite" => {
            if sender_membership != Some("join") {
                return Err(reject(event, format!("inviter {sender} is not joined")));
            }
            if matches!(target_membership, Some("join") | Some("ban")) {
                return Err(reject(
                    event,
                    format!("{target} can't be invited while joined or banned"),
                ));
            }
            if power_levels.user_level(sender) < power_levels.invite {
                return Err(reject(
                    event,
                    format!("{sender} has insufficient power level to invite"),
                ));
            }
            Ok(())
        }
        "leave" if sender == target => {
            if matches!(
                target_membership,
                Some("join") | Some("invite") | Some("knock")
            ) {
                Ok(())
            } else {
                Err(reject(
                    event,
                    format!("{target} can't leave a room they're not in"),
                ))
            }
        }
        "leave" | "ban" => {
            if sender_membership != Some("join") {
                return Err(reject(event, format!("{sender} is not joined")));
            }

            let sender_level = power_levels.user_level(sender);
            let target_level = power_levels.user_level(target);
            let required = if membership == "ban" || target_membership == Some("ban") {
                power_levels.ban
            } else {
                power_levels.kick
            };

            if sender_level < required || sender_level <= target_level {
                return Err(reject(
                    event,
                    format!("{sender} has insufficient power level to {membership} {target}"),
                ));
            }
            Ok(())
        }
        "knock" => {
            if sender != target {
                return Err(reject(event, "can't knock on behalf of another user"));
            }
            if !matches!(state.join_rule(), "knock" | "knock_restricted") {
                return Err(reject(event, "room does not allow knocking"));
            }
            if matches!(target_membership, Some("join") | Some("ban")) {
                return Err(reject(
                    event,
                    format!("{target} can't knock while joined or banned"),
                ));
            }
            Ok(())
        }
        other => Err(reject(event, format!("unknown membership {other}"))),
    }
}

fn reject(event: &Event, reason: impl Into<String>) -> AuthError {
    AuthError::Rejected(event.id().clone(), reason.into())
}

/// Room creator, taken from the create event's content in older versions or its sender.
fn creator(create: &Event) -> &str {
    create
        .content_str("creator")
        .unwrap_or_else(|| create.sender())
}

/// Room state indexed by composite key.
struct AuthState<'a> {
    events: HashMap<StateKey, &'a Event>,
}

impl<'a> AuthState<'a> {
    fn new(state: &'a [Event]) -> Self {
        let events = state
            .iter()
            .filter_map(|event| event.key().map(|key| (key, event)))
            .collect();
        Self { events }
    }

    fn get(&self, event_type: &str, state_key: &str) -> Option<&'a Event> {
        self.events
            .get(&StateKey::new(event_type, state_key))
            .copied()
    }

    fn membership(&self, user_id: &str) -> Option<&'a str> {
        self.get(ROOM_MEMBER, user_id)
            .and_then(|event| event.content_str("membership"))
    }

    fn join_rule(&self) -> &'a str {
        self.get(ROOM_JOIN_RULES, "")
            .and_then(|event| event.content_str("join_rule"))
            .unwrap_or("invite")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct PowerLevels {
    users: HashMap<String, i64>,
    users_default: i64,
    events: HashMap<String, i64>,
    events_default: i64,
    state_default: i64,
    ban: i64,
    kick: i64,
    invite: i64,
}

impl PowerLevels {
    fn from_state(state: &AuthState<'_>, create: &Event) -> Self {
        let Some(content) = state
            .get(ROOM_POWER_LEVELS, "")
            .and_then(|event| event.content())
        else {
            // Without power levels the creator is the only privileged user.
            return Self {
                users: HashMap::from([(creator(create).to_owned(), 100)]),
                users_default: 0,
                events: HashMap::new(),
                events_default: 0,
                state_default: 0,
                ban: 50,
                kick: 50,
                invite: 0,
            };
        };

        let level =
            |field: &str, default: i64| content.get(field).and_then(as_level).unwrap_or(default);
        let levels = |field: &str| -> HashMap<String, i64> {
            content
                .get(field)
                .and_then(Value::as_object)
                .map(|levels| {
                    levels
                        .iter()
                        .filter_map(|(key, value)| {
                            as_level(value).map(|level| (key.clone(), level))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Self {
            users: levels("users"),
            users_default: level("users_default", 0),
            events: levels("events"),
            events_default: level("events_default", 0),
            state_default: level("state_default", 50),
            ban: level("ban", 50),
            kick: level("kick", 50),
            invite: level("invite", 0),
        }
    }

    fn user_level(&self, user_id: &str) -> i64 {
        self.users
            .get(user_id)
            .copied()
            .unwrap_or(self.users_default)
    }

    fn required_for(&self, event: &Event) -> i64 {
        match self.events.get(event.event_type()) {
            Some(level) => *level,
            None if event.is_state() => self.state_default,
            None => self.events_default,
        }
    }
}

/// Power levels are integers, older rooms may carry them as strings.
fn as_level(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(string) => string.trim().parse().ok(),
        _ => None,
    }
}
