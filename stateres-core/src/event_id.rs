// SPDX-License-Identifier: MIT OR Apache-2.0

//! Derive content-addressed event ids ("reference hashes").
//!
//! The id of an event in room versions 3 and above is the SHA-256 hash of its redacted, canonical
//! JSON form, without `signatures`, `unsigned` and `event_id`.
use base64::Engine;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::event::{EventError, EventId};
use crate::room_version::{EventIdFormat, RoomVersion};

/// Calculate the event id of the given payload.
///
/// Returns `None` for room versions whose ids are not derived from the event content.
pub fn reference_event_id(
    room_version: RoomVersion,
    payload: &Map<String, Value>,
) -> Option<EventId> {
    let encoded = match room_version.event_id_format() {
        EventIdFormat::Legacy => return None,
        EventIdFormat::Base64 => STANDARD_NO_PAD.encode(reference_hash(room_version, payload)),
        EventIdFormat::UrlSafeBase64 => {
            URL_SAFE_NO_PAD.encode(reference_hash(room_version, payload))
        }
    };
    Some(EventId::new(format!("${encoded}")))
}

/// Check that `expected` is the id derived from the payload.
///
/// Always succeeds for room versions without derivable ids.
pub fn verify_event_id(
    room_version: RoomVersion,
    expected: &EventId,
    payload: &Map<String, Value>,
) -> Result<(), EventError> {
    match reference_event_id(room_version, payload) {
        Some(derived) if &derived != expected => Err(EventError::IdMismatch {
            expected: expected.clone(),
            derived,
        }),
        _ => Ok(()),
    }
}

fn reference_hash(room_version: RoomVersion, payload: &Map<String, Value>) -> [u8; 32] {
    let mut redacted = redact(room_version, payload);
    redacted.remove("signatures");
    redacted.remove("unsigned");
    redacted.remove("event_id");

    let mut canonical = String::new();
    write_canonical(&Value::Object(redacted), &mut canonical);
    Sha256::digest(canonical.as_bytes()).into()
}

/// Strip everything from an event which is not required to authorize it.
pub fn redact(room_version: RoomVersion, payload: &Map<String, Value>) -> Map<String, Value> {
    let mut keep_top_level = vec![
        "event_id",
        "type",
        "room_id",
        "sender",
        "state_key",
        "content",
        "hashes",
        "signatures",
        "depth",
        "prev_events",
        "auth_events",
        "origin_server_ts",
    ];
    if !room_version.updated_redaction_rules() {
        keep_top_level.extend(["prev_state", "origin", "membership"]);
    }

    let mut redacted: Map<String, Value> = payload
        .iter()
        .filter(|(key, _)| keep_top_level.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let event_type = payload.get("type").and_then(Value::as_str).unwrap_or("");
    if let Some(Value::Object(content)) = payload.get("content") {
        redacted.insert(
            "content".into(),
            Value::Object(redact_content(room_version, event_type, content)),
        );
    }

    redacted
}

fn redact_content(
    room_version: RoomVersion,
    event_type: &str,
    content: &Map<String, Value>,
) -> Map<String, Value> {
    let mut keep: Vec<&str> = match event_type {
        "m.room.member" => vec!["membership"],
        "m.room.create" if room_version.updated_redaction_rules() => {
            return content.clone();
        }
        "m.room.create" => vec!["creator"],
        "m.room.join_rules" => vec!["join_rule"],
        "m.room.power_levels" => vec![
            "ban",
            "events",
            "events_default",
            "kick",
            "redact",
            "state_default",
            "users",
            "users_default",
        ],
        "m.room.history_visibility" => vec!["history_visibility"],
        "m.room.aliases" if room_version.redacts_aliases() => vec!["aliases"],
        "m.room.redaction" if room_version.updated_redaction_rules() => vec!["redacts"],
        _ => vec![],
    };

    match event_type {
        "m.room.member" if room_version.join_authorised_via_users_server() => {
            keep.push("join_authorised_via_users_server");
        }
        "m.room.join_rules" if room_version.restricted_join_rules() => keep.push("allow"),
        "m.room.power_levels" if room_version.updated_redaction_rules() => keep.push("invite"),
        _ => (),
    }

    let mut redacted: Map<String, Value> = content
        .iter()
        .filter(|(key, _)| keep.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    // Room version 11 keeps the signed part of third-party invites.
    if event_type == "m.room.member" && room_version.updated_redaction_rules() {
        if let Some(signed) = content
            .get("third_party_invite")
            .and_then(|invite| invite.get("signed"))
        {
            let mut invite = Map::new();
            invite.insert("signed".into(), signed.clone());
            redacted.insert("third_party_invite".into(), Value::Object(invite));
        }
    }

    redacted
}

/// Canonical JSON: object keys sorted by code point, no insignificant whitespace.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            out.push('{');
            for (index, (key, value)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(values) => {
            out.push('[');
            for (index, value) in values.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(value, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::{Map, Value, json};

    use crate::event::{EventError, EventId};
    use crate::room_version::RoomVersion;

    use super::{redact, reference_event_id, verify_event_id, write_canonical};

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let mut out = String::new();
        write_canonical(&json!({ "b": [1, { "d": null, "c": "x" }], "a": true }), &mut out);
        assert_eq!(out, r#"{"a":true,"b":[1,{"c":"x","d":null}]}"#);
    }

    #[test]
    fn redaction_keeps_auth_relevant_content() {
        let payload = object(json!({
            "type": "m.room.member",
            "sender": "@alice:example.org",
            "state_key": "@alice:example.org",
            "unsigned": { "age": 10 },
            "origin": "example.org",
            "content": { "membership": "join", "displayname": "Alice" },
        }));

        let redacted = redact(RoomVersion::V10, &payload);
        assert_eq!(redacted["content"], json!({ "membership": "join" }));
        assert!(redacted.contains_key("origin"));
        assert!(!redacted.contains_key("unsigned"));

        let redacted = redact(RoomVersion::V11, &payload);
        assert!(!redacted.contains_key("origin"));
    }

    #[test]
    fn ids_depend_on_room_version() {
        let payload = object(json!({
            "type": "m.room.create",
            "sender": "@alice:example.org",
            "state_key": "",
            "content": { "creator": "@alice:example.org" },
        }));

        assert_eq!(reference_event_id(RoomVersion::V1, &payload), None);

        let v3 = reference_event_id(RoomVersion::V3, &payload).unwrap();
        let v4 = reference_event_id(RoomVersion::V4, &payload).unwrap();
        assert!(v3.as_str().starts_with('$'));
        assert_eq!(v3.as_str().len(), 44);
        assert!(!v4.as_str().contains('+') && !v4.as_str().contains('/'));

        // Fields removed by redaction or excluded from the hash don't change the id.
        let mut decorated = payload.clone();
        decorated.insert("unsigned".into(), json!({ "age": 1 }));
        decorated.insert("event_id".into(), json!("$whatever"));
        assert_eq!(reference_event_id(RoomVersion::V4, &decorated), Some(v4));
    }

    #[test]
    fn verify_ids() {
        let payload = object(json!({ "type": "m.room.message", "sender": "@a:b" }));
        let id = reference_event_id(RoomVersion::V10, &payload).unwrap();

        assert!(verify_event_id(RoomVersion::V10, &id, &payload).is_ok());
        assert_matches!(
            verify_event_id(RoomVersion::V10, &EventId::from("$other"), &payload),
            Err(EventError::IdMismatch { .. })
        );
        let legacy = EventId::from("$legacy:b");
        assert!(verify_event_id(RoomVersion::V2, &legacy, &payload).is_ok());
    }
}
