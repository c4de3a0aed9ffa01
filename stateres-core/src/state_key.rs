// SPDX-License-Identifier: MIT OR Apache-2.0

//! Composite `(event type, state key)` keys identifying a slot in the room state.
//!
//! JSON objects can't use tuples as keys, on the wire a key is therefore carried as the string
//! serialization of a two-element array, for example `["m.room.member","@alice:example.org"]`.
//! [`StateKey`] is the structured form, its serde implementation converts to and from the string
//! form, so a [`StateMap`] serializes directly into the wire representation.
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Mapping from composite keys to values, usually event ids.
pub type StateMap<T> = HashMap<StateKey, T>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey {
    pub event_type: String,
    pub state_key: String,
}

impl StateKey {
    pub fn new(event_type: impl Into<String>, state_key: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            state_key: state_key.into(),
        }
    }

    /// Encode the key into its wire form, a JSON array serialized as a string.
    pub fn to_wire(&self) -> String {
        Value::Array(vec![
            Value::String(self.event_type.clone()),
            Value::String(self.state_key.clone()),
        ])
        .to_string()
    }

    /// Decode a key from its wire form.
    pub fn from_wire(value: &str) -> Result<Self, StateKeyError> {
        let (event_type, state_key): (String, String) = serde_json::from_str(value)
            .map_err(|err| StateKeyError::Malformed(value.to_owned(), err.to_string()))?;
        Ok(Self {
            event_type,
            state_key,
        })
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.event_type, self.state_key)
    }
}

impl FromStr for StateKey {
    type Err = StateKeyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::from_wire(value)
    }
}

impl Serialize for StateKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_wire())
    }
}

impl<'de> Deserialize<'de> for StateKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct StateKeyVisitor;

        impl Visitor<'_> for StateKeyVisitor {
            type Value = StateKey;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a JSON encoded [event type, state key] array")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                StateKey::from_wire(value).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(StateKeyVisitor)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateKeyError {
    #[error("malformed state key {0}: {1}")]
    Malformed(String, String),
}
