// SPDX-License-Identifier: MIT OR Apache-2.0

//! Capability-version tags identifying the rule-set governing a room's events.
use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::warn;

/// Encoding of event ids used by a room version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventIdFormat {
    /// Ids are assigned by the origin server (`$opaque:server`) and can't be derived from content.
    Legacy,

    /// Reference hash encoded with the standard unpadded base64 alphabet.
    Base64,

    /// Reference hash encoded with the URL-safe unpadded base64 alphabet.
    UrlSafeBase64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoomVersion {
    V1,
    V2,
    V3,
    V4,
    V5,
    V6,
    V7,
    V8,
    V9,
    #[default]
    V10,
    V11,
}

impl RoomVersion {
    pub const ALL: [RoomVersion; 11] = [
        RoomVersion::V1,
        RoomVersion::V2,
        RoomVersion::V3,
        RoomVersion::V4,
        RoomVersion::V5,
        RoomVersion::V6,
        RoomVersion::V7,
        RoomVersion::V8,
        RoomVersion::V9,
        RoomVersion::V10,
        RoomVersion::V11,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            RoomVersion::V1 => "1",
            RoomVersion::V2 => "2",
            RoomVersion::V3 => "3",
            RoomVersion::V4 => "4",
            RoomVersion::V5 => "5",
            RoomVersion::V6 => "6",
            RoomVersion::V7 => "7",
            RoomVersion::V8 => "8",
            RoomVersion::V9 => "9",
            RoomVersion::V10 => "10",
            RoomVersion::V11 => "11",
        }
    }

    /// Look up a version by tag, falling back to `fallback` for unknown tags.
    ///
    /// Unknown versions are not rejected, processing continues on a best-effort basis.
    pub fn from_tag_or(tag: &str, fallback: RoomVersion) -> RoomVersion {
        match tag.parse() {
            Ok(version) => version,
            Err(_) => {
                warn!(
                    tag,
                    fallback = fallback.tag(),
                    "unknown room version, using fallback"
                );
                fallback
            }
        }
    }

    pub fn event_id_format(&self) -> EventIdFormat {
        match self {
            RoomVersion::V1 | RoomVersion::V2 => EventIdFormat::Legacy,
            RoomVersion::V3 => EventIdFormat::Base64,
            _ => EventIdFormat::UrlSafeBase64,
        }
    }

    /// `m.room.aliases` content survives redaction.
    pub fn redacts_aliases(&self) -> bool {
        *self <= RoomVersion::V5
    }

    /// Join rules may carry an `allow` list (restricted rooms).
    pub fn restricted_join_rules(&self) -> bool {
        *self >= RoomVersion::V8
    }

    /// Membership events may name the server authorising a restricted join.
    pub fn join_authorised_via_users_server(&self) -> bool {
        *self >= RoomVersion::V9
    }

    /// Redaction keeps less top-level metadata and more content (room version 11 rules).
    pub fn updated_redaction_rules(&self) -> bool {
        *self >= RoomVersion::V11
    }
}

impl fmt::Display for RoomVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for RoomVersion {
    type Err = RoomVersionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        RoomVersion::ALL
            .into_iter()
            .find(|version| version.tag() == value)
            .ok_or_else(|| RoomVersionError::Unknown(value.to_owned()))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoomVersionError {
    #[error("unknown room version {0}")]
    Unknown(String),
}
