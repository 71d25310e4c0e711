//! Canonical danmaku message types.

use serde::{Deserialize, Serialize};

/// The viewer who sent a danmaku.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    /// Platform user id of the sender
    pub uid: u64,
    /// Display name of the sender
    pub username: String,
    /// Link to the sender's profile page
    #[serde(rename = "url")]
    pub profile_url: String,
}

/// A single chat message from a live-room viewer.
///
/// Immutable once constructed; produced per upstream event and consumed once
/// by the downstream broadcast sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Danmaku {
    /// Who sent the message
    pub sender: Sender,
    /// Message content
    pub text: String,
    /// Send time in milliseconds, as reported by the platform
    #[serde(rename = "timestamp")]
    pub timestamp_millis: i64,
    /// The room the message was observed in
    #[serde(rename = "roomId")]
    pub room_id: u64,
}

impl Danmaku {
    /// Create a new danmaku record.
    pub fn new(
        uid: u64,
        username: impl Into<String>,
        profile_url: impl Into<String>,
        text: impl Into<String>,
        timestamp_millis: i64,
        room_id: u64,
    ) -> Self {
        Self {
            sender: Sender {
                uid,
                username: username.into(),
                profile_url: profile_url.into(),
            },
            text: text.into(),
            timestamp_millis,
            room_id,
        }
    }
}
