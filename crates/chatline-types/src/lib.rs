//! Shared types and wire formats for the Chatline platform.
//!
//! This crate holds the JSON shapes exchanged with clients (inbound socket
//! frames, outbound delivery envelopes, history and friend-list entries, user
//! directory entries) and
//! the timestamp formats they use. Every other crate in the workspace depends
//! on it; it depends on nothing internal.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Identity of a user. Unsigned, assigned by the persistence layer.
pub type UserId = u32;

/// Identity of a persisted message.
pub type MessageId = i64;

/// Timestamp format used in real-time envelopes and friend-list entries.
pub const ENVELOPE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Timestamp format used in message history entries.
pub const HISTORY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Placeholder reported for `last_seen` until presence tracking exists.
pub const LAST_SEEN_PLACEHOLDER: &str = "2021-09-01 15:04";

/// Formats a timestamp for a delivery envelope.
pub fn envelope_time(at: &NaiveDateTime) -> String {
    at.format(ENVELOPE_TIME_FORMAT).to_string()
}

/// Formats a timestamp for a history entry.
pub fn history_time(at: &NaiveDateTime) -> String {
    at.format(HISTORY_TIME_FORMAT).to_string()
}

/// A frame sent by a client over its socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundFrame {
    pub content: String,
    pub receiver_id: UserId,
}

/// Profile snippet of a message's sender, embedded in every envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderProfile {
    pub id: UserId,
    pub first_name: String,
    pub last_name: String,
    pub profile_image_url: String,
}

/// Outbound representation of a persisted message pushed to a live
/// connection.
///
/// Two envelopes are built per message: one for the receiver with
/// `is_self = false` and one echoed to the sender with `is_self = true`.
/// `is_read` is always `false` for real-time delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryEnvelope {
    pub id: MessageId,
    pub is_self: bool,
    pub is_read: bool,
    pub message: String,
    pub time: String,
    pub receiver_id: UserId,
    pub sender: SenderProfile,
}

/// One message in a conversation history, from the caller's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: MessageId,
    pub is_self: bool,
    pub is_read: bool,
    pub message: String,
    pub time: String,
}

/// Public profile of a conversation partner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendProfile {
    pub id: UserId,
    pub first_name: String,
    pub last_name: String,
    pub profile_image_url: String,
    pub username: String,
}

/// Latest message exchanged with a conversation partner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    pub content: String,
    pub time: String,
}

/// Friend-list row: a conversation partner and the last message exchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendSummary {
    pub profile: FriendProfile,
    pub last_seen: String,
    pub unread_count: u32,
    pub last_message: LastMessage,
}

/// Public view of a user account. The password hash is never serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub profile_image_url: String,
}

/// One hit of the user directory search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSearchResult {
    pub profile: FriendProfile,
    pub last_seen: String,
}
