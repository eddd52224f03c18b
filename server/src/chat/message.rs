//! The wire/domain chat message.
//!
//! The JSON field set is fixed; frames are re-serialized to recipients with
//! the same shape they arrived in.

use serde::{Deserialize, Serialize};

/// Leading tag character marking a group receiver id.
/// Load-bearing: group vs. unicast routing is derived from this prefix on
/// `receive_id`, never from `type`. User ids are minted with a `U` prefix.
pub const GROUP_ID_PREFIX: char = 'G';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverKind {
    User,
    Group,
}

/// Immutable once constructed. `type` is a closed discriminator the router
/// forwards opaquely, so new client-side kinds need no server change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Client-local session identifier; part of the client's dedup story.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "type")]
    pub message_type: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub send_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_avatar: Option<String>,
    pub receive_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Audio/video signaling payload, forwarded untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub av_data: Option<String>,
}

impl ChatMessage {
    pub fn receiver_kind(&self) -> ReceiverKind {
        if self.receive_id.starts_with(GROUP_ID_PREFIX) {
            ReceiverKind::Group
        } else {
            ReceiverKind::User
        }
    }
}
