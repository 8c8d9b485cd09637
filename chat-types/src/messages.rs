//! Payload schemas exchanged with the chat server.
//!
//! Bodies travel as JSON text with camelCase field names. Unknown fields are
//! ignored so that server additions never break decoding.

use serde::{Deserialize, Serialize};

use crate::{MessageId, UserId};

/// Kind of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Plain text
    #[default]
    Text,
    /// Image attachment
    Image,
    /// Arbitrary file attachment
    File,
    /// Voice note
    Audio,
    /// Server-generated notice
    System,
}

/// A server-authoritative chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Server-assigned identifier
    pub id: MessageId,
    /// Message text
    pub content: String,
    /// Author
    pub sender_id: UserId,
    /// Recipient
    pub receiver_id: UserId,
    /// Server timestamp in milliseconds since the Unix epoch
    #[serde(default)]
    pub timestamp: i64,
    /// Optional attachment location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    /// Recipient has read the message
    #[serde(default)]
    pub read: bool,
    /// Message reached the recipient's device
    #[serde(default)]
    pub delivered: bool,
    /// Message kind
    #[serde(default)]
    pub message_type: MessageKind,
}

impl ChatMessage {
    /// The participant on the other side of this message, seen from `me`.
    pub fn counterparty(&self, me: UserId) -> UserId {
        if self.sender_id == me {
            self.receiver_id
        } else {
            self.sender_id
        }
    }
}

/// A conversation summary as returned by the conversation list request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Conversation identifier
    pub id: u64,
    /// The other participant
    pub participant_id: UserId,
    /// Preview of the latest message
    #[serde(default)]
    pub last_message: Option<String>,
    /// Timestamp of the latest message in milliseconds
    #[serde(default)]
    pub last_message_time: Option<i64>,
    /// Messages not yet read by the local user
    #[serde(default)]
    pub unread_count: u32,
}

/// Typing indicator, both inbound and outbound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotification {
    /// Who is typing
    pub sender_id: UserId,
    /// Who is being typed to (set on outbound notifications)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    /// Typing started (true) or stopped (false)
    pub typing: bool,
}

/// A message was read by its recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    /// The message that was read
    pub message_id: MessageId,
    /// Who read it (absent on outbound mark-read requests)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader_id: Option<UserId>,
}

/// A message was deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
    /// The deleted message
    pub message_id: MessageId,
}

/// Presence change of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    /// Whose presence changed
    pub user_id: UserId,
    /// Currently online
    pub online: bool,
    /// Last activity in milliseconds
    #[serde(default)]
    pub last_seen: Option<i64>,
}

/// Body published when the local user sends a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    /// Recipient
    pub receiver_id: UserId,
    /// Message text
    pub content: String,
    /// Message kind
    #[serde(default)]
    pub message_type: MessageKind,
}

/// Error notice pushed by the server on the errors queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerError {
    /// Human-readable description
    pub message: String,
    /// Optional machine-readable code
    #[serde(default)]
    pub code: Option<String>,
}

/// Body of a message history request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    /// The other participant of the conversation
    pub other_user_id: UserId,
    /// Zero-based page index
    pub page: u32,
    /// Page size
    pub size: u32,
}

/// Response to the unread count request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCount {
    /// Total unread messages across conversations
    pub count: u64,
}
