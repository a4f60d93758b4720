use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{MessageId, MessageKind, Role, RoomId, RoomVisibility, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProfile {
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub user_id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub token: String,
    pub user: UserSummary,
}

/// Room descriptor as served by the pull boundary. `encryption_key` is the
/// room's symmetric key, base64 encoded, present only while the caller is an
/// authorized member; it never travels in the other direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub visibility: RoomVisibility,
    pub member_limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoomRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub visibility: RoomVisibility,
    pub member_limit: u32,
}

/// Message as it crosses either boundary: the body is always the encrypted
/// wire form, base64 of nonce-then-ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub encrypted_content: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSummary {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub username: String,
    pub role: Role,
}

/// Outbound actions on the push channel. Fire-and-forget: the channel does
/// not retry or wait for acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientCommand {
    JoinRoom {
        room_id: RoomId,
    },
    LeaveRoom {
        room_id: RoomId,
    },
    SendMessage {
        room_id: RoomId,
        encrypted_content: String,
        kind: MessageKind,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<String>,
    },
    Typing {
        room_id: RoomId,
        is_typing: bool,
    },
    AddReaction {
        room_id: RoomId,
        message_id: MessageId,
        emoji: String,
    },
    RemoveReaction {
        room_id: RoomId,
        message_id: MessageId,
        emoji: String,
    },
    EditMessage {
        room_id: RoomId,
        message_id: MessageId,
        encrypted_content: String,
    },
    DeleteMessage {
        room_id: RoomId,
        message_id: MessageId,
    },
}

/// Inbound notifications from the push channel, decoded once at the channel
/// boundary. `ConnectionUp` and `ConnectionDown` are synthesized locally when
/// the underlying connection opens or drops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PushEvent {
    ConnectionUp,
    ConnectionDown,
    MessageReceived {
        message: MessagePayload,
    },
    MemberJoined {
        member: MemberSummary,
    },
    MemberLeft {
        room_id: RoomId,
        user_id: UserId,
    },
    PresenceChanged {
        user_id: UserId,
        online: bool,
    },
    TypingChanged {
        room_id: RoomId,
        user_id: UserId,
        is_typing: bool,
    },
    ReactionAdded {
        room_id: RoomId,
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
    },
    ReactionRemoved {
        room_id: RoomId,
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
    },
    MessageEdited {
        room_id: RoomId,
        message_id: MessageId,
        encrypted_content: String,
        edited_at: DateTime<Utc>,
    },
    MessageDeleted {
        room_id: RoomId,
        message_id: MessageId,
    },
    ChannelError(ApiError),
}

/// Closed set of inbound event kinds, used to key subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectionUp,
    ConnectionDown,
    MessageReceived,
    MemberJoined,
    MemberLeft,
    PresenceChanged,
    TypingChanged,
    ReactionAdded,
    ReactionRemoved,
    MessageEdited,
    MessageDeleted,
    ChannelError,
}

impl EventKind {
    pub const ALL: [EventKind; 12] = [
        EventKind::ConnectionUp,
        EventKind::ConnectionDown,
        EventKind::MessageReceived,
        EventKind::MemberJoined,
        EventKind::MemberLeft,
        EventKind::PresenceChanged,
        EventKind::TypingChanged,
        EventKind::ReactionAdded,
        EventKind::ReactionRemoved,
        EventKind::MessageEdited,
        EventKind::MessageDeleted,
        EventKind::ChannelError,
    ];
}

impl PushEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PushEvent::ConnectionUp => EventKind::ConnectionUp,
            PushEvent::ConnectionDown => EventKind::ConnectionDown,
            PushEvent::MessageReceived { .. } => EventKind::MessageReceived,
            PushEvent::MemberJoined { .. } => EventKind::MemberJoined,
            PushEvent::MemberLeft { .. } => EventKind::MemberLeft,
            PushEvent::PresenceChanged { .. } => EventKind::PresenceChanged,
            PushEvent::TypingChanged { .. } => EventKind::TypingChanged,
            PushEvent::ReactionAdded { .. } => EventKind::ReactionAdded,
            PushEvent::ReactionRemoved { .. } => EventKind::ReactionRemoved,
            PushEvent::MessageEdited { .. } => EventKind::MessageEdited,
            PushEvent::MessageDeleted { .. } => EventKind::MessageDeleted,
            PushEvent::ChannelError(_) => EventKind::ChannelError,
        }
    }
}
