//! Shared doubles for engine tests: a programmable pull boundary, a
//! recording push sender, and an in-memory session slot.

use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::sync::Mutex;

use shared::{
    domain::{MessageKind, Role, RoomId, RoomVisibility, UserId},
    error::{ApiException, ErrorCode},
    protocol::{
        CreateRoomRequest, Credentials, MemberSummary, MessagePayload, NewProfile, RoomSummary,
        SessionResponse, UserSummary,
    },
};

use crate::{api::ChatApi, crypto::KEY_LEN, session::SessionSlot, sync::PushSender};

pub fn test_key() -> String {
    STANDARD.encode([7u8; KEY_LEN])
}

pub fn room(id: &str, encryption_key: Option<String>) -> RoomSummary {
    RoomSummary {
        room_id: RoomId::new(id),
        name: format!("room {id}"),
        description: String::new(),
        visibility: RoomVisibility::Private,
        member_limit: 32,
        encryption_key,
    }
}

pub fn message(id: &str, room_id: &str, encrypted_content: &str) -> MessagePayload {
    MessagePayload {
        message_id: shared::domain::MessageId::new(id),
        room_id: RoomId::new(room_id),
        sender_id: UserId::new("alice"),
        encrypted_content: encrypted_content.to_string(),
        kind: MessageKind::Text,
        attachments: Vec::new(),
        sent_at: "2024-01-01T00:00:00Z".parse().expect("timestamp"),
        edited_at: None,
    }
}

pub fn member(room_id: &str, user_id: &str) -> MemberSummary {
    MemberSummary {
        room_id: RoomId::new(room_id),
        user_id: UserId::new(user_id),
        username: user_id.to_string(),
        role: Role::Member,
    }
}

pub fn test_user() -> UserSummary {
    UserSummary {
        user_id: UserId::new("alice"),
        username: "alice".to_string(),
        display_name: None,
    }
}

#[derive(Default)]
pub struct MockChatApi {
    pub rooms: Mutex<Vec<RoomSummary>>,
    pub room_details: Mutex<HashMap<RoomId, RoomSummary>>,
    pub messages: Mutex<HashMap<RoomId, Vec<MessagePayload>>>,
    pub members: Mutex<HashMap<RoomId, Vec<MemberSummary>>>,
    pub create_result: Mutex<Option<RoomSummary>>,
    pub session_result: Mutex<Option<SessionResponse>>,
    pub bearer: Mutex<Option<String>>,
    pub fail_with: Mutex<Option<String>>,
}

impl MockChatApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn set_failure(&self, message: impl Into<String>) {
        *self.fail_with.lock().await = Some(message.into());
    }

    async fn check_failure(&self) -> Result<()> {
        if let Some(message) = self.fail_with.lock().await.clone() {
            return Err(ApiException::new(ErrorCode::Internal, message).into());
        }
        Ok(())
    }
}

#[async_trait]
impl ChatApi for MockChatApi {
    async fn set_bearer_token(&self, token: Option<String>) {
        *self.bearer.lock().await = token;
    }

    async fn login(&self, _credentials: Credentials) -> Result<SessionResponse> {
        self.check_failure().await?;
        self.session_result
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow!("login not configured"))
    }

    async fn register(&self, _profile: NewProfile) -> Result<SessionResponse> {
        self.check_failure().await?;
        self.session_result
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow!("register not configured"))
    }

    async fn logout(&self) -> Result<()> {
        self.check_failure().await
    }

    async fn current_user(&self) -> Result<UserSummary> {
        self.check_failure().await?;
        self.session_result
            .lock()
            .await
            .as_ref()
            .map(|session| session.user.clone())
            .ok_or_else(|| anyhow!("identity not configured"))
    }

    async fn list_rooms(&self) -> Result<Vec<RoomSummary>> {
        self.check_failure().await?;
        Ok(self.rooms.lock().await.clone())
    }

    async fn room_detail(&self, room_id: &RoomId) -> Result<RoomSummary> {
        self.check_failure().await?;
        self.room_details
            .lock()
            .await
            .get(room_id)
            .cloned()
            .ok_or_else(|| ApiException::new(ErrorCode::NotFound, "room not found").into())
    }

    async fn create_room(&self, _request: CreateRoomRequest) -> Result<RoomSummary> {
        self.check_failure().await?;
        self.create_result
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow!("create_room not configured"))
    }

    async fn join_room(&self, room_id: &RoomId) -> Result<RoomSummary> {
        self.room_detail(room_id).await
    }

    async fn leave_room(&self, _room_id: &RoomId) -> Result<()> {
        self.check_failure().await
    }

    async fn delete_room(&self, _room_id: &RoomId) -> Result<()> {
        self.check_failure().await
    }

    async fn room_messages(
        &self,
        room_id: &RoomId,
        _limit: u32,
        _offset: u32,
    ) -> Result<Vec<MessagePayload>> {
        self.check_failure().await?;
        Ok(self
            .messages
            .lock()
            .await
            .get(room_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn room_members(&self, room_id: &RoomId) -> Result<Vec<MemberSummary>> {
        self.check_failure().await?;
        Ok(self
            .members
            .lock()
            .await
            .get(room_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct RecordingPushSender {
    pub commands: Mutex<Vec<shared::protocol::ClientCommand>>,
    pub fail: Mutex<bool>,
}

impl RecordingPushSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl PushSender for RecordingPushSender {
    async fn send(&self, command: shared::protocol::ClientCommand) -> Result<()> {
        if *self.fail.lock().await {
            return Err(anyhow!("push channel is not connected"));
        }
        self.commands.lock().await.push(command);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySlot {
    pub token: Mutex<Option<String>>,
}

#[async_trait]
impl SessionSlot for MemorySlot {
    async fn load(&self) -> Result<Option<String>> {
        Ok(self.token.lock().await.clone())
    }

    async fn store(&self, token: &str) -> Result<()> {
        *self.token.lock().await = Some(token.to_string());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.token.lock().await = None;
        Ok(())
    }
}
