//! Authoritative in-memory chat state: rooms, ordered message lists, member
//! lists, and the room-key registry.
//!
//! The cache reconciles snapshot loads from the pull boundary with live
//! push deltas. Both paths converge on [`ChatCache::apply_message`], which
//! is idempotent per message id, so a pull/push race that redelivers the
//! same message leaves exactly one copy. All mutations go through a single
//! `Mutex<CacheState>`; no two read-modify-write sequences on a room's
//! message list can interleave.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use shared::{
    domain::{MessageId, MessageKind, RoomId, UserId},
    error::ApiException,
    protocol::{
        ClientCommand, CreateRoomRequest, MemberSummary, MessagePayload, PushEvent, RoomSummary,
    },
};

use crate::{
    api::ChatApi,
    crypto::{CryptoEngine, CryptoError},
    sync::PushSender,
};

/// Shown in place of a message body the engine cannot decrypt. A per-message
/// failure never aborts the surrounding load or apply.
pub const DECRYPT_PLACEHOLDER: &str = "[unable to decrypt]";

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "gif", "webp", "bmp"];
const VIDEO_EXTENSIONS: [&str; 5] = ["mp4", "mov", "avi", "mkv", "webm"];

#[derive(Debug, Error)]
pub enum SendError {
    #[error("no encryption key registered for room {0}")]
    MissingRoomKey(RoomId),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("push channel send failed: {0}")]
    Channel(anyhow::Error),
}

/// A message as held locally: the wire fields plus the derived plaintext.
/// `content` exists only in this cache; it is recomputed whenever the
/// ciphertext or the room key changes and is never sent outward.
#[derive(Debug, Clone)]
pub struct CachedMessage {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub encrypted_content: String,
    pub kind: MessageKind,
    pub attachments: Vec<String>,
    pub sent_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    pub content: String,
}

/// Change notices broadcast to presentation subscribers.
#[derive(Debug, Clone)]
pub enum CacheUpdate {
    RoomsChanged,
    MessagesChanged { room_id: RoomId },
    MembersChanged { room_id: RoomId },
    TypingChanged { room_id: RoomId },
    PresenceChanged { user_id: UserId },
    ConnectionChanged { connected: bool },
    ErrorChanged { message: Option<String> },
}

#[derive(Default)]
struct CacheState {
    rooms: Vec<RoomSummary>,
    messages: HashMap<RoomId, Vec<CachedMessage>>,
    members: HashMap<RoomId, Vec<MemberSummary>>,
    room_keys: HashMap<RoomId, String>,
    typing: HashMap<RoomId, BTreeSet<UserId>>,
    presence: HashMap<UserId, bool>,
    selected_room: Option<RoomId>,
    last_error: Option<String>,
}

pub struct ChatCache {
    api: Arc<dyn ChatApi>,
    crypto: Arc<CryptoEngine>,
    push: Arc<dyn PushSender>,
    inner: Mutex<CacheState>,
    updates: broadcast::Sender<CacheUpdate>,
    page_size: u32,
}

impl ChatCache {
    pub fn new(
        api: Arc<dyn ChatApi>,
        crypto: Arc<CryptoEngine>,
        push: Arc<dyn PushSender>,
        page_size: u32,
    ) -> Arc<Self> {
        let (updates, _) = broadcast::channel(1024);
        Arc::new(Self {
            api,
            crypto,
            push,
            inner: Mutex::new(CacheState::default()),
            updates,
            page_size,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheUpdate> {
        self.updates.subscribe()
    }

    /// Replace the room list from the pull boundary. Per-room message and
    /// member caches for rooms absent from the new list are left stale, not
    /// evicted; only leave/delete evicts.
    pub async fn load_rooms(&self) -> Result<()> {
        let rooms = match self.api.list_rooms().await {
            Ok(rooms) => rooms,
            Err(err) => {
                self.record_failure(&err).await;
                return Err(err);
            }
        };
        {
            let mut state = self.inner.lock().await;
            for room in &rooms {
                if let Some(key) = &room.encryption_key {
                    state.room_keys.insert(room.room_id.clone(), key.clone());
                }
            }
            state.rooms = rooms;
        }
        self.notify(CacheUpdate::RoomsChanged);
        Ok(())
    }

    /// Make `room_id` the current room: refresh its descriptor (and key),
    /// join it on the push channel, then load its history and members.
    /// Idempotent; selecting the already-selected room re-syncs it.
    pub async fn select_room(&self, room_id: &RoomId) -> Result<()> {
        let room = match self.api.room_detail(room_id).await {
            Ok(room) => room,
            Err(err) => {
                self.record_failure(&err).await;
                return Err(err);
            }
        };
        {
            let mut state = self.inner.lock().await;
            if let Some(key) = &room.encryption_key {
                state.room_keys.insert(room.room_id.clone(), key.clone());
            }
            upsert_room(&mut state.rooms, room);
            state.selected_room = Some(room_id.clone());
        }
        self.notify(CacheUpdate::RoomsChanged);

        if let Err(err) = self
            .push
            .send(ClientCommand::JoinRoom {
                room_id: room_id.clone(),
            })
            .await
        {
            warn!(room_id = %room_id, error = %err, "cache: push join failed");
        }

        self.load_messages(room_id).await?;
        self.load_members(room_id).await?;
        Ok(())
    }

    pub async fn selected_room(&self) -> Option<RoomId> {
        self.inner.lock().await.selected_room.clone()
    }

    /// Load one page of history. The wire delivers newest-first; the cache
    /// stores chronological order. A message that fails to decrypt gets the
    /// placeholder body; the rest of the page is unaffected.
    pub async fn load_messages(&self, room_id: &RoomId) -> Result<()> {
        let page = match self.api.room_messages(room_id, self.page_size, 0).await {
            Ok(page) => page,
            Err(err) => {
                self.record_failure(&err).await;
                return Err(err);
            }
        };
        {
            let mut state = self.inner.lock().await;
            let key = state.room_keys.get(room_id).cloned();
            let mut messages = Vec::with_capacity(page.len());
            for payload in page.into_iter().rev() {
                messages.push(self.decrypt_payload(payload, key.as_deref()).await);
            }
            state.messages.insert(room_id.clone(), messages);
        }
        self.notify(CacheUpdate::MessagesChanged {
            room_id: room_id.clone(),
        });
        Ok(())
    }

    /// Full replacement of a room's member list.
    pub async fn load_members(&self, room_id: &RoomId) -> Result<()> {
        let members = match self.api.room_members(room_id).await {
            Ok(members) => members,
            Err(err) => {
                self.record_failure(&err).await;
                return Err(err);
            }
        };
        self.inner
            .lock()
            .await
            .members
            .insert(room_id.clone(), members);
        self.notify(CacheUpdate::MembersChanged {
            room_id: room_id.clone(),
        });
        Ok(())
    }

    /// Apply a pushed message. Idempotent: a message id already present in
    /// the room is a no-op, which makes pull/push redelivery harmless.
    pub async fn apply_message(&self, payload: MessagePayload) {
        let room_id = payload.room_id.clone();
        {
            let mut state = self.inner.lock().await;
            let already_present = state
                .messages
                .get(&room_id)
                .is_some_and(|messages| {
                    messages.iter().any(|m| m.message_id == payload.message_id)
                });
            if already_present {
                debug!(room_id = %room_id, message_id = %payload.message_id, "cache: duplicate message ignored");
                return;
            }
            let key = state.room_keys.get(&room_id).cloned();
            let message = self.decrypt_payload(payload, key.as_deref()).await;
            state.messages.entry(room_id.clone()).or_default().push(message);
        }
        self.notify(CacheUpdate::MessagesChanged { room_id });
    }

    /// Encrypt and dispatch a message. Requires a registered room key; its
    /// absence is a precondition failure reported to the caller before any
    /// channel contact. Fire-and-forget: no optimistic insert, the sender's
    /// copy arrives back through the normal `message_received` path.
    pub async fn send_message(
        &self,
        room_id: &RoomId,
        plaintext: &str,
        attachments: Vec<String>,
    ) -> Result<(), SendError> {
        let key = self.inner.lock().await.room_keys.get(room_id).cloned();
        let Some(key) = key else {
            return Err(SendError::MissingRoomKey(room_id.clone()));
        };
        let kind = kind_for_attachments(&attachments);
        let encrypted_content = self.crypto.encrypt(plaintext, &key).await?;
        self.push
            .send(ClientCommand::SendMessage {
                room_id: room_id.clone(),
                encrypted_content,
                kind,
                attachments,
            })
            .await
            .map_err(SendError::Channel)?;
        Ok(())
    }

    /// Create a room. The returned key is installed into the registry before
    /// the room becomes visible to subscribers, so message traffic that
    /// starts immediately after can decrypt.
    pub async fn create_room(&self, request: CreateRoomRequest) -> Result<RoomSummary> {
        let room = match self.api.create_room(request).await {
            Ok(room) => room,
            Err(err) => {
                self.record_failure(&err).await;
                return Err(err);
            }
        };
        self.install_room(room.clone()).await;
        Ok(room)
    }

    /// Join a room; same key-before-visibility rule as `create_room`.
    pub async fn join_room(&self, room_id: &RoomId) -> Result<RoomSummary> {
        let room = match self.api.join_room(room_id).await {
            Ok(room) => room,
            Err(err) => {
                self.record_failure(&err).await;
                return Err(err);
            }
        };
        self.install_room(room.clone()).await;
        Ok(room)
    }

    pub async fn leave_room(&self, room_id: &RoomId) -> Result<()> {
        if let Err(err) = self.api.leave_room(room_id).await {
            self.record_failure(&err).await;
            return Err(err);
        }
        self.evict_room(room_id).await;
        Ok(())
    }

    pub async fn delete_room(&self, room_id: &RoomId) -> Result<()> {
        if let Err(err) = self.api.delete_room(room_id).await {
            self.record_failure(&err).await;
            return Err(err);
        }
        self.evict_room(room_id).await;
        Ok(())
    }

    pub async fn typing(&self, room_id: &RoomId, is_typing: bool) -> Result<()> {
        self.push
            .send(ClientCommand::Typing {
                room_id: room_id.clone(),
                is_typing,
            })
            .await
    }

    pub async fn add_reaction(
        &self,
        room_id: &RoomId,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<()> {
        self.push
            .send(ClientCommand::AddReaction {
                room_id: room_id.clone(),
                message_id: message_id.clone(),
                emoji: emoji.to_string(),
            })
            .await
    }

    pub async fn remove_reaction(
        &self,
        room_id: &RoomId,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<()> {
        self.push
            .send(ClientCommand::RemoveReaction {
                room_id: room_id.clone(),
                message_id: message_id.clone(),
                emoji: emoji.to_string(),
            })
            .await
    }

    /// Edit one of our messages: re-encrypt the new body under the room key
    /// and dispatch. The cached copy is updated when the edit comes back as
    /// `message_edited`.
    pub async fn edit_message(
        &self,
        room_id: &RoomId,
        message_id: &MessageId,
        plaintext: &str,
    ) -> Result<(), SendError> {
        let key = self.inner.lock().await.room_keys.get(room_id).cloned();
        let Some(key) = key else {
            return Err(SendError::MissingRoomKey(room_id.clone()));
        };
        let encrypted_content = self.crypto.encrypt(plaintext, &key).await?;
        self.push
            .send(ClientCommand::EditMessage {
                room_id: room_id.clone(),
                message_id: message_id.clone(),
                encrypted_content,
            })
            .await
            .map_err(SendError::Channel)?;
        Ok(())
    }

    pub async fn delete_message(&self, room_id: &RoomId, message_id: &MessageId) -> Result<()> {
        self.push
            .send(ClientCommand::DeleteMessage {
                room_id: room_id.clone(),
                message_id: message_id.clone(),
            })
            .await
    }

    /// Apply one inbound push event to the cache.
    pub async fn apply_event(&self, event: PushEvent) {
        match event {
            PushEvent::ConnectionUp => self.notify(CacheUpdate::ConnectionChanged { connected: true }),
            PushEvent::ConnectionDown => {
                self.notify(CacheUpdate::ConnectionChanged { connected: false })
            }
            PushEvent::MessageReceived { message } => self.apply_message(message).await,
            PushEvent::MemberJoined { member } => {
                let room_id = member.room_id.clone();
                {
                    let mut state = self.inner.lock().await;
                    let members = state.members.entry(room_id.clone()).or_default();
                    if !members.iter().any(|m| m.user_id == member.user_id) {
                        members.push(member);
                    }
                }
                self.notify(CacheUpdate::MembersChanged { room_id });
            }
            PushEvent::MemberLeft { room_id, user_id } => {
                {
                    let mut state = self.inner.lock().await;
                    if let Some(members) = state.members.get_mut(&room_id) {
                        members.retain(|m| m.user_id != user_id);
                    }
                    if let Some(typing) = state.typing.get_mut(&room_id) {
                        typing.remove(&user_id);
                    }
                }
                self.notify(CacheUpdate::MembersChanged { room_id });
            }
            PushEvent::PresenceChanged { user_id, online } => {
                self.inner
                    .lock()
                    .await
                    .presence
                    .insert(user_id.clone(), online);
                self.notify(CacheUpdate::PresenceChanged { user_id });
            }
            PushEvent::TypingChanged {
                room_id,
                user_id,
                is_typing,
            } => {
                {
                    let mut state = self.inner.lock().await;
                    let typing = state.typing.entry(room_id.clone()).or_default();
                    if is_typing {
                        typing.insert(user_id);
                    } else {
                        typing.remove(&user_id);
                    }
                }
                self.notify(CacheUpdate::TypingChanged { room_id });
            }
            PushEvent::ReactionAdded {
                room_id,
                message_id,
                user_id,
                emoji,
            } => {
                {
                    let mut state = self.inner.lock().await;
                    if let Some(message) = find_message(&mut state, &room_id, &message_id) {
                        message.reactions.entry(emoji).or_default().insert(user_id);
                    }
                }
                self.notify(CacheUpdate::MessagesChanged { room_id });
            }
            PushEvent::ReactionRemoved {
                room_id,
                message_id,
                user_id,
                emoji,
            } => {
                {
                    let mut state = self.inner.lock().await;
                    if let Some(message) = find_message(&mut state, &room_id, &message_id) {
                        if let Some(reactors) = message.reactions.get_mut(&emoji) {
                            reactors.remove(&user_id);
                            if reactors.is_empty() {
                                message.reactions.remove(&emoji);
                            }
                        }
                    }
                }
                self.notify(CacheUpdate::MessagesChanged { room_id });
            }
            PushEvent::MessageEdited {
                room_id,
                message_id,
                encrypted_content,
                edited_at,
            } => {
                {
                    let mut state = self.inner.lock().await;
                    let key = state.room_keys.get(&room_id).cloned();
                    if let Some(message) = find_message(&mut state, &room_id, &message_id) {
                        // The derived body is recomputed from the new
                        // ciphertext, never carried over.
                        message.content =
                            self.decrypt_content(&encrypted_content, key.as_deref(), &message_id)
                                .await;
                        message.encrypted_content = encrypted_content;
                        message.edited_at = Some(edited_at);
                    }
                }
                self.notify(CacheUpdate::MessagesChanged { room_id });
            }
            PushEvent::MessageDeleted {
                room_id,
                message_id,
            } => {
                {
                    let mut state = self.inner.lock().await;
                    if let Some(messages) = state.messages.get_mut(&room_id) {
                        messages.retain(|m| m.message_id != message_id);
                    }
                }
                self.notify(CacheUpdate::MessagesChanged { room_id });
            }
            PushEvent::ChannelError(error) => {
                warn!(code = ?error.code, message = %error.message, "cache: push channel error");
                self.record_error_message(error.message).await;
            }
        }
    }

    pub async fn rooms(&self) -> Vec<RoomSummary> {
        self.inner.lock().await.rooms.clone()
    }

    pub async fn messages(&self, room_id: &RoomId) -> Vec<CachedMessage> {
        self.inner
            .lock()
            .await
            .messages
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Messages of the currently selected room, or empty when none is
    /// selected.
    pub async fn current_messages(&self) -> Vec<CachedMessage> {
        let state = self.inner.lock().await;
        state
            .selected_room
            .as_ref()
            .and_then(|room_id| state.messages.get(room_id))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn members(&self, room_id: &RoomId) -> Vec<MemberSummary> {
        self.inner
            .lock()
            .await
            .members
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn typing_users(&self, room_id: &RoomId) -> Vec<UserId> {
        self.inner
            .lock()
            .await
            .typing
            .get(room_id)
            .map(|users| users.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_online(&self, user_id: &UserId) -> bool {
        self.inner
            .lock()
            .await
            .presence
            .get(user_id)
            .copied()
            .unwrap_or(false)
    }

    pub async fn has_room_key(&self, room_id: &RoomId) -> bool {
        self.inner.lock().await.room_keys.contains_key(room_id)
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.lock().await.last_error.clone()
    }

    pub async fn clear_error(&self) {
        self.inner.lock().await.last_error = None;
        self.notify(CacheUpdate::ErrorChanged { message: None });
    }

    /// Drop all session-scoped state. Called on logout; keys never outlive
    /// the session that installed them.
    pub async fn reset(&self) {
        {
            let mut state = self.inner.lock().await;
            *state = CacheState::default();
        }
        self.notify(CacheUpdate::RoomsChanged);
    }

    async fn install_room(&self, room: RoomSummary) {
        {
            let mut state = self.inner.lock().await;
            if let Some(key) = &room.encryption_key {
                state.room_keys.insert(room.room_id.clone(), key.clone());
            }
            upsert_room(&mut state.rooms, room);
        }
        self.notify(CacheUpdate::RoomsChanged);
    }

    async fn evict_room(&self, room_id: &RoomId) {
        if let Err(err) = self
            .push
            .send(ClientCommand::LeaveRoom {
                room_id: room_id.clone(),
            })
            .await
        {
            warn!(room_id = %room_id, error = %err, "cache: push leave failed");
        }
        {
            let mut state = self.inner.lock().await;
            state.rooms.retain(|room| &room.room_id != room_id);
            state.messages.remove(room_id);
            state.members.remove(room_id);
            state.room_keys.remove(room_id);
            state.typing.remove(room_id);
            if state.selected_room.as_ref() == Some(room_id) {
                state.selected_room = None;
            }
        }
        self.notify(CacheUpdate::RoomsChanged);
        self.notify(CacheUpdate::MessagesChanged {
            room_id: room_id.clone(),
        });
    }

    async fn decrypt_payload(
        &self,
        payload: MessagePayload,
        key: Option<&str>,
    ) -> CachedMessage {
        let content = self
            .decrypt_content(&payload.encrypted_content, key, &payload.message_id)
            .await;
        CachedMessage {
            message_id: payload.message_id,
            room_id: payload.room_id,
            sender_id: payload.sender_id,
            encrypted_content: payload.encrypted_content,
            kind: payload.kind,
            attachments: payload.attachments,
            sent_at: payload.sent_at,
            edited_at: payload.edited_at,
            reactions: BTreeMap::new(),
            content,
        }
    }

    async fn decrypt_content(
        &self,
        encrypted_content: &str,
        key: Option<&str>,
        message_id: &MessageId,
    ) -> String {
        let Some(key) = key else {
            debug!(message_id = %message_id, "cache: no room key registered, using placeholder");
            return DECRYPT_PLACEHOLDER.to_string();
        };
        match self.crypto.decrypt(encrypted_content, key).await {
            Ok(plaintext) => plaintext,
            Err(err) => {
                warn!(message_id = %message_id, error = %err, "cache: message decrypt failed");
                DECRYPT_PLACEHOLDER.to_string()
            }
        }
    }

    async fn record_failure(&self, err: &anyhow::Error) {
        let message = err
            .downcast_ref::<ApiException>()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| err.to_string());
        self.record_error_message(message).await;
    }

    async fn record_error_message(&self, message: String) {
        self.inner.lock().await.last_error = Some(message.clone());
        self.notify(CacheUpdate::ErrorChanged {
            message: Some(message),
        });
    }

    fn notify(&self, update: CacheUpdate) {
        // No subscribers is fine; broadcast errors only mean that.
        let _ = self.updates.send(update);
    }
}

fn upsert_room(rooms: &mut Vec<RoomSummary>, room: RoomSummary) {
    if let Some(existing) = rooms.iter_mut().find(|r| r.room_id == room.room_id) {
        *existing = room;
    } else {
        rooms.push(room);
    }
}

fn find_message<'a>(
    state: &'a mut CacheState,
    room_id: &RoomId,
    message_id: &MessageId,
) -> Option<&'a mut CachedMessage> {
    state
        .messages
        .get_mut(room_id)?
        .iter_mut()
        .find(|m| &m.message_id == message_id)
}

/// Message kind is decided by the first attachment's extension,
/// case-insensitively; without attachments the message is plain text.
fn kind_for_attachments(attachments: &[String]) -> MessageKind {
    let Some(first) = attachments.first() else {
        return MessageKind::Text;
    };
    let extension = first
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        MessageKind::Image
    } else if VIDEO_EXTENSIONS.contains(&extension.as_str()) {
        MessageKind::Video
    } else {
        MessageKind::File
    }
}
