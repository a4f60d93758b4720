//! Request/response boundary: snapshot loads and account operations.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use url::Url;

use shared::{
    domain::RoomId,
    error::{ApiError, ApiException},
    protocol::{
        CreateRoomRequest, Credentials, MemberSummary, MessagePayload, NewProfile, RoomSummary,
        SessionResponse, UserSummary,
    },
};

/// Pull boundary consumed by the session manager and the chat cache. The
/// trait seam exists so engine flows can be exercised against in-process
/// doubles.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Install or clear the bearer token attached to every later request.
    async fn set_bearer_token(&self, token: Option<String>);

    async fn login(&self, credentials: Credentials) -> Result<SessionResponse>;
    async fn register(&self, profile: NewProfile) -> Result<SessionResponse>;
    async fn logout(&self) -> Result<()>;
    async fn current_user(&self) -> Result<UserSummary>;

    async fn list_rooms(&self) -> Result<Vec<RoomSummary>>;
    async fn room_detail(&self, room_id: &RoomId) -> Result<RoomSummary>;
    async fn create_room(&self, request: CreateRoomRequest) -> Result<RoomSummary>;
    async fn join_room(&self, room_id: &RoomId) -> Result<RoomSummary>;
    async fn leave_room(&self, room_id: &RoomId) -> Result<()>;
    async fn delete_room(&self, room_id: &RoomId) -> Result<()>;

    async fn room_messages(
        &self,
        room_id: &RoomId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MessagePayload>>;
    async fn room_members(&self, room_id: &RoomId) -> Result<Vec<MemberSummary>>;
}

pub struct HttpChatApi {
    http: reqwest::Client,
    base_url: String,
    bearer: RwLock<Option<String>>,
}

impl HttpChatApi {
    pub fn new(server_url: &str) -> Result<Self> {
        Url::parse(server_url).with_context(|| format!("invalid server url: {server_url}"))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: server_url.trim_end_matches('/').to_string(),
            bearer: RwLock::new(None),
        })
    }

    async fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{path}", self.base_url));
        if let Some(token) = self.bearer.read().await.as_deref() {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let response = into_api_result(response).await?;
        response
            .json()
            .await
            .context("failed to decode response body")
    }

    async fn expect_ok(response: Response) -> Result<()> {
        into_api_result(response).await?;
        Ok(())
    }
}

/// Map a non-success response into the structured `ApiError` shape when the
/// server sent one, keeping its human-readable message intact.
async fn into_api_result(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if let Ok(api_error) = serde_json::from_str::<ApiError>(&body) {
        return Err(ApiException::from(api_error).into());
    }
    Err(anyhow!("request failed with status {status}: {body}"))
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn set_bearer_token(&self, token: Option<String>) {
        *self.bearer.write().await = token;
    }

    async fn login(&self, credentials: Credentials) -> Result<SessionResponse> {
        let response = self
            .request(Method::POST, "/auth/login")
            .await
            .json(&credentials)
            .send()
            .await
            .context("login request failed")?;
        Self::decode(response).await
    }

    async fn register(&self, profile: NewProfile) -> Result<SessionResponse> {
        let response = self
            .request(Method::POST, "/auth/register")
            .await
            .json(&profile)
            .send()
            .await
            .context("register request failed")?;
        Self::decode(response).await
    }

    async fn logout(&self) -> Result<()> {
        let response = self
            .request(Method::POST, "/auth/logout")
            .await
            .send()
            .await
            .context("logout request failed")?;
        Self::expect_ok(response).await
    }

    async fn current_user(&self) -> Result<UserSummary> {
        let response = self
            .request(Method::GET, "/auth/me")
            .await
            .send()
            .await
            .context("identity request failed")?;
        Self::decode(response).await
    }

    async fn list_rooms(&self) -> Result<Vec<RoomSummary>> {
        let response = self
            .request(Method::GET, "/rooms")
            .await
            .send()
            .await
            .context("room list request failed")?;
        Self::decode(response).await
    }

    async fn room_detail(&self, room_id: &RoomId) -> Result<RoomSummary> {
        let response = self
            .request(Method::GET, &format!("/rooms/{room_id}"))
            .await
            .send()
            .await
            .context("room detail request failed")?;
        Self::decode(response).await
    }

    async fn create_room(&self, request: CreateRoomRequest) -> Result<RoomSummary> {
        let response = self
            .request(Method::POST, "/rooms")
            .await
            .json(&request)
            .send()
            .await
            .context("room create request failed")?;
        Self::decode(response).await
    }

    async fn join_room(&self, room_id: &RoomId) -> Result<RoomSummary> {
        let response = self
            .request(Method::POST, &format!("/rooms/{room_id}/join"))
            .await
            .send()
            .await
            .context("room join request failed")?;
        Self::decode(response).await
    }

    async fn leave_room(&self, room_id: &RoomId) -> Result<()> {
        let response = self
            .request(Method::POST, &format!("/rooms/{room_id}/leave"))
            .await
            .send()
            .await
            .context("room leave request failed")?;
        Self::expect_ok(response).await
    }

    async fn delete_room(&self, room_id: &RoomId) -> Result<()> {
        let response = self
            .request(Method::DELETE, &format!("/rooms/{room_id}"))
            .await
            .send()
            .await
            .context("room delete request failed")?;
        Self::expect_ok(response).await
    }

    async fn room_messages(
        &self,
        room_id: &RoomId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MessagePayload>> {
        let limit = limit.clamp(1, 100);
        let response = self
            .request(Method::GET, &format!("/rooms/{room_id}/messages"))
            .await
            .query(&[("limit", limit), ("offset", offset)])
            .send()
            .await
            .context("message history request failed")?;
        Self::decode(response).await
    }

    async fn room_members(&self, room_id: &RoomId) -> Result<Vec<MemberSummary>> {
        let response = self
            .request(Method::GET, &format!("/rooms/{room_id}/members"))
            .await
            .send()
            .await
            .context("member list request failed")?;
        Self::decode(response).await
    }
}
