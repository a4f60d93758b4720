//! Session lifecycle: authentication state machine and the durable token
//! slot. Every state transition is the single source of truth for whether
//! the push channel is open.

use std::{io::ErrorKind, path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use shared::protocol::{Credentials, NewProfile, SessionResponse, UserSummary};

use crate::{api::ChatApi, sync::SyncChannel};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Anonymous,
    Authenticating,
    Authenticated { user: UserSummary },
    Error { message: String },
}

/// Durable single-slot storage for the bearer token. Read at process start
/// for session restore, written on login/register, cleared on logout or
/// restore failure.
#[async_trait]
pub trait SessionSlot: Send + Sync {
    async fn load(&self) -> Result<Option<String>>;
    async fn store(&self, token: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

pub struct FileSessionSlot {
    path: PathBuf,
}

impl FileSessionSlot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SessionSlot for FileSessionSlot {
    async fn load(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => {
                let token = raw.trim().to_string();
                Ok((!token.is_empty()).then_some(token))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| {
                format!("failed to read session slot {}", self.path.display())
            }),
        }
    }

    async fn store(&self, token: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("failed to create session slot directory {}", parent.display())
            })?;
        }
        tokio::fs::write(&self.path, token)
            .await
            .with_context(|| format!("failed to write session slot {}", self.path.display()))
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| {
                format!("failed to clear session slot {}", self.path.display())
            }),
        }
    }
}

pub struct SessionManager {
    api: Arc<dyn ChatApi>,
    slot: Arc<dyn SessionSlot>,
    channel: Arc<SyncChannel>,
    state: Mutex<SessionState>,
}

impl SessionManager {
    pub fn new(
        api: Arc<dyn ChatApi>,
        slot: Arc<dyn SessionSlot>,
        channel: Arc<SyncChannel>,
    ) -> Self {
        Self {
            api,
            slot,
            channel,
            state: Mutex::new(SessionState::Anonymous),
        }
    }

    pub async fn state(&self) -> SessionState {
        self.state.lock().await.clone()
    }

    pub async fn login(&self, credentials: Credentials) -> Result<UserSummary> {
        self.begin_authentication().await?;
        let username = credentials.username.clone();
        match self.api.login(credentials).await {
            Ok(session) => {
                info!(username = %username, "session: login succeeded");
                self.complete_authentication(session).await
            }
            Err(err) => {
                self.fail_authentication(&err).await;
                Err(err)
            }
        }
    }

    pub async fn register(&self, profile: NewProfile) -> Result<UserSummary> {
        self.begin_authentication().await?;
        let username = profile.username.clone();
        match self.api.register(profile).await {
            Ok(session) => {
                info!(username = %username, "session: registration succeeded");
                self.complete_authentication(session).await
            }
            Err(err) => {
                self.fail_authentication(&err).await;
                Err(err)
            }
        }
    }

    /// Attempt to resume a previous session from the durable slot. A stale
    /// or revoked token is cleared on the first failed attempt and never
    /// retried silently.
    pub async fn restore_session(&self) -> Result<Option<UserSummary>> {
        let Some(token) = self.slot.load().await? else {
            return Ok(None);
        };

        *self.state.lock().await = SessionState::Authenticating;
        self.api.set_bearer_token(Some(token.clone())).await;
        match self.api.current_user().await {
            Ok(user) => {
                if let Err(err) = self.channel.connect(&token).await {
                    self.fail_authentication(&err).await;
                    return Err(err);
                }
                *self.state.lock().await = SessionState::Authenticated { user: user.clone() };
                info!(user_id = %user.user_id, "session: restored from durable slot");
                Ok(Some(user))
            }
            Err(err) => {
                warn!(error = %err, "session: restore failed, clearing stored token");
                self.slot.clear().await?;
                self.api.set_bearer_token(None).await;
                *self.state.lock().await = SessionState::Anonymous;
                Ok(None)
            }
        }
    }

    /// Tear down the session. Remote logout is best-effort; local teardown
    /// always completes.
    pub async fn logout(&self) {
        if let Err(err) = self.api.logout().await {
            warn!(error = %err, "session: remote logout failed, clearing local session anyway");
        }
        if let Err(err) = self.slot.clear().await {
            warn!(error = %err, "session: failed to clear durable token slot");
        }
        self.api.set_bearer_token(None).await;
        self.channel.disconnect().await;
        *self.state.lock().await = SessionState::Anonymous;
        info!("session: logged out");
    }

    async fn begin_authentication(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match &*state {
            SessionState::Anonymous | SessionState::Error { .. } => {
                *state = SessionState::Authenticating;
                Ok(())
            }
            SessionState::Authenticating => bail!("authentication already in progress"),
            SessionState::Authenticated { .. } => bail!("already authenticated; log out first"),
        }
    }

    async fn complete_authentication(&self, session: SessionResponse) -> Result<UserSummary> {
        if let Err(err) = self.slot.store(&session.token).await {
            let err = err.context("failed to persist session token");
            self.fail_authentication(&err).await;
            return Err(err);
        }
        self.api.set_bearer_token(Some(session.token.clone())).await;
        if let Err(err) = self.channel.connect(&session.token).await {
            self.fail_authentication(&err).await;
            return Err(err);
        }
        *self.state.lock().await = SessionState::Authenticated {
            user: session.user.clone(),
        };
        Ok(session.user)
    }

    async fn fail_authentication(&self, err: &anyhow::Error) {
        *self.state.lock().await = SessionState::Error {
            message: err.to_string(),
        };
    }
}
