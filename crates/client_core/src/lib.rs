//! Client-side synchronization and encryption engine for group chat.
//!
//! The engine merges REST-fetched snapshots with live push events into one
//! consistent in-memory view, encrypts and decrypts every message body with
//! per-room symmetric keys, and notifies presentation subscribers of state
//! changes.

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::debug;

use shared::protocol::EventKind;

pub mod api;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod session;
pub mod sync;

pub use api::{ChatApi, HttpChatApi};
pub use cache::{CacheUpdate, CachedMessage, ChatCache, SendError, DECRYPT_PLACEHOLDER};
pub use config::{load_settings, ClientConfig};
pub use crypto::{CryptoEngine, CryptoError};
pub use session::{FileSessionSlot, SessionManager, SessionSlot, SessionState};
pub use sync::{websocket_url, PushSender, Subscription, SyncChannel};

/// Explicit engine context: one instance per process, constructed at startup
/// and passed to consumers. Owns the collaborators and the pump task that
/// drains push events into the cache.
pub struct ChatClient {
    pub crypto: Arc<CryptoEngine>,
    pub api: Arc<dyn ChatApi>,
    pub channel: Arc<SyncChannel>,
    pub cache: Arc<ChatCache>,
    pub session: Arc<SessionManager>,
    pump: JoinHandle<()>,
}

impl ChatClient {
    pub fn new(config: &ClientConfig) -> Result<Arc<Self>> {
        let api: Arc<dyn ChatApi> = Arc::new(HttpChatApi::new(&config.server_url)?);
        let channel = SyncChannel::new(websocket_url(&config.server_url)?);
        let slot: Arc<dyn SessionSlot> = Arc::new(FileSessionSlot::new(&config.session_file));
        Ok(Self::with_collaborators(
            api,
            channel,
            slot,
            config.history_page_size,
        ))
    }

    /// Constructor-injected variant for tests and alternative transports.
    pub fn with_collaborators(
        api: Arc<dyn ChatApi>,
        channel: Arc<SyncChannel>,
        slot: Arc<dyn SessionSlot>,
        history_page_size: u32,
    ) -> Arc<Self> {
        let crypto = Arc::new(CryptoEngine::new());
        let cache = ChatCache::new(
            Arc::clone(&api),
            Arc::clone(&crypto),
            channel.clone(),
            history_page_size,
        );
        let session = Arc::new(SessionManager::new(
            Arc::clone(&api),
            slot,
            Arc::clone(&channel),
        ));
        let pump = spawn_event_pump(&channel, &cache);
        Arc::new(Self {
            crypto,
            api,
            channel,
            cache,
            session,
            pump,
        })
    }

    /// Log out and drop all session-scoped cache state.
    pub async fn logout(&self) {
        self.session.logout().await;
        self.cache.reset().await;
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn spawn_event_pump(channel: &Arc<SyncChannel>, cache: &Arc<ChatCache>) -> JoinHandle<()> {
    let mut subscription = channel.subscribe(&EventKind::ALL);
    let cache = Arc::clone(cache);
    tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            cache.apply_event(event).await;
        }
        debug!("engine: event pump stopped");
    })
}

#[cfg(test)]
mod tests;
