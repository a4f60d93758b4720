//! Persistent push channel and its subscription fan-out.
//!
//! One websocket per authenticated session, carrying the bearer token as a
//! connect-time credential. Inbound frames are decoded once into `PushEvent`
//! and fanned out to per-kind subscribers; outbound commands are
//! fire-and-forget. Frames arrive in transport order; consumers dedup by
//! message id, never by arrival position.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared::{
    error::{ApiError, ErrorCode},
    protocol::{ClientCommand, EventKind, PushEvent},
};

/// Outbound half of the push boundary, split out as a seam so the cache can
/// be tested against a recording double.
#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, command: ClientCommand) -> Result<()>;
}

#[derive(Default)]
struct Registry {
    listeners: HashMap<EventKind, HashMap<Uuid, mpsc::UnboundedSender<PushEvent>>>,
}

/// Handle returned by [`SyncChannel::subscribe`]. Dropping it cancels only
/// this registration; other listeners for the same kinds are unaffected.
pub struct Subscription {
    id: Uuid,
    kinds: Vec<EventKind>,
    registry: Arc<StdMutex<Registry>>,
    receiver: mpsc::UnboundedReceiver<PushEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<PushEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PushEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        for kind in &self.kinds {
            if let Some(listeners) = registry.listeners.get_mut(kind) {
                listeners.remove(&self.id);
            }
        }
    }
}

struct Connection {
    id: Uuid,
    outbound: mpsc::UnboundedSender<Message>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

pub struct SyncChannel {
    ws_url: String,
    registry: Arc<StdMutex<Registry>>,
    conn: Mutex<Option<Connection>>,
}

impl SyncChannel {
    pub fn new(ws_url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            ws_url: ws_url.into(),
            registry: Arc::new(StdMutex::new(Registry::default())),
            conn: Mutex::new(None),
        })
    }

    /// Register a listener for the given event kinds.
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            for kind in kinds {
                registry
                    .listeners
                    .entry(*kind)
                    .or_default()
                    .insert(id, tx.clone());
            }
        }
        Subscription {
            id,
            kinds: kinds.to_vec(),
            registry: Arc::clone(&self.registry),
            receiver: rx,
        }
    }

    /// Open the connection with `token` as the capability credential.
    /// Connecting while already connected is a no-op.
    pub async fn connect(self: &Arc<Self>, token: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        if conn.is_some() {
            debug!("sync: connect skipped, channel already open");
            return Ok(());
        }

        let url = format!("{}?token={token}", self.ws_url);
        let (stream, _) = connect_async(&url)
            .await
            .with_context(|| format!("failed to connect push channel: {}", self.ws_url))?;
        let (mut sink, mut reader) = stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let connection_id = Uuid::new_v4();
        let channel = Arc::clone(self);
        let reader_task = tokio::spawn(async move {
            channel.dispatch(PushEvent::ConnectionUp);
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<PushEvent>(&text) {
                        Ok(event) => channel.dispatch(event),
                        Err(err) => {
                            warn!(error = %err, "sync: undecodable push frame");
                            channel.dispatch(PushEvent::ChannelError(ApiError::new(
                                ErrorCode::Validation,
                                format!("invalid push event: {err}"),
                            )));
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        channel.dispatch(PushEvent::ChannelError(ApiError::new(
                            ErrorCode::Internal,
                            format!("push channel receive failed: {err}"),
                        )));
                        break;
                    }
                }
            }
            {
                // Only clear our own entry; a reconnect may have replaced it.
                let mut conn = channel.conn.lock().await;
                if conn.as_ref().is_some_and(|c| c.id == connection_id) {
                    *conn = None;
                }
            }
            channel.dispatch(PushEvent::ConnectionDown);
        });

        *conn = Some(Connection {
            id: connection_id,
            outbound,
            reader_task,
            writer_task,
        });
        info!("sync: push channel connected");
        Ok(())
    }

    /// Close the connection. Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        let previous = self.conn.lock().await.take();
        if let Some(connection) = previous {
            connection.reader_task.abort();
            connection.writer_task.abort();
            info!("sync: push channel disconnected");
            self.dispatch(PushEvent::ConnectionDown);
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    fn dispatch(&self, event: PushEvent) {
        let targets: Vec<mpsc::UnboundedSender<PushEvent>> = {
            let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry
                .listeners
                .get(&event.kind())
                .map(|listeners| listeners.values().cloned().collect())
                .unwrap_or_default()
        };
        for target in targets {
            // A listener whose receiver is gone must not block the rest.
            let _ = target.send(event.clone());
        }
    }
}

#[async_trait]
impl PushSender for SyncChannel {
    async fn send(&self, command: ClientCommand) -> Result<()> {
        let conn = self.conn.lock().await;
        let Some(connection) = conn.as_ref() else {
            return Err(anyhow!("push channel is not connected"));
        };
        let frame = Message::Text(
            serde_json::to_string(&command).context("failed to encode outbound command")?,
        );
        connection
            .outbound
            .send(frame)
            .map_err(|_| anyhow!("push channel writer is gone"))?;
        Ok(())
    }
}

/// Derive the push endpoint from the HTTP base URL by scheme replacement.
pub fn websocket_url(server_url: &str) -> Result<String> {
    let ws_base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(anyhow!("server url must start with http:// or https://"));
    };
    Ok(format!("{}/sync", ws_base.trim_end_matches('/')))
}
