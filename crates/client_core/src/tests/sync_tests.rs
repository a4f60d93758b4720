use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc, Mutex},
};

use shared::{
    domain::{RoomId, UserId},
    protocol::{ClientCommand, EventKind, PushEvent},
};

use super::support::{message, room, test_key, MemorySlot, MockChatApi};
use crate::{
    crypto::CryptoEngine,
    sync::{websocket_url, PushSender, SyncChannel},
    ChatClient,
};

#[derive(Clone)]
struct SyncServerState {
    frames: broadcast::Sender<String>,
    inbound: mpsc::UnboundedSender<String>,
    connections: Arc<AtomicUsize>,
    tokens: Arc<Mutex<Vec<String>>>,
}

struct SyncHarness {
    frames: broadcast::Sender<String>,
    inbound: Mutex<mpsc::UnboundedReceiver<String>>,
    connections: Arc<AtomicUsize>,
    tokens: Arc<Mutex<Vec<String>>>,
}

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

async fn handle_sync(
    State(state): State<SyncServerState>,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    state.tokens.lock().await.push(query.token);
    state.connections.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(move |socket| relay_socket(socket, state))
}

async fn relay_socket(mut socket: WebSocket, state: SyncServerState) {
    let mut frames = state.frames.subscribe();
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(text) => {
                    if socket.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = state.inbound.send(text);
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn spawn_sync_server() -> Result<(String, SyncHarness)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (frames, _) = broadcast::channel(64);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let connections = Arc::new(AtomicUsize::new(0));
    let tokens = Arc::new(Mutex::new(Vec::new()));
    let state = SyncServerState {
        frames: frames.clone(),
        inbound: inbound_tx,
        connections: connections.clone(),
        tokens: tokens.clone(),
    };
    let app = Router::new()
        .route("/sync", get(handle_sync))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((
        format!("http://{addr}"),
        SyncHarness {
            frames,
            inbound: Mutex::new(inbound_rx),
            connections,
            tokens,
        },
    ))
}

fn encode(event: &PushEvent) -> String {
    serde_json::to_string(event).expect("encode event")
}

async fn recv_with_timeout(
    subscription: &mut crate::sync::Subscription,
) -> PushEvent {
    tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .expect("event timeout")
        .expect("subscription closed")
}

#[tokio::test]
async fn connect_while_connected_is_a_noop() {
    let (server_url, harness) = spawn_sync_server().await.expect("spawn server");
    let channel = SyncChannel::new(websocket_url(&server_url).expect("url"));

    channel.connect("tok-1").await.expect("first connect");
    channel.connect("tok-1").await.expect("second connect");

    assert!(channel.is_connected().await);
    assert_eq!(harness.connections.load(Ordering::SeqCst), 1);
    assert_eq!(harness.tokens.lock().await.clone(), vec!["tok-1".to_string()]);
}

#[tokio::test]
async fn events_fan_out_to_independent_subscribers() {
    let (server_url, harness) = spawn_sync_server().await.expect("spawn server");
    let channel = SyncChannel::new(websocket_url(&server_url).expect("url"));

    let mut first = channel.subscribe(&[EventKind::TypingChanged]);
    let mut second = channel.subscribe(&[EventKind::TypingChanged]);
    channel.connect("tok").await.expect("connect");

    let typing = PushEvent::TypingChanged {
        room_id: RoomId::new("r1"),
        user_id: UserId::new("bob"),
        is_typing: true,
    };
    harness.frames.send(encode(&typing)).expect("send frame");

    assert!(matches!(
        recv_with_timeout(&mut first).await,
        PushEvent::TypingChanged { .. }
    ));
    assert!(matches!(
        recv_with_timeout(&mut second).await,
        PushEvent::TypingChanged { .. }
    ));

    // Cancelling one registration must not affect the other.
    drop(first);
    harness.frames.send(encode(&typing)).expect("send frame");
    assert!(matches!(
        recv_with_timeout(&mut second).await,
        PushEvent::TypingChanged { .. }
    ));
}

#[tokio::test]
async fn subscribers_only_see_their_registered_kinds() {
    let (server_url, harness) = spawn_sync_server().await.expect("spawn server");
    let channel = SyncChannel::new(websocket_url(&server_url).expect("url"));

    let mut typing_only = channel.subscribe(&[EventKind::TypingChanged]);
    channel.connect("tok").await.expect("connect");

    let presence = PushEvent::PresenceChanged {
        user_id: UserId::new("bob"),
        online: true,
    };
    let typing = PushEvent::TypingChanged {
        room_id: RoomId::new("r1"),
        user_id: UserId::new("bob"),
        is_typing: true,
    };
    harness.frames.send(encode(&presence)).expect("send frame");
    harness.frames.send(encode(&typing)).expect("send frame");

    // The first event delivered must be the typing one; the presence event
    // was never enqueued for this subscription.
    assert!(matches!(
        recv_with_timeout(&mut typing_only).await,
        PushEvent::TypingChanged { .. }
    ));
    assert!(typing_only.try_recv().is_none());
}

#[tokio::test]
async fn undecodable_frames_surface_as_channel_errors_without_killing_the_connection() {
    let (server_url, harness) = spawn_sync_server().await.expect("spawn server");
    let channel = SyncChannel::new(websocket_url(&server_url).expect("url"));

    let mut subscription =
        channel.subscribe(&[EventKind::ChannelError, EventKind::TypingChanged]);
    channel.connect("tok").await.expect("connect");

    harness
        .frames
        .send("this is not a push event".to_string())
        .expect("send frame");
    assert!(matches!(
        recv_with_timeout(&mut subscription).await,
        PushEvent::ChannelError(_)
    ));

    let typing = PushEvent::TypingChanged {
        room_id: RoomId::new("r1"),
        user_id: UserId::new("bob"),
        is_typing: true,
    };
    harness.frames.send(encode(&typing)).expect("send frame");
    assert!(matches!(
        recv_with_timeout(&mut subscription).await,
        PushEvent::TypingChanged { .. }
    ));
    assert!(channel.is_connected().await);
}

#[tokio::test]
async fn outbound_commands_reach_the_server_as_typed_payloads() {
    let (server_url, harness) = spawn_sync_server().await.expect("spawn server");
    let channel = SyncChannel::new(websocket_url(&server_url).expect("url"));
    channel.connect("tok").await.expect("connect");

    channel
        .send(ClientCommand::JoinRoom {
            room_id: RoomId::new("r1"),
        })
        .await
        .expect("send");

    let raw = tokio::time::timeout(Duration::from_secs(2), async {
        harness.inbound.lock().await.recv().await
    })
    .await
    .expect("inbound timeout")
    .expect("inbound closed");
    let command: ClientCommand = serde_json::from_str(&raw).expect("decode command");
    assert!(matches!(
        command,
        ClientCommand::JoinRoom { room_id } if room_id == RoomId::new("r1")
    ));
}

#[tokio::test]
async fn sending_while_disconnected_fails() {
    let (server_url, _harness) = spawn_sync_server().await.expect("spawn server");
    let channel = SyncChannel::new(websocket_url(&server_url).expect("url"));

    let err = channel
        .send(ClientCommand::LeaveRoom {
            room_id: RoomId::new("r1"),
        })
        .await
        .expect_err("must fail");
    assert!(err.to_string().contains("not connected"));
}

#[tokio::test]
async fn connection_lifecycle_events_are_synthesized() {
    let (server_url, _harness) = spawn_sync_server().await.expect("spawn server");
    let channel = SyncChannel::new(websocket_url(&server_url).expect("url"));

    let mut subscription =
        channel.subscribe(&[EventKind::ConnectionUp, EventKind::ConnectionDown]);
    channel.connect("tok").await.expect("connect");
    assert!(matches!(
        recv_with_timeout(&mut subscription).await,
        PushEvent::ConnectionUp
    ));

    channel.disconnect().await;
    assert!(matches!(
        recv_with_timeout(&mut subscription).await,
        PushEvent::ConnectionDown
    ));
    assert!(!channel.is_connected().await);
}

#[tokio::test]
async fn pump_applies_pushed_messages_to_the_cache() {
    let (server_url, harness) = spawn_sync_server().await.expect("spawn server");
    let api = MockChatApi::new();
    api.rooms.lock().await.push(room("r1", Some(test_key())));

    let channel = SyncChannel::new(websocket_url(&server_url).expect("url"));
    let slot = Arc::new(MemorySlot::default());
    let client = ChatClient::with_collaborators(api, channel, slot, 50);

    client.cache.load_rooms().await.expect("load rooms");
    client.channel.connect("tok").await.expect("connect");

    let wire = CryptoEngine::new()
        .encrypt("hello", &test_key())
        .await
        .expect("encrypt");
    let received = PushEvent::MessageReceived {
        message: message("m1", "r1", &wire),
    };
    harness.frames.send(encode(&received)).expect("send frame");

    let room_id = RoomId::new("r1");
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if !client.cache.messages(&room_id).await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("message apply timeout");

    let messages = client.cache.messages(&room_id).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "hello");

    // Redeliver the identical event, then wait for a later marker event to
    // prove the duplicate was processed and ignored.
    harness.frames.send(encode(&received)).expect("send frame");
    let marker = PushEvent::TypingChanged {
        room_id: RoomId::new("r1"),
        user_id: UserId::new("bob"),
        is_typing: true,
    };
    harness.frames.send(encode(&marker)).expect("send frame");
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if !client.cache.typing_users(&room_id).await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("marker apply timeout");

    assert_eq!(client.cache.messages(&room_id).await.len(), 1);
}
