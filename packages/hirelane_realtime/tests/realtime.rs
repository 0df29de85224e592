//! Realtime channel and chat flow tests against an in-process hub.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use data_encoding::BASE64URL_NOPAD;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{Mutex, broadcast, mpsc};
use uuid::Uuid;

use hirelane_realtime::{
    ChatConfig, ChatSession, ConnectionState, EventKind, MessageHistoryGateway, RealtimeConfig,
    RealtimeConnection, RealtimeEvent, ReconnectPolicy, SendError,
};
use hirelane_session::{Credential, SessionClient, TokenStore};

fn mint_token(user: &str) -> String {
    let header = BASE64URL_NOPAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = json!({
        "id": user,
        "exp": (Utc::now() + chrono::Duration::hours(1)).timestamp(),
    });
    let payload = BASE64URL_NOPAD.encode(claims.to_string().as_bytes());
    format!("{header}.{payload}.sig")
}

// ── mock hub ────────────────────────────────────────────────────────────

#[derive(Clone)]
struct Hub {
    accepted: Arc<Mutex<HashSet<String>>>,
    peers: Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>>,
    handshakes: Arc<Mutex<Vec<Value>>>,
    inbox: Arc<Mutex<Vec<(String, Value)>>>,
    history: Arc<Mutex<HashMap<String, Vec<Value>>>>,
    conversations: Arc<Mutex<Vec<Value>>>,
    slow: Arc<Mutex<HashSet<String>>>,
    connections: Arc<AtomicUsize>,
    kick: broadcast::Sender<()>,
}

impl Hub {
    fn new() -> Self {
        Self {
            accepted: Default::default(),
            peers: Default::default(),
            handshakes: Default::default(),
            inbox: Default::default(),
            history: Default::default(),
            conversations: Default::default(),
            slow: Default::default(),
            connections: Default::default(),
            kick: broadcast::channel(4).0,
        }
    }

    async fn issue(&self, user: &str) -> TokenStore {
        let token = mint_token(user);
        self.accepted.lock().await.insert(token.clone());
        let tokens = TokenStore::in_memory();
        tokens.set(Credential::new(token));
        tokens
    }

    async fn authenticate(&self, text: &str) -> Option<String> {
        let frame: Value = serde_json::from_str(text).ok()?;
        self.handshakes.lock().await.push(frame.clone());
        if frame["event"] != "auth" {
            return None;
        }
        let token = frame["data"]["token"].as_str()?;
        if !self.accepted.lock().await.contains(token) {
            return None;
        }
        Credential::new(token).subject().map(str::to_string)
    }

    async fn deliver(&self, user: &str, frame: Value) {
        if let Some(senders) = self.peers.lock().await.get(user) {
            for tx in senders {
                let _ = tx.send(frame.to_string());
            }
        }
    }

    async fn broadcast_except(&self, user: &str, frame: Value) {
        for (peer, senders) in self.peers.lock().await.iter() {
            if peer != user {
                for tx in senders {
                    let _ = tx.send(frame.to_string());
                }
            }
        }
    }

    async fn handle(&self, user: &str, text: &str) {
        let Ok(frame) = serde_json::from_str::<Value>(text) else {
            return;
        };
        self.inbox.lock().await.push((user.to_string(), frame.clone()));
        let data = &frame["data"];
        match frame["event"].as_str() {
            Some("private_message") => {
                let id = Uuid::new_v4().to_string();
                let conversation = data["conversationId"].as_str().unwrap_or_default();
                let recipient = data["recipientId"].as_str().unwrap_or_default();
                let message = json!({
                    "id": id,
                    "conversationId": conversation,
                    "senderId": user,
                    "recipientId": recipient,
                    "content": data["content"],
                    "createdAt": Utc::now().to_rfc3339(),
                    "read": false,
                });
                self.history
                    .lock()
                    .await
                    .entry(conversation.to_string())
                    .or_default()
                    .push(message.clone());
                self.deliver(user, json!({"event": "message_sent", "data": message}))
                    .await;
                self.deliver(recipient, json!({"event": "private_message", "data": message}))
                    .await;
            }
            Some("typing") => {
                let recipient = data["recipientId"].as_str().unwrap_or_default();
                let relayed = json!({
                    "event": "typing",
                    "data": {
                        "conversationId": data["conversationId"],
                        "userId": user,
                        "isTyping": data["isTyping"],
                    }
                });
                self.deliver(recipient, relayed).await;
            }
            Some("mark_read") => {
                let sender = data["senderId"].as_str().unwrap_or_default();
                let read = json!({
                    "event": "messages_read",
                    "data": {"conversationId": data["conversationId"]}
                });
                self.deliver(sender, read).await;
            }
            _ => {}
        }
    }

    async fn frames_from(&self, user: &str, event: &str) -> Vec<Value> {
        self.inbox
            .lock()
            .await
            .iter()
            .filter(|(u, f)| u == user && f["event"] == event)
            .map(|(_, f)| f["data"].clone())
            .collect()
    }
}

async fn socket(State(hub): State<Hub>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_socket(hub, socket))
}

async fn serve_socket(hub: Hub, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    let user = match stream.next().await {
        Some(Ok(Message::Text(text))) => hub.authenticate(text.as_str()).await,
        _ => None,
    };
    let Some(user) = user else {
        let rejection = json!({"event": "error", "data": {"message": "invalid token"}});
        let _ = sink.send(Message::Text(rejection.to_string().into())).await;
        let _ = sink.send(Message::Close(None)).await;
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    hub.peers
        .lock()
        .await
        .entry(user.clone())
        .or_default()
        .push(tx);
    hub.broadcast_except(
        &user,
        json!({"event": "user_status", "data": {"userId": user, "isOnline": true}}),
    )
    .await;

    let mut kick = hub.kick.subscribe();
    hub.connections.fetch_add(1, Ordering::SeqCst);
    loop {
        tokio::select! {
            Some(out) = rx.recv() => {
                if sink.send(Message::Text(out.into())).await.is_err() {
                    break;
                }
            }
            _ = kick.recv() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => hub.handle(&user, text.as_str()).await,
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    drop(rx);
    if let Some(senders) = hub.peers.lock().await.get_mut(&user) {
        senders.retain(|tx| !tx.is_closed());
    }
}

async fn conversations(State(hub): State<Hub>) -> Json<Value> {
    Json(Value::Array(hub.conversations.lock().await.clone()))
}

async fn messages(
    State(hub): State<Hub>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let authorized = match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(value) => match value.strip_prefix("Bearer ") {
            Some(token) => hub.accepted.lock().await.contains(token),
            None => false,
        },
        None => false,
    };
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if hub.slow.lock().await.contains(&id) {
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    let list = hub.history.lock().await.get(&id).cloned().unwrap_or_default();
    Json(json!({"messages": list, "page": 1, "limit": 50, "hasMore": false})).into_response()
}

struct Endpoints {
    api: String,
    ws: String,
}

async fn spawn_hub(hub: Hub) -> Endpoints {
    let api = Router::new()
        .route("/messages/conversations", get(conversations))
        .route("/messages/conversations/{id}/messages", get(messages))
        .with_state(hub.clone());
    let app = Router::new()
        .nest("/api", api)
        .route("/socket", get(socket))
        .with_state(hub);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Endpoints {
        api: format!("http://{addr}/api"),
        ws: format!("ws://{addr}/socket"),
    }
}

// ── helpers ─────────────────────────────────────────────────────────────

fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(100),
    }
}

fn connection(endpoints: &Endpoints, tokens: &TokenStore) -> RealtimeConnection {
    RealtimeConnection::new(
        RealtimeConfig::new(&endpoints.ws).with_reconnect(fast_reconnect()),
        tokens.clone(),
    )
}

fn collect(conn: &RealtimeConnection) -> mpsc::UnboundedReceiver<RealtimeEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    let _subscription = conn.subscribe_all(move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

async fn next_of_kind(rx: &mut mpsc::UnboundedReceiver<RealtimeEvent>, kind: EventKind) -> RealtimeEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            if event.kind() == kind {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_for_state(conn: &RealtimeConnection, want: ConnectionState) {
    let mut rx = conn.watch_state();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never held");
}

fn chat(endpoints: &Endpoints, tokens: &TokenStore, user: &str, config: ChatConfig) -> ChatSession {
    let client = SessionClient::builder(&endpoints.api)
        .token_store(tokens.clone())
        .build()
        .unwrap();
    ChatSession::new(
        connection(endpoints, tokens),
        MessageHistoryGateway::new(client, 50),
        user,
        config,
    )
}

async fn pump_until(session: &mut ChatSession, done: impl Fn(&ChatSession) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done(session) {
            session.next_update().await.expect("chat session closed");
        }
    })
    .await
    .expect("timed out pumping chat updates");
}

async fn drive_for(session: &mut ChatSession, period: Duration) {
    let _ = tokio::time::timeout(period, async {
        while session.next_update().await.is_some() {}
    })
    .await;
}

async fn wait_for_peers(hub: &Hub, count: usize) {
    let connections = hub.connections.clone();
    eventually(|| {
        let connections = connections.clone();
        async move { connections.load(Ordering::SeqCst) == count }
    })
    .await;
}

// ── connection ──────────────────────────────────────────────────────────

#[tokio::test]
async fn first_frame_authenticates() {
    let hub = Hub::new();
    let endpoints = spawn_hub(hub.clone()).await;
    let tokens = hub.issue("alice").await;
    let conn = connection(&endpoints, &tokens);

    conn.connect().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);

    wait_for_peers(&hub, 1).await;
    let handshake = hub.handshakes.lock().await[0].clone();
    assert_eq!(handshake["event"], "auth");
    assert_eq!(handshake["data"]["token"], tokens.get().unwrap().as_str());
}

#[tokio::test]
async fn repeated_connect_opens_one_socket() {
    let hub = Hub::new();
    let endpoints = spawn_hub(hub.clone()).await;
    let tokens = hub.issue("alice").await;
    let conn = connection(&endpoints, &tokens);

    let (a, b) = tokio::join!(conn.connect(), conn.connect());
    a.unwrap();
    b.unwrap();
    conn.connect().await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hub.connections.load(Ordering::SeqCst), 1);
    assert_eq!(hub.handshakes.lock().await.len(), 1);
}

#[tokio::test]
async fn rejected_credential_surfaces_connection_error() {
    let hub = Hub::new();
    let endpoints = spawn_hub(hub.clone()).await;
    let tokens = TokenStore::in_memory();
    tokens.set(Credential::new(mint_token("mallory")));
    let conn = RealtimeConnection::new(
        RealtimeConfig::new(&endpoints.ws).with_reconnect(ReconnectPolicy::disabled()),
        tokens,
    );
    let mut events = collect(&conn);

    conn.connect().await.unwrap();
    match next_of_kind(&mut events, EventKind::ConnectionError).await {
        RealtimeEvent::ConnectionError { message } => assert_eq!(message, "invalid token"),
        other => panic!("unexpected event: {other:?}"),
    }
    wait_for_state(&conn, ConnectionState::Disconnected).await;
    assert_eq!(hub.connections.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn emits_reach_the_server_and_echo_back() {
    let hub = Hub::new();
    let endpoints = spawn_hub(hub.clone()).await;
    let alice = connection(&endpoints, &hub.issue("alice").await);
    let bob = connection(&endpoints, &hub.issue("bob").await);
    let mut alice_events = collect(&alice);
    let mut bob_events = collect(&bob);
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    wait_for_peers(&hub, 2).await;

    assert!(alice.send_message("c1", "bob", "hello bob"));

    let sent = next_of_kind(&mut alice_events, EventKind::MessageSent).await;
    let received = next_of_kind(&mut bob_events, EventKind::MessageReceived).await;
    match (sent, received) {
        (RealtimeEvent::MessageSent(echo), RealtimeEvent::MessageReceived(msg)) => {
            assert_eq!(echo.id, msg.id);
            assert_eq!(msg.sender_id, "alice");
            assert_eq!(msg.content, "hello bob");
        }
        other => panic!("unexpected events: {other:?}"),
    }

    let frames = hub.frames_from("alice", "private_message").await;
    assert_eq!(
        frames,
        vec![json!({"conversationId": "c1", "recipientId": "bob", "content": "hello bob"})]
    );
}

#[tokio::test]
async fn presence_changes_are_delivered() {
    let hub = Hub::new();
    let endpoints = spawn_hub(hub.clone()).await;
    let alice = connection(&endpoints, &hub.issue("alice").await);
    let mut alice_events = collect(&alice);
    alice.connect().await.unwrap();
    wait_for_peers(&hub, 1).await;

    let bob = connection(&endpoints, &hub.issue("bob").await);
    bob.connect().await.unwrap();

    assert_eq!(
        next_of_kind(&mut alice_events, EventKind::PresenceChanged).await,
        RealtimeEvent::PresenceChanged {
            user_id: "bob".into(),
            is_online: true
        }
    );
}

#[tokio::test]
async fn reconnects_after_the_server_drops_us() {
    let hub = Hub::new();
    let endpoints = spawn_hub(hub.clone()).await;
    let tokens = hub.issue("alice").await;
    let conn = connection(&endpoints, &tokens);
    let mut events = collect(&conn);
    conn.connect().await.unwrap();
    wait_for_peers(&hub, 1).await;

    let _ = hub.kick.send(());

    match next_of_kind(&mut events, EventKind::ConnectionError).await {
        RealtimeEvent::ConnectionError { message } => assert_eq!(message, "closed by server"),
        other => panic!("unexpected event: {other:?}"),
    }
    wait_for_peers(&hub, 2).await;

    // The fresh socket carries emits again.
    assert!(conn.mark_read("c1", "bob"));
    let hub2 = hub.clone();
    eventually(|| {
        let hub = hub2.clone();
        async move { hub.frames_from("alice", "mark_read").await.len() == 1 }
    })
    .await;
}

#[tokio::test]
async fn reconnect_stops_once_the_credential_is_gone() {
    let hub = Hub::new();
    let endpoints = spawn_hub(hub.clone()).await;
    let tokens = hub.issue("alice").await;
    let conn = connection(&endpoints, &tokens);
    conn.connect().await.unwrap();
    wait_for_peers(&hub, 1).await;

    tokens.clear();
    let _ = hub.kick.send(());

    wait_for_state(&conn, ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(hub.connections.load(Ordering::SeqCst), 1);
    assert!(!conn.send_typing("c1", "bob", true));
}

#[tokio::test]
async fn teardown_stops_delivery_to_handlers() {
    let hub = Hub::new();
    let endpoints = spawn_hub(hub.clone()).await;
    let alice = connection(&endpoints, &hub.issue("alice").await);
    let bob = connection(&endpoints, &hub.issue("bob").await);
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let subscription = alice.subscribe(EventKind::MessageReceived, move |_| {
        h.fetch_add(1, Ordering::SeqCst);
    });
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();

    alice.teardown().await;
    subscription.unsubscribe();
    assert_eq!(alice.state(), ConnectionState::Disconnected);

    bob.send_message("c1", "alice", "anyone there?");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

// ── chat sessions ───────────────────────────────────────────────────────

#[tokio::test]
async fn open_conversation_receipt_reaches_the_sender() {
    let hub = Hub::new();
    let endpoints = spawn_hub(hub.clone()).await;
    let alice_tokens = hub.issue("alice").await;
    let bob_tokens = hub.issue("bob").await;
    let mut alice = chat(&endpoints, &alice_tokens, "alice", ChatConfig::default());
    let mut bob = chat(&endpoints, &bob_tokens, "bob", ChatConfig::default());
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    wait_for_peers(&hub, 2).await;

    bob.open("c1", Some("alice"));
    pump_until(&mut bob, |s| s.state().is_history_loaded()).await;
    alice.open("c1", Some("bob"));
    pump_until(&mut alice, |s| s.state().is_history_loaded()).await;

    alice.send("are you free for an interview?").unwrap();
    pump_until(&mut alice, |s| s.state().messages().len() == 1).await;
    assert!(!alice.state().messages()[0].read);

    // Bob is looking at the conversation, so arrival triggers mark_read.
    pump_until(&mut bob, |s| s.state().messages().len() == 1).await;
    assert_eq!(bob.state().messages()[0].sender_id, "alice");
    assert_eq!(bob.state().summary("c1").map(|s| s.unread_count), Some(0));

    pump_until(&mut alice, |s| s.state().messages()[0].read).await;
    let receipts = hub.frames_from("bob", "mark_read").await;
    assert!(receipts.contains(&json!({"conversationId": "c1", "senderId": "alice"})));
}

#[tokio::test]
async fn message_for_background_conversation_counts_unread() {
    let hub = Hub::new();
    let endpoints = spawn_hub(hub.clone()).await;
    let mut bob = chat(&endpoints, &hub.issue("bob").await, "bob", ChatConfig::default());
    let carol = connection(&endpoints, &hub.issue("carol").await);
    bob.connect().await.unwrap();
    carol.connect().await.unwrap();

    bob.open("c1", Some("alice"));
    pump_until(&mut bob, |s| s.state().is_history_loaded()).await;

    wait_for_peers(&hub, 2).await;
    carol.send_message("c2", "bob", "saw your application");
    pump_until(&mut bob, |s| s.state().total_unread() == 1).await;

    assert!(bob.state().messages().is_empty());
    assert_eq!(bob.state().summaries()[0].id, "c2");
    assert!(hub.frames_from("bob", "mark_read").await.iter().all(|f| f["conversationId"] == "c1"));
}

#[tokio::test]
async fn typing_is_signalled_and_withdrawn_when_idle() {
    let hub = Hub::new();
    let endpoints = spawn_hub(hub.clone()).await;
    let quick = ChatConfig {
        typing_idle: Duration::from_millis(150),
        typing_timeout: Duration::from_secs(3),
    };
    let mut alice = chat(&endpoints, &hub.issue("alice").await, "alice", quick.clone());
    let mut bob = chat(&endpoints, &hub.issue("bob").await, "bob", quick);
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    wait_for_peers(&hub, 2).await;
    alice.open("c1", Some("bob"));
    bob.open("c1", Some("alice"));

    alice.keystroke();
    alice.keystroke();
    pump_until(&mut bob, |s| s.state().is_typing("c1", "alice")).await;

    // Alice's idle timer only runs while her session is pumped.
    drive_for(&mut alice, Duration::from_millis(400)).await;
    pump_until(&mut bob, |s| !s.state().is_typing("c1", "alice")).await;

    let typing = hub.frames_from("alice", "typing").await;
    let flags: Vec<bool> = typing.iter().map(|f| f["isTyping"].as_bool().unwrap()).collect();
    assert_eq!(flags, vec![true, false]);
}

#[tokio::test]
async fn switching_conversations_discards_late_history() {
    let hub = Hub::new();
    let endpoints = spawn_hub(hub.clone()).await;
    hub.slow.lock().await.insert("c-slow".to_string());
    hub.history.lock().await.insert(
        "c-slow".to_string(),
        vec![json!({
            "id": "old-1", "conversationId": "c-slow", "senderId": "carol",
            "content": "late", "createdAt": "2026-01-01T00:00:00Z"
        })],
    );
    hub.history.lock().await.insert(
        "c2".to_string(),
        vec![json!({
            "id": "new-1", "conversationId": "c2", "senderId": "dave",
            "content": "current", "createdAt": "2026-01-02T00:00:00Z"
        })],
    );
    let mut bob = chat(&endpoints, &hub.issue("bob").await, "bob", ChatConfig::default());

    bob.open("c-slow", Some("carol"));
    bob.open("c2", Some("dave"));
    pump_until(&mut bob, |s| s.state().is_history_loaded()).await;

    // Give the slow response time to land; it must not replace c2's list.
    drive_for(&mut bob, Duration::from_millis(500)).await;
    assert_eq!(bob.state().open_conversation_id(), Some("c2"));
    let ids: Vec<&str> = bob.state().messages().iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, ["new-1"]);
}

#[tokio::test]
async fn conversation_list_is_loaded_over_rest() {
    let hub = Hub::new();
    let endpoints = spawn_hub(hub.clone()).await;
    hub.conversations.lock().await.push(json!({
        "id": "c1",
        "participants": ["bob", "alice"],
        "lastMessage": {"content": "hi", "createdAt": "2026-01-01T00:00:00Z", "senderId": "alice"},
        "unreadCount": 2,
        "updatedAt": "2026-01-01T00:00:00Z"
    }));
    let mut bob = chat(&endpoints, &hub.issue("bob").await, "bob", ChatConfig::default());

    bob.refresh_conversations().await.unwrap();
    assert_eq!(bob.state().total_unread(), 2);

    bob.open("c1", None);
    assert_eq!(bob.state().remote_user_id(), Some("alice"));
    assert_eq!(bob.state().total_unread(), 0);
}

#[tokio::test]
async fn sending_requires_a_live_channel() {
    let hub = Hub::new();
    let endpoints = spawn_hub(hub.clone()).await;
    let mut bob = chat(&endpoints, &hub.issue("bob").await, "bob", ChatConfig::default());

    assert_eq!(bob.send("hi"), Err(SendError::NoConversation));
    bob.open("c1", Some("alice"));
    assert_eq!(bob.send("   "), Err(SendError::Empty));
    assert_eq!(bob.send("hi"), Err(SendError::NotConnected));
    bob.close().await;
}
