//! The single realtime channel of an authenticated session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use hirelane_session::{Credential, TokenStore};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::RealtimeError;
use crate::protocol::{ClientFrame, EventKind, RealtimeEvent, ServerFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub type EventHandler = Arc<dyn Fn(&RealtimeEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

/// Bounded retry after the transport drops. Attempt `n` waits
/// `min(initial_delay * n, max_delay)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.initial_delay
            .saturating_mul(attempt.max(1))
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub url: String,
    pub reconnect: ReconnectPolicy,
}

impl RealtimeConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Handle to the realtime channel. Cheap to clone; all clones share one
/// socket, one subscriber table and one state.
#[derive(Clone)]
pub struct RealtimeConnection {
    inner: Arc<Inner>,
}

struct Inner {
    config: RealtimeConfig,
    tokens: TokenStore,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    subscribers: Mutex<Subscribers>,
    worker: tokio::sync::Mutex<Option<Worker>>,
    torn_down: AtomicBool,
}

struct Worker {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    handlers: Vec<(u64, Option<EventKind>, EventHandler)>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RealtimeConnection {
    pub fn new(config: RealtimeConfig, tokens: TokenStore) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                tokens,
                state,
                outbound: Mutex::new(None),
                subscribers: Mutex::new(Subscribers::default()),
                worker: tokio::sync::Mutex::new(None),
                torn_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Open the channel and authenticate with the stored credential.
    ///
    /// A no-op while the channel is already up or coming up, so repeated
    /// calls never open a second socket.
    pub async fn connect(&self) -> Result<(), RealtimeError> {
        if self.inner.torn_down.load(Ordering::Acquire) {
            return Err(RealtimeError::TornDown);
        }
        let mut worker = self.inner.worker.lock().await;
        let current = self.state();
        if current != ConnectionState::Disconnected {
            debug!(state = current.as_str(), "connect ignored, channel already active");
            return Ok(());
        }

        let Some(credential) = usable_credential(&self.inner.tokens) else {
            info!("no usable credential, staying disconnected");
            return Err(RealtimeError::MissingCredential);
        };

        self.inner.set_state(ConnectionState::Connecting);
        let stream = match open_socket(&self.inner.config.url, &credential).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(url = %self.inner.config.url, error = %e, "realtime connect failed");
                self.inner.set_state(ConnectionState::Disconnected);
                self.inner.dispatch(&RealtimeEvent::ConnectionError {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        let outbound = self.inner.open_outbound();
        self.inner.set_state(ConnectionState::Connected);
        info!(url = %self.inner.config.url, "realtime channel connected");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run_channel(
            self.inner.clone(),
            stream,
            outbound,
            shutdown_rx,
        ));
        *worker = Some(Worker {
            shutdown: shutdown_tx,
            handle,
        });
        Ok(())
    }

    /// Close the socket and stop reconnecting. Subscribers stay registered.
    pub async fn disconnect(&self) {
        let worker = self.inner.worker.lock().await.take();
        if let Some(worker) = worker {
            info!("closing realtime channel");
            let _ = worker.shutdown.send(());
            if let Err(e) = worker.handle.await {
                warn!(error = %e, "realtime worker ended abnormally");
            }
        }
        self.inner.close_outbound();
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Disconnect and drop every subscriber. The handle cannot be
    /// reconnected afterwards.
    pub async fn teardown(&self) {
        self.inner.torn_down.store(true, Ordering::Release);
        self.disconnect().await;
        lock(&self.inner.subscribers).handlers.clear();
        debug!("realtime channel torn down");
    }

    pub fn send_message(&self, conversation_id: &str, recipient_id: &str, content: &str) -> bool {
        self.emit(ClientFrame::PrivateMessage {
            conversation_id: conversation_id.to_string(),
            recipient_id: recipient_id.to_string(),
            content: content.to_string(),
        })
    }

    pub fn send_typing(&self, conversation_id: &str, recipient_id: &str, is_typing: bool) -> bool {
        self.emit(ClientFrame::Typing {
            conversation_id: conversation_id.to_string(),
            recipient_id: recipient_id.to_string(),
            is_typing,
        })
    }

    pub fn mark_read(&self, conversation_id: &str, sender_id: &str) -> bool {
        self.emit(ClientFrame::MarkRead {
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
        })
    }

    /// Hand a frame to the socket. Returns false, and drops the frame, when
    /// the channel is not connected.
    fn emit(&self, frame: ClientFrame) -> bool {
        let outbound = lock(&self.inner.outbound);
        match outbound.as_ref() {
            Some(tx) if self.is_connected() => tx.send(frame).is_ok(),
            _ => {
                debug!(event = frame.name(), "channel not connected, dropping event");
                false
            }
        }
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler))
    }

    /// Receive every event kind.
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    fn register(&self, kind: Option<EventKind>, handler: EventHandler) -> Subscription {
        if self.inner.torn_down.load(Ordering::Acquire) {
            return Subscription {
                id: 0,
                inner: Weak::new(),
                active: AtomicBool::new(false),
            };
        }
        let mut subscribers = lock(&self.inner.subscribers);
        subscribers.next_id += 1;
        let id = subscribers.next_id;
        subscribers.handlers.push((id, kind, handler));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
            active: AtomicBool::new(true),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).handlers.len()
    }

    #[cfg(test)]
    fn inject(&self, event: &RealtimeEvent) {
        self.inner.dispatch(event);
    }
}

/// Registration returned by `subscribe`. Dropping it does not unsubscribe.
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
    active: AtomicBool,
}

impl Subscription {
    /// Remove the handler. Safe to call repeatedly and after teardown.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            lock(&inner.subscribers)
                .handlers
                .retain(|(id, _, _)| *id != self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn open_outbound(&self) -> mpsc::UnboundedReceiver<ClientFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.outbound) = Some(tx);
        rx
    }

    fn close_outbound(&self) {
        lock(&self.outbound).take();
    }

    fn dispatch(&self, event: &RealtimeEvent) {
        let kind = event.kind();
        // Handlers run outside the lock so they may subscribe or unsubscribe.
        let handlers: Vec<EventHandler> = lock(&self.subscribers)
            .handlers
            .iter()
            .filter(|(_, filter, _)| filter.is_none_or(|k| k == kind))
            .map(|(_, _, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    fn handle_text(&self, text: &str) {
        match ServerFrame::decode(text) {
            Ok(Some(frame)) => {
                let event = RealtimeEvent::from(frame);
                if let RealtimeEvent::ConnectionError { message } = &event {
                    warn!(%message, "realtime server reported an error");
                }
                self.dispatch(&event);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "dropping malformed realtime frame"),
        }
    }
}

fn usable_credential(tokens: &TokenStore) -> Option<Credential> {
    tokens.state().usable().cloned()
}

async fn open_socket(url: &str, credential: &Credential) -> Result<WsStream, RealtimeError> {
    let (mut stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(RealtimeError::from_tungstenite)?;
    let auth = ClientFrame::Auth {
        token: credential.as_str().to_string(),
    }
    .encode()?;
    stream
        .send(Message::Text(auth.into()))
        .await
        .map_err(RealtimeError::from_tungstenite)?;
    Ok(stream)
}

enum Exit {
    Shutdown,
    Dropped(String),
}

async fn run_channel(
    inner: Arc<Inner>,
    mut stream: WsStream,
    mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        match pump(&inner, &mut stream, &mut outbound, &mut shutdown).await {
            Exit::Shutdown => {
                let _ = stream.close(None).await;
                break;
            }
            Exit::Dropped(message) => {
                warn!(%message, "realtime channel dropped");
                inner.close_outbound();
                inner.dispatch(&RealtimeEvent::ConnectionError { message });
                match reconnect(&inner, &mut shutdown).await {
                    Some((next_stream, next_outbound)) => {
                        stream = next_stream;
                        outbound = next_outbound;
                    }
                    None => break,
                }
            }
        }
    }
    inner.close_outbound();
    inner.set_state(ConnectionState::Disconnected);
}

async fn pump(
    inner: &Inner,
    stream: &mut WsStream,
    outbound: &mut mpsc::UnboundedReceiver<ClientFrame>,
    shutdown: &mut oneshot::Receiver<()>,
) -> Exit {
    loop {
        tokio::select! {
            _ = &mut *shutdown => return Exit::Shutdown,

            Some(frame) = outbound.recv() => {
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(event = frame.name(), error = %e, "failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = stream.send(Message::Text(text.into())).await {
                    return Exit::Dropped(e.to_string());
                }
            }

            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => inner.handle_text(text.as_str()),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.as_str().to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "closed by server".to_string());
                    return Exit::Dropped(reason);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Exit::Dropped(e.to_string()),
                None => return Exit::Dropped("connection lost".to_string()),
            },
        }
    }
}

async fn reconnect(
    inner: &Inner,
    shutdown: &mut oneshot::Receiver<()>,
) -> Option<(WsStream, mpsc::UnboundedReceiver<ClientFrame>)> {
    let policy = &inner.config.reconnect;
    if policy.max_attempts == 0 {
        return None;
    }
    inner.set_state(ConnectionState::Reconnecting);

    for attempt in 1..=policy.max_attempts {
        let delay = policy.delay_for(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting to reconnect");
        tokio::select! {
            _ = &mut *shutdown => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        // The session may have ended while we were away.
        let Some(credential) = usable_credential(&inner.tokens) else {
            info!("credential no longer usable, giving up on reconnect");
            return None;
        };

        let result = tokio::select! {
            _ = &mut *shutdown => return None,
            result = open_socket(&inner.config.url, &credential) => result,
        };
        match result {
            Ok(stream) => {
                let outbound = inner.open_outbound();
                inner.set_state(ConnectionState::Connected);
                info!(attempt, "realtime channel reconnected");
                return Some((stream, outbound));
            }
            Err(e) => {
                warn!(attempt, error = %e, "reconnect attempt failed");
            }
        }
    }

    warn!(
        attempts = policy.max_attempts,
        "giving up on realtime channel"
    );
    inner.dispatch(&RealtimeEvent::ConnectionError {
        message: "reconnect attempts exhausted".to_string(),
    });
    None
}
