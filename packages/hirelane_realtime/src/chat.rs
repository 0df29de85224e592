//! Drives one user's chat: realtime events, history fetches, typing timers
//! and read receipts, all funnelled through a single reconciler.

use std::time::Duration;

use hirelane_session::SessionError;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::{RealtimeConnection, Subscription};
use crate::error::{RealtimeError, SendError};
use crate::history::MessageHistoryGateway;
use crate::models::MessagePage;
use crate::protocol::RealtimeEvent;
use crate::reconciler::{
    ConversationReconciler, DEFAULT_TYPING_TIMEOUT, HistoryOutcome, HistoryTicket, ReadReceipt,
};
use crate::typing::{DEFAULT_TYPING_IDLE, TypingNotifier, TypingSignal};

#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// How long the local user may pause before we withdraw `typing`.
    pub typing_idle: Duration,
    /// How long a remote `typing` lasts without a refresh.
    pub typing_timeout: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            typing_idle: DEFAULT_TYPING_IDLE,
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
        }
    }
}

/// Something the view should redraw for.
#[derive(Debug)]
pub enum ChatUpdate {
    Event(RealtimeEvent),
    HistoryLoaded {
        conversation_id: String,
        older: bool,
    },
    HistoryFailed {
        conversation_id: String,
        error: SessionError,
    },
    TypingExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadKind {
    Latest,
    Older,
}

struct HistoryLoad {
    ticket: HistoryTicket,
    kind: LoadKind,
    result: Result<MessagePage, SessionError>,
}

pub struct ChatSession {
    connection: RealtimeConnection,
    history: MessageHistoryGateway,
    state: ConversationReconciler,
    typing: TypingNotifier,
    events: mpsc::UnboundedReceiver<RealtimeEvent>,
    subscription: Subscription,
    loads_tx: mpsc::UnboundedSender<HistoryLoad>,
    loads: mpsc::UnboundedReceiver<HistoryLoad>,
}

impl ChatSession {
    pub fn new(
        connection: RealtimeConnection,
        history: MessageHistoryGateway,
        local_user_id: impl Into<String>,
        config: ChatConfig,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let subscription = connection.subscribe_all(move |event| {
            let _ = events_tx.send(event.clone());
        });
        let (loads_tx, loads) = mpsc::unbounded_channel();
        Self {
            connection,
            history,
            state: ConversationReconciler::new(local_user_id)
                .with_typing_timeout(config.typing_timeout),
            typing: TypingNotifier::new(config.typing_idle),
            events,
            subscription,
            loads_tx,
            loads,
        }
    }

    pub fn state(&self) -> &ConversationReconciler {
        &self.state
    }

    pub fn connection(&self) -> &RealtimeConnection {
        &self.connection
    }

    pub async fn connect(&self) -> Result<(), RealtimeError> {
        self.connection.connect().await
    }

    pub async fn refresh_conversations(&mut self) -> Result<(), SessionError> {
        let summaries = self.history.conversations().await?;
        self.state.replace_summaries(summaries);
        Ok(())
    }

    /// Switch to a conversation and start fetching its latest page.
    pub fn open(&mut self, conversation_id: &str, remote_user_id: Option<&str>) {
        let withdrawn = self.typing.clear();
        self.emit_typing(withdrawn);
        let ticket = self.state.open_conversation(conversation_id, remote_user_id);
        self.spawn_load(ticket, LoadKind::Latest, 1);
    }

    /// Start fetching the next older page. False if there is nothing more
    /// to load or a fetch is already running.
    pub fn load_older(&mut self) -> bool {
        match self.state.begin_load_older() {
            Some(request) => {
                self.spawn_load(request.ticket, LoadKind::Older, request.page);
                true
            }
            None => false,
        }
    }

    /// Record a keystroke in the compose box.
    pub fn keystroke(&mut self) {
        let (Some(conversation_id), Some(remote)) =
            (self.state.open_conversation_id(), self.state.remote_user_id())
        else {
            return;
        };
        let switched = self.typing.retarget(conversation_id, remote);
        let started = self.typing.keystroke();
        self.emit_typing(switched);
        self.emit_typing(started);
    }

    /// Send a message to the open conversation. It shows up in the list
    /// once the server echoes it back.
    pub fn send(&mut self, content: &str) -> Result<(), SendError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SendError::Empty);
        }
        let conversation_id = self
            .state
            .open_conversation_id()
            .ok_or(SendError::NoConversation)?
            .to_string();
        let remote = self
            .state
            .remote_user_id()
            .ok_or(SendError::UnknownRecipient)?
            .to_string();

        let stopped = self.typing.stop();
        self.emit_typing(stopped);
        if self
            .connection
            .send_message(&conversation_id, &remote, content)
        {
            Ok(())
        } else {
            Err(SendError::NotConnected)
        }
    }

    /// Wait for the next change worth rendering. Returns `None` once the
    /// connection has been torn down.
    pub async fn next_update(&mut self) -> Option<ChatUpdate> {
        loop {
            let idle_at = self.typing.deadline();
            let expiry_at = self.state.next_typing_deadline();

            tokio::select! {
                event = self.events.recv() => {
                    let event = event?;
                    if let Some(receipt) = self.state.apply(&event) {
                        self.acknowledge(&receipt);
                    }
                    return Some(ChatUpdate::Event(event));
                }
                Some(load) = self.loads.recv() => {
                    if let Some(update) = self.finish_load(load) {
                        return Some(update);
                    }
                }
                _ = sleep_until(idle_at) => {
                    let stopped = self.typing.poll_idle();
                    self.emit_typing(stopped);
                }
                _ = sleep_until(expiry_at) => {
                    if self.state.expire_typing() {
                        return Some(ChatUpdate::TypingExpired);
                    }
                }
            }
        }
    }

    /// Withdraw typing, drop our subscription and close the channel.
    pub async fn close(mut self) {
        let stopped = self.typing.clear();
        self.emit_typing(stopped);
        self.subscription.unsubscribe();
        self.connection.teardown().await;
    }

    fn finish_load(&mut self, load: HistoryLoad) -> Option<ChatUpdate> {
        let HistoryLoad {
            ticket,
            kind,
            result,
        } = load;
        let conversation_id = ticket.conversation_id().to_string();

        let page = match result {
            Ok(page) => page,
            Err(error) => {
                if !self.state.is_current(&ticket) {
                    debug!(%conversation_id, "ignoring failure of stale history fetch");
                    return None;
                }
                if kind == LoadKind::Older {
                    self.state.abandon_load_older(&ticket);
                }
                warn!(%conversation_id, error = %error, "history fetch failed");
                return Some(ChatUpdate::HistoryFailed {
                    conversation_id,
                    error,
                });
            }
        };

        let outcome = match kind {
            LoadKind::Latest => self.state.complete_open(&ticket, page),
            LoadKind::Older => self.state.complete_load_older(&ticket, page),
        };
        match outcome {
            HistoryOutcome::Stale => None,
            HistoryOutcome::Applied { receipt } => {
                if let Some(receipt) = receipt {
                    self.acknowledge(&receipt);
                }
                Some(ChatUpdate::HistoryLoaded {
                    conversation_id,
                    older: kind == LoadKind::Older,
                })
            }
        }
    }

    fn spawn_load(&self, ticket: HistoryTicket, kind: LoadKind, page: u32) {
        let history = self.history.clone();
        let tx = self.loads_tx.clone();
        tokio::spawn(async move {
            let result = history.messages(ticket.conversation_id(), page).await;
            let _ = tx.send(HistoryLoad {
                ticket,
                kind,
                result,
            });
        });
    }

    fn acknowledge(&self, receipt: &ReadReceipt) {
        self.connection
            .mark_read(&receipt.conversation_id, &receipt.sender_id);
    }

    fn emit_typing(&self, signal: Option<TypingSignal>) {
        if let Some(signal) = signal {
            self.connection.send_typing(
                &signal.conversation_id,
                &signal.recipient_id,
                signal.is_typing,
            );
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
