//! Conversation state for one signed-in user.
//!
//! The reconciler owns the conversation list and the open conversation's
//! message list and folds history fetches and realtime events into them.
//! It performs no I/O: callers fetch pages and forward events, and send the
//! read receipts it hands back.
//!
//! Messages are kept in arrival order. A message is only ever shown once,
//! keyed by id, and local sends only appear when the server echoes them back
//! as `message_sent`.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::models::{ChatMessage, ConversationSummary, LastMessage, MessagePage, Participants};
use crate::protocol::RealtimeEvent;

pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(3);

/// A `mark_read` the caller should send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReceipt {
    pub conversation_id: String,
    /// Author of the messages being acknowledged.
    pub sender_id: String,
}

/// Identifies one history request. Results for a ticket that no longer
/// matches the open conversation are discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTicket {
    conversation_id: String,
    generation: u64,
}

impl HistoryTicket {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OlderPageRequest {
    pub ticket: HistoryTicket,
    pub page: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryOutcome {
    Applied { receipt: Option<ReadReceipt> },
    Stale,
}

#[derive(Debug)]
struct OpenConversation {
    id: String,
    remote_user_id: Option<String>,
    messages: Vec<ChatMessage>,
    seen: HashSet<String>,
    generation: u64,
    loaded: bool,
    pages_loaded: u32,
    has_more: bool,
    loading_older: bool,
}

impl OpenConversation {
    fn matches(&self, ticket: &HistoryTicket) -> bool {
        self.id == ticket.conversation_id && self.generation == ticket.generation
    }
}

#[derive(Debug)]
pub struct ConversationReconciler {
    local_user_id: String,
    summaries: Vec<ConversationSummary>,
    /// Last message id folded into each summary.
    last_counted: HashMap<String, String>,
    open: Option<OpenConversation>,
    typing: HashMap<(String, String), Instant>,
    presence: HashMap<String, bool>,
    generation: u64,
    typing_timeout: Duration,
}

impl ConversationReconciler {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            summaries: Vec::new(),
            last_counted: HashMap::new(),
            open: None,
            typing: HashMap::new(),
            presence: HashMap::new(),
            generation: 0,
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
        }
    }

    pub fn with_typing_timeout(mut self, timeout: Duration) -> Self {
        self.typing_timeout = timeout;
        self
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    // ── conversation list ───────────────────────────────────────────────

    pub fn summaries(&self) -> &[ConversationSummary] {
        &self.summaries
    }

    pub fn summary(&self, conversation_id: &str) -> Option<&ConversationSummary> {
        self.summaries.iter().find(|s| s.id == conversation_id)
    }

    pub fn total_unread(&self) -> u32 {
        self.summaries.iter().map(|s| s.unread_count).sum()
    }

    /// Install a freshly fetched conversation list.
    pub fn replace_summaries(&mut self, summaries: Vec<ConversationSummary>) {
        self.summaries = summaries;
        if let Some(open) = &self.open {
            if let Some(summary) = self.summaries.iter_mut().find(|s| s.id == open.id) {
                summary.unread_count = 0;
            }
        }
    }

    // ── open conversation ───────────────────────────────────────────────

    /// Switch to `conversation_id`. The message list starts empty until the
    /// history fetch for the returned ticket completes.
    pub fn open_conversation(
        &mut self,
        conversation_id: &str,
        remote_user_id: Option<&str>,
    ) -> HistoryTicket {
        self.generation += 1;
        let remote = remote_user_id.map(str::to_string).or_else(|| {
            self.summary(conversation_id)
                .and_then(|s| s.participants.other(&self.local_user_id))
                .map(str::to_string)
        });
        if let Some(summary) = self.summaries.iter_mut().find(|s| s.id == conversation_id) {
            summary.unread_count = 0;
        }
        debug!(conversation_id, generation = self.generation, "opening conversation");
        self.open = Some(OpenConversation {
            id: conversation_id.to_string(),
            remote_user_id: remote,
            messages: Vec::new(),
            seen: HashSet::new(),
            generation: self.generation,
            loaded: false,
            pages_loaded: 0,
            has_more: false,
            loading_older: false,
        });
        HistoryTicket {
            conversation_id: conversation_id.to_string(),
            generation: self.generation,
        }
    }

    pub fn close_conversation(&mut self) {
        self.generation += 1;
        self.open = None;
    }

    /// Apply the first history page for an open request. Messages that
    /// arrived live while the fetch was in flight are kept after the page.
    pub fn complete_open(&mut self, ticket: &HistoryTicket, page: MessagePage) -> HistoryOutcome {
        let local = self.local_user_id.clone();
        let Some(open) = self.open.as_mut().filter(|o| o.matches(ticket)) else {
            debug!(conversation_id = %ticket.conversation_id, "discarding stale history");
            return HistoryOutcome::Stale;
        };

        let live = std::mem::take(&mut open.messages);
        open.seen.clear();
        for mut message in page.messages.into_iter().chain(live) {
            if !open.seen.insert(message.id.clone()) {
                continue;
            }
            if message.sender_id != local {
                message.read = true;
            }
            open.messages.push(message);
        }
        open.loaded = true;
        open.pages_loaded = page.page.max(1);
        open.has_more = page.has_more;

        if open.remote_user_id.is_none() {
            open.remote_user_id = open
                .messages
                .iter()
                .find(|m| m.sender_id != local)
                .map(|m| m.sender_id.clone());
        }
        let receipt = open.remote_user_id.as_ref().map(|remote| ReadReceipt {
            conversation_id: open.id.clone(),
            sender_id: remote.clone(),
        });
        HistoryOutcome::Applied { receipt }
    }

    /// Reserve the next older page, if there is one and no other older-page
    /// fetch is outstanding.
    pub fn begin_load_older(&mut self) -> Option<OlderPageRequest> {
        let open = self.open.as_mut()?;
        if !open.loaded || !open.has_more || open.loading_older {
            return None;
        }
        open.loading_older = true;
        Some(OlderPageRequest {
            ticket: HistoryTicket {
                conversation_id: open.id.clone(),
                generation: open.generation,
            },
            page: open.pages_loaded + 1,
        })
    }

    /// Prepend an older page, skipping messages already shown.
    pub fn complete_load_older(
        &mut self,
        ticket: &HistoryTicket,
        page: MessagePage,
    ) -> HistoryOutcome {
        let local = self.local_user_id.clone();
        let Some(open) = self.open.as_mut().filter(|o| o.matches(ticket)) else {
            return HistoryOutcome::Stale;
        };
        open.loading_older = false;
        open.pages_loaded = open.pages_loaded.max(page.page);
        open.has_more = page.has_more;

        let mut older = Vec::with_capacity(page.messages.len());
        for mut message in page.messages {
            if open.seen.insert(message.id.clone()) {
                if message.sender_id != local {
                    message.read = true;
                }
                older.push(message);
            }
        }
        older.append(&mut open.messages);
        open.messages = older;
        HistoryOutcome::Applied { receipt: None }
    }

    /// Release the older-page reservation after a failed fetch.
    pub fn abandon_load_older(&mut self, ticket: &HistoryTicket) {
        if let Some(open) = self.open.as_mut().filter(|o| o.matches(ticket)) {
            open.loading_older = false;
        }
    }

    /// Whether results for `ticket` would still be applied.
    pub fn is_current(&self, ticket: &HistoryTicket) -> bool {
        self.open.as_ref().is_some_and(|o| o.matches(ticket))
    }

    pub fn open_conversation_id(&self) -> Option<&str> {
        self.open.as_ref().map(|o| o.id.as_str())
    }

    pub fn remote_user_id(&self) -> Option<&str> {
        self.open.as_ref()?.remote_user_id.as_deref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        self.open.as_ref().map_or(&[], |o| o.messages.as_slice())
    }

    pub fn is_history_loaded(&self) -> bool {
        self.open.as_ref().is_some_and(|o| o.loaded)
    }

    pub fn has_more_history(&self) -> bool {
        self.open.as_ref().is_some_and(|o| o.has_more)
    }

    // ── realtime events ─────────────────────────────────────────────────

    /// Fold one realtime event into the state. Returns a receipt when the
    /// event is a message the user is looking at right now.
    pub fn apply(&mut self, event: &RealtimeEvent) -> Option<ReadReceipt> {
        match event {
            RealtimeEvent::MessageReceived(message) | RealtimeEvent::MessageSent(message) => {
                self.apply_message(message)
            }
            RealtimeEvent::MessagesRead { conversation_id } => {
                self.apply_read(conversation_id);
                None
            }
            RealtimeEvent::TypingChanged {
                conversation_id,
                user_id,
                is_typing,
            } => {
                self.apply_typing(conversation_id, user_id, *is_typing);
                None
            }
            RealtimeEvent::PresenceChanged { user_id, is_online } => {
                self.presence.insert(user_id.clone(), *is_online);
                None
            }
            RealtimeEvent::ConnectionError { .. } => None,
        }
    }

    fn apply_message(&mut self, message: &ChatMessage) -> Option<ReadReceipt> {
        let inbound = message.sender_id != self.local_user_id;
        let viewing = match self.open.as_mut() {
            Some(open) if open.id == message.conversation_id => {
                if !open.seen.insert(message.id.clone()) {
                    debug!(message_id = %message.id, "duplicate message ignored");
                    return None;
                }
                let mut shown = message.clone();
                if inbound {
                    shown.read = true;
                    open.remote_user_id
                        .get_or_insert_with(|| message.sender_id.clone());
                }
                open.messages.push(shown);
                true
            }
            _ => {
                if self.last_counted.get(&message.conversation_id) == Some(&message.id) {
                    debug!(message_id = %message.id, "duplicate message ignored");
                    return None;
                }
                false
            }
        };

        self.touch_summary(message, inbound && !viewing);

        (inbound && viewing).then(|| ReadReceipt {
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
        })
    }

    /// Move the message's conversation to the top of the list with the new
    /// preview, creating the entry if the conversation is new to us.
    fn touch_summary(&mut self, message: &ChatMessage, count_unread: bool) {
        self.last_counted
            .insert(message.conversation_id.clone(), message.id.clone());

        let mut summary = match self
            .summaries
            .iter()
            .position(|s| s.id == message.conversation_id)
        {
            Some(index) => self.summaries.remove(index),
            None => {
                let other = if message.sender_id == self.local_user_id {
                    message.recipient_id.clone()
                } else {
                    Some(message.sender_id.clone())
                };
                let Some(other) = other else {
                    debug!(conversation_id = %message.conversation_id, "no counterpart for new conversation");
                    return;
                };
                ConversationSummary {
                    id: message.conversation_id.clone(),
                    participants: Participants::new(self.local_user_id.clone(), other),
                    last_message: None,
                    unread_count: 0,
                    updated_at: message.created_at,
                }
            }
        };
        summary.last_message = Some(LastMessage::from(message));
        summary.updated_at = message.created_at;
        if count_unread {
            summary.unread_count += 1;
        }
        self.summaries.insert(0, summary);
    }

    fn apply_read(&mut self, conversation_id: &str) {
        let Some(open) = self.open.as_mut().filter(|o| o.id == conversation_id) else {
            return;
        };
        for message in open
            .messages
            .iter_mut()
            .filter(|m| m.sender_id == self.local_user_id)
        {
            message.read = true;
        }
    }

    // ── typing and presence ─────────────────────────────────────────────

    fn apply_typing(&mut self, conversation_id: &str, user_id: &str, is_typing: bool) {
        if user_id == self.local_user_id {
            return;
        }
        let key = (conversation_id.to_string(), user_id.to_string());
        if is_typing {
            self.typing
                .insert(key, Instant::now() + self.typing_timeout);
        } else {
            self.typing.remove(&key);
        }
    }

    pub fn is_typing(&self, conversation_id: &str, user_id: &str) -> bool {
        let now = Instant::now();
        self.typing
            .get(&(conversation_id.to_string(), user_id.to_string()))
            .is_some_and(|deadline| *deadline > now)
    }

    /// Users currently typing in `conversation_id`, sorted.
    pub fn typing_users(&self, conversation_id: &str) -> Vec<&str> {
        let now = Instant::now();
        let mut users: Vec<&str> = self
            .typing
            .iter()
            .filter(|((conv, _), deadline)| conv == conversation_id && **deadline > now)
            .map(|((_, user), _)| user.as_str())
            .collect();
        users.sort_unstable();
        users
    }

    /// Drop typing indicators whose timeout has passed. Returns true if any
    /// were removed.
    pub fn expire_typing(&mut self) -> bool {
        let now = Instant::now();
        let before = self.typing.len();
        self.typing.retain(|_, deadline| *deadline > now);
        self.typing.len() != before
    }

    pub fn next_typing_deadline(&self) -> Option<Instant> {
        self.typing.values().min().copied()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.presence.get(user_id).copied().unwrap_or(false)
    }
}
