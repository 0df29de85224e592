//! Wire frames for the realtime channel.
//!
//! Every frame is a JSON text message `{"event": <name>, "data": <payload>}`.
//! The first frame a client sends on a fresh socket is `auth`, carrying the
//! bearer credential; the server closes the socket if it rejects it.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::ChatMessage;

/// Frames the client sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientFrame {
    Auth {
        token: String,
    },
    PrivateMessage {
        conversation_id: String,
        recipient_id: String,
        content: String,
    },
    Typing {
        conversation_id: String,
        recipient_id: String,
        is_typing: bool,
    },
    MarkRead {
        conversation_id: String,
        sender_id: String,
    },
}

impl ClientFrame {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::PrivateMessage { .. } => "private_message",
            Self::Typing { .. } => "typing",
            Self::MarkRead { .. } => "mark_read",
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Frames the server pushes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerFrame {
    PrivateMessage(ChatMessage),
    MessageSent(ChatMessage),
    Typing {
        conversation_id: String,
        user_id: String,
        is_typing: bool,
    },
    MessagesRead {
        conversation_id: String,
    },
    UserStatus {
        user_id: String,
        is_online: bool,
    },
    Error {
        message: String,
    },
}

const SERVER_EVENTS: &[&str] = &[
    "private_message",
    "message_sent",
    "typing",
    "messages_read",
    "user_status",
    "error",
];

#[derive(Deserialize)]
struct Envelope {
    event: String,
}

impl ServerFrame {
    /// Decode one text frame. Events this client does not understand yield
    /// `Ok(None)` so newer servers can add events without breaking us.
    pub fn decode(text: &str) -> Result<Option<Self>, serde_json::Error> {
        let envelope: Envelope = serde_json::from_str(text)?;
        if !SERVER_EVENTS.contains(&envelope.event.as_str()) {
            debug!(event = %envelope.event, "ignoring unknown realtime event");
            return Ok(None);
        }
        serde_json::from_str(text).map(Some)
    }
}

/// Event kinds handlers can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageReceived,
    MessageSent,
    TypingChanged,
    MessagesRead,
    PresenceChanged,
    ConnectionError,
}

/// What subscribers see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    /// A message from another user.
    MessageReceived(ChatMessage),
    /// The server's acknowledgement of a message we sent. Carries the
    /// server-assigned id and timestamp.
    MessageSent(ChatMessage),
    TypingChanged {
        conversation_id: String,
        user_id: String,
        is_typing: bool,
    },
    /// The other party has read our messages in this conversation.
    MessagesRead { conversation_id: String },
    PresenceChanged { user_id: String, is_online: bool },
    ConnectionError { message: String },
}

impl RealtimeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::MessageReceived(_) => EventKind::MessageReceived,
            Self::MessageSent(_) => EventKind::MessageSent,
            Self::TypingChanged { .. } => EventKind::TypingChanged,
            Self::MessagesRead { .. } => EventKind::MessagesRead,
            Self::PresenceChanged { .. } => EventKind::PresenceChanged,
            Self::ConnectionError { .. } => EventKind::ConnectionError,
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::MessageReceived(m) | Self::MessageSent(m) => Some(&m.conversation_id),
            Self::TypingChanged {
                conversation_id, ..
            }
            | Self::MessagesRead { conversation_id } => Some(conversation_id),
            Self::PresenceChanged { .. } | Self::ConnectionError { .. } => None,
        }
    }
}

impl From<ServerFrame> for RealtimeEvent {
    fn from(frame: ServerFrame) -> Self {
        match frame {
            ServerFrame::PrivateMessage(m) => Self::MessageReceived(m),
            ServerFrame::MessageSent(m) => Self::MessageSent(m),
            ServerFrame::Typing {
                conversation_id,
                user_id,
                is_typing,
            } => Self::TypingChanged {
                conversation_id,
                user_id,
                is_typing,
            },
            ServerFrame::MessagesRead { conversation_id } => Self::MessagesRead { conversation_id },
            ServerFrame::UserStatus { user_id, is_online } => {
                Self::PresenceChanged { user_id, is_online }
            }
            ServerFrame::Error { message } => Self::ConnectionError { message },
        }
    }
}
