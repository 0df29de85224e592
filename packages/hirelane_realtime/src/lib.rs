//! Realtime messaging for Hirelane: the authenticated socket, conversation
//! state reconciliation, typing signals and REST message history.

pub mod chat;
pub mod connection;
pub mod error;
pub mod history;
pub mod models;
pub mod protocol;
pub mod reconciler;
pub mod typing;

pub use chat::{ChatConfig, ChatSession, ChatUpdate};
pub use connection::{
    ConnectionState, RealtimeConfig, RealtimeConnection, ReconnectPolicy, Subscription,
};
pub use error::{RealtimeError, SendError};
pub use history::MessageHistoryGateway;
pub use models::{ChatMessage, ConversationSummary, LastMessage, MessagePage, Participants};
pub use protocol::{ClientFrame, EventKind, RealtimeEvent, ServerFrame};
pub use reconciler::{ConversationReconciler, HistoryOutcome, HistoryTicket, ReadReceipt};
pub use typing::{TypingNotifier, TypingSignal};
