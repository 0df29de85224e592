//! Chat records shared by the realtime channel and the history endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Set once the recipient has seen the message.
    #[serde(default)]
    pub read: bool,
}

/// The two users of a direct conversation. Order carries no meaning.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Participants([String; 2]);

impl Participants {
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        Self([a.into(), b.into()])
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.0.iter().any(|p| p == user_id)
    }

    /// The participant that is not `me`, if `me` is one of them.
    pub fn other(&self, me: &str) -> Option<&str> {
        match &self.0 {
            [a, b] if a == me => Some(b.as_str()),
            [a, b] if b == me => Some(a.as_str()),
            _ => None,
        }
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl PartialEq for Participants {
    fn eq(&self, other: &Self) -> bool {
        let [a, b] = &self.0;
        let [c, d] = &other.0;
        (a == c && b == d) || (a == d && b == c)
    }
}

impl TryFrom<Vec<String>> for Participants {
    type Error = String;

    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        let len = value.len();
        let pair: [String; 2] = value
            .try_into()
            .map_err(|_| format!("a conversation has exactly two participants, got {len}"))?;
        Ok(Self(pair))
    }
}

impl From<Participants> for Vec<String> {
    fn from(value: Participants) -> Self {
        value.0.into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub sender_id: String,
}

impl From<&ChatMessage> for LastMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            content: message.content.clone(),
            created_at: message.created_at,
            sender_id: message.sender_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub participants: Participants,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub unread_count: u32,
    pub updated_at: DateTime<Utc>,
}

/// One page of a conversation's history, oldest message first. Page 1 holds
/// the most recent messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<ChatMessage>,
    #[serde(default = "first_page")]
    pub page: u32,
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub has_more: bool,
}

fn first_page() -> u32 {
    1
}

impl MessagePage {
    pub fn single(messages: Vec<ChatMessage>) -> Self {
        let limit = messages.len() as u32;
        Self {
            messages,
            page: 1,
            limit,
            has_more: false,
        }
    }
}
