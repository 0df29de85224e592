//! REST access to conversation lists and message history.

use hirelane_session::{ApiRequest, SessionClient, SessionError};
use serde::Deserialize;
use tracing::debug;

use crate::models::{ChatMessage, ConversationSummary, MessagePage};

pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Fetches history through the authenticated session client, so every call
/// gets the same refresh and retry handling as the rest of the app.
#[derive(Clone)]
pub struct MessageHistoryGateway {
    client: SessionClient,
    page_size: u32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConversationList {
    Bare(Vec<ConversationSummary>),
    Wrapped { conversations: Vec<ConversationSummary> },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryBody {
    Paged(MessagePage),
    Bare(Vec<ChatMessage>),
}

impl MessageHistoryGateway {
    pub fn new(client: SessionClient, page_size: u32) -> Self {
        Self {
            client,
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>, SessionError> {
        let list: ConversationList = self
            .client
            .send_json(&ApiRequest::get("/messages/conversations"))
            .await?;
        let summaries = match list {
            ConversationList::Bare(s) | ConversationList::Wrapped { conversations: s } => s,
        };
        debug!(count = summaries.len(), "fetched conversation list");
        Ok(summaries)
    }

    /// Fetch one page of a conversation. Page 1 is the most recent.
    pub async fn messages(
        &self,
        conversation_id: &str,
        page: u32,
    ) -> Result<MessagePage, SessionError> {
        let request = ApiRequest::get(format!(
            "/messages/conversations/{conversation_id}/messages"
        ))
        .query("page", page.max(1))
        .query("limit", self.page_size);
        let body: HistoryBody = self.client.send_json(&request).await?;
        let page = match body {
            HistoryBody::Paged(p) => p,
            HistoryBody::Bare(messages) => {
                let mut p = MessagePage::single(messages);
                p.page = page.max(1);
                p.limit = self.page_size;
                p
            }
        };
        debug!(
            conversation_id,
            page = page.page,
            count = page.messages.len(),
            has_more = page.has_more,
            "fetched message page"
        );
        Ok(page)
    }
}
