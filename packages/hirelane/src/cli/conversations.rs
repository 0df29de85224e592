use anyhow::Result;
use hirelane_realtime::{ConversationSummary, MessageHistoryGateway};

use super::{require_session, session_failure, short_id};
use crate::config::HirelaneConfig;

pub async fn conversations_command(config: &HirelaneConfig, json: bool) -> Result<()> {
    let (client, credential) = require_session(config)?;
    let me = credential.subject().unwrap_or_default().to_string();
    let history = MessageHistoryGateway::new(client.clone(), config.file.chat.page_size);

    let mut summaries = history
        .conversations()
        .await
        .map_err(|e| session_failure(&client, e, "load conversations"))?;
    summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else if summaries.is_empty() {
        println!("No conversations.");
    } else {
        // Table header
        println!(
            "{:<10} {:<20} {:>6}  {:<17} {}",
            "ID", "WITH", "UNREAD", "UPDATED", "LAST MESSAGE"
        );
        println!("{}", "-".repeat(100));
        for summary in &summaries {
            println!("{}", table_row(summary, &me));
        }
        let unread: u32 = summaries.iter().map(|s| s.unread_count).sum();
        println!(
            "\n{} conversation(s), {} unread message(s)",
            summaries.len(),
            unread
        );
    }

    Ok(())
}

fn table_row(summary: &ConversationSummary, me: &str) -> String {
    let with = summary.participants.other(me).unwrap_or("?");
    let last = summary
        .last_message
        .as_ref()
        .map(|m| preview(&m.content, 40))
        .unwrap_or_default();
    format!(
        "{:<10} {:<20} {:>6}  {:<17} {}",
        short_id(&summary.id),
        with,
        summary.unread_count,
        summary.updated_at.format("%Y-%m-%d %H:%M"),
        last
    )
}

/// Single-line preview, cut at `max` characters.
fn preview(content: &str, max: usize) -> String {
    let line = content.lines().next().unwrap_or_default();
    if line.chars().count() > max || content.contains('\n') {
        let cut: String = line.chars().take(max).collect();
        format!("{}…", cut.trim_end())
    } else {
        line.to_string()
    }
}
