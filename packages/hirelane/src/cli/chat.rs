//! Line-oriented chat: stdin lines become messages, live events are printed
//! as they arrive.
//!
//! Lines starting with `/` are commands: `/older` loads the previous page of
//! history, `/quit` leaves.

use anyhow::{Context, Result, bail};
use hirelane_realtime::{
    ChatMessage, ChatSession, ChatUpdate, MessageHistoryGateway, RealtimeConnection,
    RealtimeEvent, SendError,
};
use hirelane_session::SessionEvent;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{require_session, session_failure};
use crate::config::HirelaneConfig;

pub async fn chat_command(
    config: &HirelaneConfig,
    conversation_id: &str,
    with_user: Option<&str>,
) -> Result<()> {
    let (client, credential) = require_session(config)?;
    let Some(me) = credential.subject().map(str::to_string) else {
        bail!("The stored session token does not carry a user id. Run `hirelane login` again.");
    };
    let mut session_events = client.subscribe();

    let connection =
        RealtimeConnection::new(config.file.realtime_config(), client.tokens().clone());
    let history = MessageHistoryGateway::new(client.clone(), config.file.chat.page_size);
    let mut chat = ChatSession::new(connection, history, &me, config.file.chat_config());

    chat.connect()
        .await
        .with_context(|| format!("Failed to connect to {}", config.file.realtime.url))?;

    if let Err(e) = chat.refresh_conversations().await {
        if e.is_session_expired() {
            chat.close().await;
            return Err(session_failure(&client, e, "load conversations"));
        }
        warn!(error = %e, "could not load the conversation list");
    }

    chat.open(conversation_id, with_user);
    eprintln!(
        "[hirelane: opening {}, /older for earlier messages, /quit to leave]",
        conversation_id
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let outcome = loop {
        tokio::select! {
            update = chat.next_update() => {
                match update {
                    Some(update) => render_update(&chat, &update),
                    None => break Ok(()),
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_input(&mut chat, &line) {
                            break Ok(());
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(anyhow::Error::new(e).context("Failed to read from stdin")),
                }
            }
            event = session_events.recv() => {
                match event {
                    Ok(SessionEvent::Expired { redirect_to }) => {
                        break Err(anyhow::anyhow!(
                            "Session expired ({}). Run `hirelane login` to sign in again.",
                            redirect_to
                        ));
                    }
                    Ok(SessionEvent::LoggedOut) => break Ok(()),
                    Ok(other) => debug!(?other, "session event"),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "session events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                }
            }
            _ = tokio::signal::ctrl_c() => break Ok(()),
        }
    };

    chat.close().await;
    eprintln!("[hirelane: left {}]", conversation_id);
    outcome
}

/// Returns false when the user asked to leave.
fn handle_input(chat: &mut ChatSession, line: &str) -> bool {
    match line.trim() {
        "/quit" | "/q" => return false,
        "/older" => {
            if !chat.load_older() {
                eprintln!("[hirelane: no earlier messages]");
            }
            return true;
        }
        "" => return true,
        _ => {}
    }

    chat.keystroke();
    match chat.send(line) {
        Ok(()) => {}
        Err(SendError::NotConnected) => eprintln!("[hirelane: not connected, message not sent]"),
        Err(e) => eprintln!("[hirelane: {}]", e),
    }
    true
}

fn render_update(chat: &ChatSession, update: &ChatUpdate) {
    let state = chat.state();
    let me = state.local_user_id();
    let open = state.open_conversation_id();

    match update {
        ChatUpdate::HistoryLoaded { older: false, .. } => {
            for message in state.messages() {
                println!("{}", format_message(message, me));
            }
            if state.messages().is_empty() {
                eprintln!("[hirelane: no messages yet]");
            }
        }
        ChatUpdate::HistoryLoaded { older: true, .. } => {
            eprintln!("[hirelane: earlier messages]");
            for message in state.messages() {
                println!("{}", format_message(message, me));
            }
        }
        ChatUpdate::HistoryFailed { error, .. } => {
            eprintln!("[hirelane: could not load history: {}]", error);
        }
        ChatUpdate::TypingExpired => {}
        ChatUpdate::Event(event) => match event {
            RealtimeEvent::MessageReceived(m) | RealtimeEvent::MessageSent(m) => {
                if Some(m.conversation_id.as_str()) == open {
                    println!("{}", format_message(m, me));
                } else {
                    let unread = state
                        .summary(&m.conversation_id)
                        .map(|s| s.unread_count)
                        .unwrap_or_default();
                    eprintln!(
                        "[hirelane: new message in {} ({} unread)]",
                        m.conversation_id, unread
                    );
                }
            }
            RealtimeEvent::TypingChanged {
                conversation_id,
                user_id,
                is_typing,
            } if Some(conversation_id.as_str()) == open && user_id != me => {
                if *is_typing {
                    eprintln!("[hirelane: {} is typing…]", user_id);
                }
            }
            RealtimeEvent::TypingChanged { .. } => {}
            RealtimeEvent::MessagesRead { conversation_id }
                if Some(conversation_id.as_str()) == open =>
            {
                eprintln!("[hirelane: seen]");
            }
            RealtimeEvent::MessagesRead { .. } => {}
            RealtimeEvent::PresenceChanged { user_id, is_online } => {
                if state.remote_user_id() == Some(user_id.as_str()) {
                    let status = if *is_online { "online" } else { "offline" };
                    eprintln!("[hirelane: {} is {}]", user_id, status);
                }
            }
            RealtimeEvent::ConnectionError { message } => {
                eprintln!("[hirelane: connection: {}]", message);
            }
        },
    }
}

fn format_message(message: &ChatMessage, me: &str) -> String {
    let who = if message.sender_id == me {
        "you"
    } else {
        message.sender_id.as_str()
    };
    let local = message.created_at.with_timezone(&chrono::Local);
    format!("[{}] {}: {}", local.format("%H:%M"), who, message.content)
}
