//! Outbound typing signals for the local user.
//!
//! The first keystroke in a conversation signals `typing = true`. The signal
//! is withdrawn after an idle period without keystrokes, or immediately when
//! the user sends, switches conversation or leaves. The notifier only
//! decides what to send; the caller owns the timer and the socket.

use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_TYPING_IDLE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingSignal {
    pub conversation_id: String,
    pub recipient_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone)]
struct Target {
    conversation_id: String,
    recipient_id: String,
}

#[derive(Debug)]
pub struct TypingNotifier {
    idle: Duration,
    target: Option<Target>,
    /// Set while we have told the peer we are typing.
    deadline: Option<Instant>,
}

impl TypingNotifier {
    pub fn new(idle: Duration) -> Self {
        Self {
            idle,
            target: None,
            deadline: None,
        }
    }

    /// Point the notifier at a conversation. Any signal still raised for the
    /// previous conversation is withdrawn.
    pub fn retarget(&mut self, conversation_id: &str, recipient_id: &str) -> Option<TypingSignal> {
        let same = self.target.as_ref().is_some_and(|t| {
            t.conversation_id == conversation_id && t.recipient_id == recipient_id
        });
        if same {
            return None;
        }
        let stopped = self.stop();
        self.target = Some(Target {
            conversation_id: conversation_id.to_string(),
            recipient_id: recipient_id.to_string(),
        });
        stopped
    }

    /// Withdraw any signal and forget the conversation.
    pub fn clear(&mut self) -> Option<TypingSignal> {
        let stopped = self.stop();
        self.target = None;
        stopped
    }

    /// Record a keystroke. Returns a signal only on the first keystroke of a
    /// burst; later keystrokes just push the idle deadline back.
    pub fn keystroke(&mut self) -> Option<TypingSignal> {
        let target = self.target.as_ref()?;
        let was_typing = self.deadline.is_some();
        self.deadline = Some(Instant::now() + self.idle);
        (!was_typing).then(|| signal(target, true))
    }

    /// Withdraw the signal, e.g. because the message was sent.
    pub fn stop(&mut self) -> Option<TypingSignal> {
        self.deadline.take()?;
        self.target.as_ref().map(|t| signal(t, false))
    }

    /// When the current burst goes idle, if one is in progress.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Call when the deadline has been reached.
    pub fn poll_idle(&mut self) -> Option<TypingSignal> {
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => self.stop(),
            _ => None,
        }
    }

    pub fn is_typing(&self) -> bool {
        self.deadline.is_some()
    }
}

impl Default for TypingNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_IDLE)
    }
}

fn signal(target: &Target, is_typing: bool) -> TypingSignal {
    TypingSignal {
        conversation_id: target.conversation_id.clone(),
        recipient_id: target.recipient_id.clone(),
        is_typing,
    }
}
