use tokio_tungstenite::tungstenite;

#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    /// No valid or expiring-soon credential was available to authenticate.
    #[error("no usable credential for the realtime channel")]
    MissingCredential,

    #[error("realtime server is unavailable")]
    Unavailable,

    #[error("realtime transport error: {0}")]
    Transport(String),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("connection has been torn down")]
    TornDown,
}

/// Why a chat message was not handed to the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("no conversation is open")]
    NoConversation,

    #[error("the other participant of this conversation is unknown")]
    UnknownRecipient,

    #[error("message is empty")]
    Empty,

    #[error("realtime channel is not connected")]
    NotConnected,
}

impl RealtimeError {
    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        let refused = match &err {
            tungstenite::Error::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        };
        if refused {
            Self::Unavailable
        } else {
            Self::Transport(err.to_string())
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MissingCredential => "missing_credential",
            Self::Unavailable => "unavailable",
            Self::Transport(_) => "transport",
            Self::Encode(_) => "encode",
            Self::TornDown => "torn_down",
        }
    }
}
