pub mod account;
pub mod chat;
pub mod conversations;
pub mod status;

use anyhow::{Context, Result, bail};
use hirelane_session::{Credential, SessionClient, SessionError};

use crate::config::HirelaneConfig;

pub use account::{login_command, logout_command, register_command};
pub use chat::chat_command;
pub use conversations::conversations_command;
pub use status::status_command;

/// Print the effective configuration as TOML.
pub fn config_command(config: &HirelaneConfig) -> Result<()> {
    let rendered =
        toml::to_string_pretty(&config.file).context("Failed to render configuration")?;
    println!("# data dir: {}", config.data_dir.display());
    println!("# file:     {}", config.config_toml_path().display());
    println!();
    print!("{}", rendered);
    Ok(())
}

/// A session client holding a credential that can still be used or renewed.
pub(crate) fn require_session(config: &HirelaneConfig) -> Result<(SessionClient, Credential)> {
    let client = config.session_client()?;
    let Some(credential) = client.tokens().get() else {
        bail!("Not logged in. Run `hirelane login --email <address>` first.");
    };
    Ok((client, credential))
}

/// Turn a terminal session failure into the "sign in again" message.
pub(crate) fn session_failure(
    client: &SessionClient,
    err: SessionError,
    action: &str,
) -> anyhow::Error {
    if err.is_session_expired() {
        anyhow::anyhow!(
            "Session expired ({}). Run `hirelane login` to sign in again.",
            client.login_redirect()
        )
    } else {
        anyhow::Error::new(err).context(format!("Failed to {}", action))
    }
}

/// Prompt for a password on the terminal unless one was passed on the command line.
pub(crate) fn password_or_prompt(password: Option<String>, prompt: &str) -> Result<String> {
    match password {
        Some(pw) => Ok(pw),
        None => rpassword::prompt_password(prompt)
            .map_err(|e| anyhow::anyhow!("Failed to read password: {}", e)),
    }
}

/// First 8 characters of an id, for table columns.
pub(crate) fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Compact rendering of a signed duration: `2h 5m`, `45s`, `-3m 10s`.
pub(crate) fn format_remaining(remaining: chrono::Duration) -> String {
    let total = remaining.num_seconds();
    let sign = if total < 0 { "-" } else { "" };
    let secs = total.unsigned_abs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{sign}{h}h {m}m")
    } else if m > 0 {
        format!("{sign}{m}m {s}s")
    } else {
        format!("{sign}{s}s")
    }
}
