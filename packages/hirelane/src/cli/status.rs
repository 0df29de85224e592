use anyhow::Result;
use chrono::Utc;
use hirelane_session::{CredentialState, TokenStore};
use serde_json::json;

use super::format_remaining;
use crate::config::HirelaneConfig;

/// Report the stored credential without touching the network.
pub fn status_command(config: &HirelaneConfig, json: bool) -> Result<()> {
    let tokens = config.token_store();
    let report = StatusReport::collect(&tokens);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "state": report.state,
                "user_id": report.user_id,
                "expires_at": report.expires_at,
                "remaining_secs": report.remaining_secs,
                "api": config.file.api.base_url,
            }))?
        );
        return Ok(());
    }

    println!("Session:  {}", report.state);
    if let Some(user) = &report.user_id {
        println!("User:     {}", user);
    }
    match (&report.expires_at, report.remaining_secs) {
        (Some(at), Some(secs)) => println!(
            "Expires:  {} ({})",
            at,
            format_remaining(chrono::Duration::seconds(secs))
        ),
        _ if report.state != CredentialState::Absent.label() => {
            println!("Expires:  unreadable (treated as expired)")
        }
        _ => {}
    }
    println!("API:      {}", config.file.api.base_url);
    Ok(())
}

struct StatusReport {
    state: &'static str,
    user_id: Option<String>,
    expires_at: Option<String>,
    remaining_secs: Option<i64>,
}

impl StatusReport {
    fn collect(tokens: &TokenStore) -> Self {
        let now = Utc::now();
        let state = tokens.state_at(now);
        let credential = tokens.get();
        let expires_at = credential.as_ref().and_then(|c| c.expires_at());
        Self {
            state: state.label(),
            user_id: credential
                .as_ref()
                .and_then(|c| c.subject())
                .map(str::to_string),
            expires_at: expires_at.map(|at| at.to_rfc3339()),
            remaining_secs: credential
                .as_ref()
                .filter(|_| expires_at.is_some())
                .map(|c| c.remaining_at(now).num_seconds()),
        }
    }
}
