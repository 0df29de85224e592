use anyhow::{Context, Result};
use hirelane_session::{AuthResponse, LoginRequest, RegisterRequest};
use tracing::info;

use super::password_or_prompt;
use crate::config::HirelaneConfig;

pub async fn login_command(
    config: &HirelaneConfig,
    email: String,
    password: Option<String>,
) -> Result<()> {
    let client = config.session_client()?;
    let password = password_or_prompt(password, "  Password: ")?;

    let response = client
        .login(&LoginRequest { email, password })
        .await
        .context("Login failed")?;

    print_signed_in(&response);
    Ok(())
}

pub async fn register_command(
    config: &HirelaneConfig,
    name: String,
    email: String,
    password: Option<String>,
    role: Option<String>,
) -> Result<()> {
    let client = config.session_client()?;
    let password = match password {
        Some(pw) => pw,
        None => loop {
            let pw = password_or_prompt(None, "  Password: ")?;
            let confirm = password_or_prompt(None, "  Confirm password: ")?;
            if confirm == pw {
                break pw;
            }
            eprintln!("  (passwords don't match, try again)");
        },
    };

    let response = client
        .register(&RegisterRequest {
            name,
            email,
            password,
            role,
        })
        .await
        .context("Registration failed")?;

    print_signed_in(&response);
    Ok(())
}

pub async fn logout_command(config: &HirelaneConfig) -> Result<()> {
    let client = config.session_client()?;
    if client.tokens().get().is_none() {
        println!("Not logged in.");
        return Ok(());
    }
    client.logout().await;
    println!("Logged out.");
    Ok(())
}

fn print_signed_in(response: &AuthResponse) {
    let who = ["name", "email", "id"]
        .iter()
        .find_map(|key| response.user.get(*key).and_then(|v| v.as_str()))
        .unwrap_or("unknown user");
    info!(user = %who, "session started");
    println!("Signed in as {}.", who);
}
