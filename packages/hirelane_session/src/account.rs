//! Login, registration and logout.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::client::{ApiRequest, SessionClient, SessionEvent};
use crate::credential::Credential;
use crate::error::SessionError;

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Body returned by login and registration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    #[serde(default)]
    pub user: serde_json::Value,
}

impl SessionClient {
    pub async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, SessionError> {
        let call = ApiRequest::post("/auth/login").with_body(request)?;
        let response: AuthResponse = self.send_json(&call).await?;
        self.start_session(&response);
        Ok(response)
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<AuthResponse, SessionError> {
        let call = ApiRequest::post("/auth/register").with_body(request)?;
        let response: AuthResponse = self.send_json(&call).await?;
        self.start_session(&response);
        Ok(response)
    }

    /// Tell the server the session is over and forget the credential. The
    /// local credential is cleared even if the server call fails.
    ///
    /// The server is only told when the credential is still usable, and the
    /// call is made once with no refresh, so logging out never ends in
    /// [`SessionEvent::Expired`].
    pub async fn logout(&self) {
        if let Some(credential) = self.tokens().state().usable().cloned() {
            let request = ApiRequest::post("/auth/logout");
            match self.dispatch(&request, Some(&credential)).await {
                Ok(response) if !response.status().is_success() => {
                    warn!(
                        status = %response.status(),
                        "server refused logout, clearing local session anyway"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "logout request failed, clearing local session anyway"),
            }
        } else {
            debug!("credential not usable, skipping server logout");
        }
        self.tokens().clear();
        info!("logged out");
        self.notify(SessionEvent::LoggedOut);
    }

    fn start_session(&self, response: &AuthResponse) {
        let credential = Credential::new(response.token.clone());
        info!(expires_at = ?credential.expires_at(), "session started");
        self.set_credential(credential);
        self.notify(SessionEvent::LoggedIn);
    }
}
