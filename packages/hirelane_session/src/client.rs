//! Authenticated HTTP client.
//!
//! Every call goes through the same pipeline:
//!
//! 1. read the stored credential and decide whether it can be attached as-is,
//!    must be refreshed first (expired), or should be refreshed in the
//!    background (expiring soon);
//! 2. send the request with `Authorization: Bearer` and the mirrored
//!    `X-XSRF-TOKEN` header;
//! 3. on a 401, refresh once and resend once. A second 401 or a failed
//!    refresh ends the session: the credential is cleared and
//!    [`SessionEvent::Expired`] carries the login redirect.
//!
//! Other failures (403/404/422/429/5xx/network) are logged with their
//! [`ErrorClass`] and handed back to the caller untouched.

use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Method, Response, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::credential::{Credential, CredentialState};
use crate::error::{ErrorClass, SessionError};
use crate::refresh::RefreshCoordinator;
use crate::token_store::TokenStore;

pub const XSRF_COOKIE: &str = "XSRF-TOKEN";
pub const XSRF_HEADER: &str = "X-XSRF-TOKEN";

const REFRESH_PATH: &str = "/auth/refresh-token";
const SESSION_EXPIRED_QUERY: &str = "session=expired";
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Session lifecycle notifications. `Expired` is the signal to navigate to
/// the login screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn,
    Refreshed,
    Expired { redirect_to: String },
    LoggedOut,
}

/// A replayable description of an API call. Kept separate from
/// `reqwest::Request` so the pipeline can resend it after a refresh.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_body<T: Serialize>(self, body: &T) -> Result<Self, SessionError> {
        let value =
            serde_json::to_value(body).map_err(|e| SessionError::InvalidRequest(e.to_string()))?;
        Ok(self.json(value))
    }

    /// Auth endpoints answer 401 for bad credentials; those never trigger
    /// a refresh-and-retry.
    fn is_auth_endpoint(&self) -> bool {
        self.path.starts_with("/auth/")
    }
}

pub struct SessionClientBuilder {
    base_url: String,
    login_path: String,
    tokens: Option<TokenStore>,
    timeout: Option<Duration>,
    cookies: Option<Arc<Jar>>,
}

impl SessionClientBuilder {
    pub fn login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = path.into();
        self
    }

    pub fn token_store(mut self, tokens: TokenStore) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cookie_jar(mut self, jar: Arc<Jar>) -> Self {
        self.cookies = Some(jar);
        self
    }

    pub fn build(self) -> Result<SessionClient, SessionError> {
        let base_url = self.base_url.trim_end_matches('/').to_string();
        let cookies = self.cookies.unwrap_or_default();
        let tokens = self.tokens.unwrap_or_else(TokenStore::in_memory);

        let mut http = reqwest::Client::builder().cookie_provider(cookies.clone());
        if let Some(timeout) = self.timeout {
            http = http.timeout(timeout);
        }
        let http = http.build()?;

        let refresh_endpoint = parse_url(&base_url, REFRESH_PATH)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let refresher = RefreshCoordinator::new(
            http.clone(),
            refresh_endpoint,
            cookies.clone(),
            tokens.clone(),
            events.clone(),
        );

        Ok(SessionClient {
            inner: Arc::new(ClientInner {
                http,
                base_url,
                login_path: self.login_path,
                tokens,
                cookies,
                refresher,
                events,
            }),
        })
    }
}

/// HTTP client that keeps the bearer credential fresh on behalf of its
/// callers. Clones share the token store, cookie jar and refresh state.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("base_url", &self.inner.base_url)
            .finish_non_exhaustive()
    }
}

struct ClientInner {
    http: reqwest::Client,
    base_url: String,
    login_path: String,
    tokens: TokenStore,
    cookies: Arc<Jar>,
    refresher: RefreshCoordinator,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionClient {
    pub fn builder(base_url: impl Into<String>) -> SessionClientBuilder {
        SessionClientBuilder {
            base_url: base_url.into(),
            login_path: "/login".to_string(),
            tokens: None,
            timeout: None,
            cookies: None,
        }
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.inner.tokens
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Where to send the user once the session cannot be recovered.
    pub fn login_redirect(&self) -> String {
        let separator = if self.inner.login_path.contains('?') {
            '&'
        } else {
            '?'
        };
        format!(
            "{}{}{}",
            self.inner.login_path, separator, SESSION_EXPIRED_QUERY
        )
    }

    /// Refresh now, joining any refresh already in flight. Failure leaves
    /// the stored credential untouched.
    pub async fn refresh(&self) -> Result<Credential, SessionError> {
        let current = self.inner.tokens.get();
        Ok(self.inner.refresher.refresh(current).await?)
    }

    /// Run a request through the credential pipeline and return the raw
    /// response. Non-auth failures come back as `Ok` with their status.
    pub async fn execute(&self, request: &ApiRequest) -> Result<Response, SessionError> {
        let credential = self.authorize().await?;
        let response = self.dispatch(request, credential.as_ref()).await?;

        if response.status() != StatusCode::UNAUTHORIZED || request.is_auth_endpoint() {
            self.observe(request, response.status());
            return Ok(response);
        }

        debug!(method = %request.method, path = %request.path, "401 received, refreshing before retry");
        let refreshed = match self.inner.refresher.refresh(credential).await {
            Ok(credential) => credential,
            Err(e) => {
                warn!(path = %request.path, error = %e, "refresh after 401 failed");
                return Err(self.expire());
            }
        };

        // The retried request is never retried again.
        let retry = self.dispatch(request, Some(&refreshed)).await?;
        if retry.status() == StatusCode::UNAUTHORIZED {
            warn!(path = %request.path, "retry rejected with 401, ending session");
            return Err(self.expire());
        }
        self.observe(request, retry.status());
        Ok(retry)
    }

    /// Execute and decode a JSON body, turning non-2xx responses into
    /// [`SessionError::Status`].
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        request: &ApiRequest,
    ) -> Result<T, SessionError> {
        let response = ensure_success(self.execute(request).await?).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| SessionError::Decode(e.to_string()))
    }

    /// Execute a request whose response body is ignored.
    pub async fn send_empty(&self, request: &ApiRequest) -> Result<(), SessionError> {
        ensure_success(self.execute(request).await?).await?;
        Ok(())
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: impl Into<String>,
    ) -> Result<T, SessionError> {
        self.send_json(&ApiRequest::get(path)).await
    }

    async fn authorize(&self) -> Result<Option<Credential>, SessionError> {
        match self.inner.tokens.state() {
            CredentialState::Absent => Ok(None),
            CredentialState::Valid(credential) => Ok(Some(credential)),
            CredentialState::ExpiringSoon(credential) => {
                self.spawn_background_refresh(credential.clone());
                Ok(Some(credential))
            }
            CredentialState::Expired(credential) => {
                match self.inner.refresher.refresh(Some(credential)).await {
                    Ok(fresh) => Ok(Some(fresh)),
                    Err(e) => {
                        warn!(error = %e, "credential expired and could not be refreshed");
                        Err(self.expire())
                    }
                }
            }
        }
    }

    fn spawn_background_refresh(&self, stale: Credential) {
        let refresher = self.inner.refresher.clone();
        tokio::spawn(async move {
            if let Err(e) = refresher.refresh(Some(stale)).await {
                warn!(error = %e, "background credential refresh failed");
            }
        });
    }

    pub(crate) async fn dispatch(
        &self,
        request: &ApiRequest,
        credential: Option<&Credential>,
    ) -> Result<Response, SessionError> {
        let url = parse_url(&self.inner.base_url, &request.path)?;
        let mut builder = self.inner.http.request(request.method.clone(), url.clone());
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(credential) = credential {
            builder = builder.bearer_auth(credential.as_str());
        }
        if let Some(xsrf) = xsrf_token(&self.inner.cookies, &url) {
            builder = builder.header(XSRF_HEADER, xsrf);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        builder.send().await.map_err(|e| {
            warn!(
                class = ErrorClass::Network.as_str(),
                method = %request.method,
                path = %request.path,
                error = %e,
                "request failed"
            );
            SessionError::Network(e)
        })
    }

    fn observe(&self, request: &ApiRequest, status: StatusCode) {
        if status.is_success() {
            debug!(method = %request.method, path = %request.path, %status, "request completed");
        } else {
            warn!(
                class = ErrorClass::from_status(status).as_str(),
                method = %request.method,
                path = %request.path,
                %status,
                "request failed"
            );
        }
    }

    /// Terminal auth failure: drop the credential and announce the redirect.
    fn expire(&self) -> SessionError {
        self.inner.tokens.clear();
        let redirect_to = self.login_redirect();
        info!(redirect_to = %redirect_to, "session expired");
        let _ = self.inner.events.send(SessionEvent::Expired { redirect_to });
        SessionError::SessionExpired
    }

    pub(crate) fn set_credential(&self, credential: Credential) {
        self.inner.tokens.set(credential);
    }

    pub(crate) fn notify(&self, event: SessionEvent) {
        let _ = self.inner.events.send(event);
    }
}

async fn ensure_success(response: Response) -> Result<Response, SessionError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SessionError::Status {
        status,
        class: ErrorClass::from_status(status),
        body,
    })
}

fn parse_url(base_url: &str, path: &str) -> Result<Url, SessionError> {
    let joined = if path.starts_with('/') {
        format!("{base_url}{path}")
    } else {
        format!("{base_url}/{path}")
    };
    Url::parse(&joined).map_err(|e| SessionError::InvalidRequest(format!("{joined}: {e}")))
}

/// Value of the `XSRF-TOKEN` cookie the jar would send to `url`, if any.
pub(crate) fn xsrf_token(jar: &Jar, url: &Url) -> Option<String> {
    let header = jar.cookies(url)?;
    let header = header.to_str().ok()?;
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == XSRF_COOKIE)
        .map(|(_, value)| value.to_string())
}
