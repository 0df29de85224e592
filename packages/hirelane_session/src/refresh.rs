//! Single-flight credential refresh.
//!
//! Proactive (background) and reactive (401) refreshes both go through
//! [`RefreshCoordinator::refresh`]. At most one refresh request is on the wire
//! at a time; callers arriving while it is pending await the same shared
//! future and receive its outcome. The refresh itself runs on its own task
//! and leaves the in-flight slot as it finishes, so a cancelled caller can
//! never strand a finished outcome for later callers to reuse.

use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use reqwest::Url;
use reqwest::cookie::Jar;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::client::{SessionEvent, XSRF_HEADER, xsrf_token};
use crate::credential::{Credential, CredentialState};
use crate::error::RefreshError;
use crate::token_store::TokenStore;

type RefreshFuture = Shared<BoxFuture<'static, Result<Credential, RefreshError>>>;

/// Body of `POST /auth/refresh-token`.
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    token: String,
}

#[derive(Clone)]
pub(crate) struct RefreshCoordinator {
    http: reqwest::Client,
    endpoint: Url,
    cookies: Arc<Jar>,
    tokens: TokenStore,
    events: broadcast::Sender<SessionEvent>,
    in_flight: Arc<Mutex<InFlight>>,
}

#[derive(Default)]
struct InFlight {
    generation: u64,
    current: Option<(u64, RefreshFuture)>,
}

impl RefreshCoordinator {
    pub(crate) fn new(
        http: reqwest::Client,
        endpoint: Url,
        cookies: Arc<Jar>,
        tokens: TokenStore,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            http,
            endpoint,
            cookies,
            tokens,
            events,
            in_flight: Arc::new(Mutex::new(InFlight::default())),
        }
    }

    /// Refresh the credential, joining any refresh already in flight.
    ///
    /// `stale` is the credential the caller saw when it decided to refresh.
    /// If the store already holds a different, fully valid credential by the
    /// time a new refresh would start, that credential is returned instead of
    /// issuing another network call.
    pub(crate) async fn refresh(
        &self,
        stale: Option<Credential>,
    ) -> Result<Credential, RefreshError> {
        let flight = {
            let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match &slot.current {
                Some((generation, flight)) => {
                    debug!(generation, "joining in-flight credential refresh");
                    flight.clone()
                }
                None => {
                    slot.generation += 1;
                    let generation = slot.generation;
                    let flight = self.start(generation, stale);
                    slot.current = Some((generation, flight.clone()));
                    flight
                }
            }
        };

        flight.await
    }

    fn start(&self, generation: u64, stale: Option<Credential>) -> RefreshFuture {
        let this = self.clone();
        let task = tokio::spawn(async move {
            let outcome = this.run(stale).await;
            this.finish(generation);
            outcome
        });
        async move {
            task.await.unwrap_or_else(|e| {
                Err(RefreshError::Network(format!("refresh task failed: {e}")))
            })
        }
        .boxed()
        .shared()
    }

    /// Vacate the slot if it still holds this generation's flight.
    fn finish(&self, generation: u64) {
        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if slot
            .current
            .as_ref()
            .is_some_and(|(g, _)| *g == generation)
        {
            slot.current = None;
        }
    }

    async fn run(&self, stale: Option<Credential>) -> Result<Credential, RefreshError> {
        if let CredentialState::Valid(current) = self.tokens.state() {
            if stale.as_ref() != Some(&current) {
                debug!("credential already renewed by another caller");
                return Ok(current);
            }
        }

        let mut request = self.http.post(self.endpoint.clone());
        if let Some(current) = self.tokens.get() {
            request = request.bearer_auth(current.as_str());
        }
        if let Some(xsrf) = xsrf_token(&self.cookies, &self.endpoint) {
            request = request.header(XSRF_HEADER, xsrf);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(RefreshError::Rejected(status.as_u16()));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;
        let credential = Credential::new(body.token);
        if self.tokens.is_expired(&credential) {
            return Err(RefreshError::InvalidResponse(
                "refresh returned an expired or malformed token".into(),
            ));
        }

        self.tokens.set(credential.clone());
        info!(expires_at = ?credential.expires_at(), "credential refreshed");
        let _ = self.events.send(SessionEvent::Refreshed);
        Ok(credential)
    }
}
