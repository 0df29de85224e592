//! Process-wide holder for the current bearer credential.
//!
//! The store is cheap to clone; clones share the same slot. When created with
//! a file path the token is mirrored to disk so a restarted client picks the
//! session back up.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::credential::{Credential, CredentialState, DEFAULT_REFRESH_LOOKAHEAD_SECS};

#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<Inner>,
}

struct Inner {
    slot: RwLock<Option<Credential>>,
    path: Option<PathBuf>,
    lookahead: Duration,
}

impl TokenStore {
    pub fn new(path: Option<PathBuf>, lookahead: Duration) -> Self {
        let initial = path.as_deref().and_then(load_token);
        Self {
            inner: Arc::new(Inner {
                slot: RwLock::new(initial),
                path,
                lookahead,
            }),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None, Duration::seconds(DEFAULT_REFRESH_LOOKAHEAD_SECS))
    }

    /// Store backed by `path`; an existing token there is loaded immediately.
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self::new(
            Some(path.into()),
            Duration::seconds(DEFAULT_REFRESH_LOOKAHEAD_SECS),
        )
    }

    pub fn get(&self) -> Option<Credential> {
        self.inner
            .slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, credential: Credential) {
        if let Some(path) = &self.inner.path {
            if let Err(e) = save_token(path, credential.as_str()) {
                warn!(path = %path.display(), error = %e, "failed to persist credential");
            }
        }
        *self
            .inner
            .slot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(credential);
    }

    pub fn clear(&self) {
        self.inner
            .slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(path) = &self.inner.path {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "removed persisted credential"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove credential file"),
            }
        }
    }

    pub fn is_expired(&self, credential: &Credential) -> bool {
        credential.is_expired_at(Utc::now())
    }

    pub fn is_expiring_soon(&self, credential: &Credential) -> bool {
        credential.is_expiring_soon_at(Utc::now(), self.inner.lookahead)
    }

    pub fn lookahead(&self) -> Duration {
        self.inner.lookahead
    }

    pub fn state(&self) -> CredentialState {
        self.state_at(Utc::now())
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> CredentialState {
        match self.get() {
            Some(credential) => credential.state_at(now, self.inner.lookahead),
            None => CredentialState::Absent,
        }
    }

    /// True when both handles share the same slot.
    pub fn same_store(&self, other: &TokenStore) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

fn load_token(path: &Path) -> Option<Credential> {
    let contents = std::fs::read_to_string(path).ok()?;
    let token = contents.trim();
    if token.is_empty() {
        return None;
    }
    debug!(path = %path.display(), "loaded persisted credential");
    Some(Credential::new(token))
}

fn save_token(path: &Path, token: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, token)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
