//! Bearer credentials and expiry introspection.
//!
//! A credential is an opaque JWT-shaped bearer token. The client never
//! validates the signature; it only decodes the `exp` claim so it can tell
//! whether the token should be refreshed before use, and the user id claim
//! so callers know who is signed in. Anything that cannot be decoded is
//! treated as already expired.

use std::fmt;

use chrono::{DateTime, Duration, TimeZone, Utc};
use data_encoding::BASE64URL_NOPAD;

/// Default window before expiry in which a credential counts as expiring soon.
pub const DEFAULT_REFRESH_LOOKAHEAD_SECS: i64 = 300;

/// A bearer token together with its decoded expiry.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    expires_at: Option<DateTime<Utc>>,
    subject: Option<String>,
}

impl Credential {
    /// Wrap a raw token, decoding its expiry once.
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        let claims = decode_claims(&token);
        let expires_at = claims.as_ref().and_then(expiry_claim);
        let subject = claims.as_ref().and_then(subject_claim);
        Self {
            token,
            expires_at,
            subject,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }

    /// Decoded `exp` claim, or `None` when the token is malformed.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// The signed-in user's id, from the `id`, `userId` or `sub` claim.
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// Malformed credentials fail closed.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(exp) => now >= exp,
            None => true,
        }
    }

    /// True for `now` in `[exp - lookahead, exp)`.
    pub fn is_expiring_soon_at(&self, now: DateTime<Utc>, lookahead: Duration) -> bool {
        match self.expires_at {
            Some(exp) => now < exp && now >= exp - lookahead,
            None => false,
        }
    }

    /// Time left before expiry; zero once expired or malformed.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        match self.expires_at {
            Some(exp) if exp > now => exp - now,
            _ => Duration::zero(),
        }
    }

    /// Classify this credential at `now`.
    pub fn state_at(&self, now: DateTime<Utc>, lookahead: Duration) -> CredentialState {
        if self.is_expired_at(now) {
            CredentialState::Expired(self.clone())
        } else if self.is_expiring_soon_at(now, lookahead) {
            CredentialState::ExpiringSoon(self.clone())
        } else {
            CredentialState::Valid(self.clone())
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("subject", &self.subject)
            .finish()
    }
}

/// The single state a stored credential is in at a given instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialState {
    Absent,
    Valid(Credential),
    ExpiringSoon(Credential),
    Expired(Credential),
}

impl CredentialState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Valid(_) => "valid",
            Self::ExpiringSoon(_) => "expiring_soon",
            Self::Expired(_) => "expired",
        }
    }

    /// The credential if it may still be attached to a request.
    pub fn usable(&self) -> Option<&Credential> {
        match self {
            Self::Valid(c) | Self::ExpiringSoon(c) => Some(c),
            Self::Absent | Self::Expired(_) => None,
        }
    }
}

fn decode_claims(token: &str) -> Option<serde_json::Value> {
    let mut segments = token.split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }
    let bytes = BASE64URL_NOPAD
        .decode(payload.trim_end_matches('=').as_bytes())
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn expiry_claim(claims: &serde_json::Value) -> Option<DateTime<Utc>> {
    let exp = claims.get("exp")?;
    let secs = exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64))?;
    Utc.timestamp_opt(secs, 0).single()
}

fn subject_claim(claims: &serde_json::Value) -> Option<String> {
    ["id", "userId", "sub"]
        .iter()
        .filter_map(|key| claims.get(*key))
        .find_map(|value| match value {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}
