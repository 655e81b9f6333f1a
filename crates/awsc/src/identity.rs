//! 🔐 Identity — SSO sessions, where they live, and how they get renewed.
//!
//! 🎬 *[a token expires mid-upload. somewhere, a 403 is born.]*
//!
//! 🧠 Knowledge graph:
//! - `Session`: one time-bounded credential set. Immutable. Replaced whole, never patched.
//! - `SessionState`: VALID / EXPIRING / EXPIRED relative to `now` and a safety margin.
//! - `CredentialStore` (credential_store.rs): the process-wide slot holding the current `Arc<Session>`.
//! - `IdentityRefresher` (refresher.rs): keeps that slot full of something VALID.
//! - `RefreshLedger` (refresh_ledger.rs): remembers non-secret session metadata across restarts.
//! - The identity provider itself is `backends::IdentityClient`.

mod credential_store;
mod refresh_ledger;
mod refresher;

pub use credential_store::CredentialStore;
pub use refresh_ledger::{LedgerEntry, RefreshLedger};
pub use refresher::{IdentityRefresher, RefresherSettings};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// 🗝️ The key/secret/token triple. `Debug` never prints the secret or the token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl Credentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// 🎟️ Opaque handle the identity provider accepts for a cheap, non-interactive refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefreshHandle(pub String);

impl RefreshHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 🚦 Where a session sits on its way to the grave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Valid,
    Expiring,
    Expired,
}

/// 🎫 One identity session. Built once, read many times, replaced when stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    principal: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    credentials: Credentials,
    refresh_handle: Option<RefreshHandle>,
}

impl Session {
    /// 🏗️ Builds a session, enforcing `expires_at > issued_at`.
    pub fn new(
        principal: impl Into<String>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        credentials: Credentials,
        refresh_handle: Option<RefreshHandle>,
    ) -> Result<Self, AuthError> {
        if expires_at <= issued_at {
            return Err(AuthError::InvalidSession {
                message: format!(
                    "expires_at ({expires_at}) must be strictly after issued_at ({issued_at})"
                ),
            });
        }
        Ok(Self {
            principal: principal.into(),
            issued_at,
            expires_at,
            credentials,
            refresh_handle,
        })
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn refresh_handle(&self) -> Option<&RefreshHandle> {
        self.refresh_handle.as_ref()
    }

    /// 🚦 VALID while `now < expires_at - margin`, EXPIRING inside the margin, EXPIRED at or past expiry.
    pub fn state_at(&self, now: DateTime<Utc>, safety_margin: Duration) -> SessionState {
        if now >= self.expires_at {
            SessionState::Expired
        } else if now >= self.expires_at - safety_margin {
            SessionState::Expiring
        } else {
            SessionState::Valid
        }
    }

    pub fn state(&self, safety_margin: Duration) -> SessionState {
        self.state_at(Utc::now(), safety_margin)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn the_session_expiring_at(expires_at: DateTime<Utc>) -> Session {
        Session::new(
            "dev@example.com",
            expires_at - Duration::hours(8),
            expires_at,
            Credentials::new("AKIA", "secret", None),
            None,
        )
        .expect("💀 valid by construction")
    }

    #[test]
    fn the_one_where_sessions_age_through_all_three_states() {
        let the_expiry = Utc::now() + Duration::hours(1);
        let the_session = the_session_expiring_at(the_expiry);
        let the_margin = Duration::minutes(5);

        assert_eq!(
            the_session.state_at(the_expiry - Duration::minutes(30), the_margin),
            SessionState::Valid
        );
        assert_eq!(
            the_session.state_at(the_expiry - Duration::minutes(5), the_margin),
            SessionState::Expiring
        );
        assert_eq!(
            the_session.state_at(the_expiry - Duration::seconds(1), the_margin),
            SessionState::Expiring
        );
        assert_eq!(the_session.state_at(the_expiry, the_margin), SessionState::Expired);
    }

    #[test]
    fn the_one_where_time_travel_sessions_are_refused() {
        let the_now = Utc::now();
        let the_result = Session::new(
            "dev",
            the_now,
            the_now,
            Credentials::new("AKIA", "secret", None),
            None,
        );
        assert!(matches!(the_result, Err(AuthError::InvalidSession { .. })));
    }

    #[test]
    fn the_one_where_debug_output_keeps_its_secrets() {
        let the_creds = Credentials::new("AKIAVISIBLE", "very-secret", Some("tok".to_string()));
        let the_debug = format!("{the_creds:?}");
        assert!(the_debug.contains("AKIAVISIBLE"));
        assert!(!the_debug.contains("very-secret"));
        assert!(!the_debug.contains("tok\""));
    }
}
