// ai
//! 🔄 IdentityRefresher — keeps the `CredentialStore` stocked with something VALID.
//!
//! 🎬 *[the session has four minutes left. the upload has forty chunks. nobody panics.]*
//!
//! The decision tree, in the order it happens:
//! 1. Current session VALID? Hand it back. Same `Arc`, no provider call.
//! 2. Take the single-flight gate, then look again. Someone may have refreshed while we queued.
//! 3. Have a refresh handle (session first, ledger second)? Try `refresh(handle)`.
//!    - handle rejected ⇒ fall through to `login()`
//!    - credentials rejected ⇒ `AuthError::Rejected`, done, no retries, no login
//! 4. No handle? `login()`.
//! 5. Transient failures retry with backoff inside each call; running out ⇒ `AuthError::Exhausted`.
//! 6. Install the new session in the store, then jot it in the ledger (best effort).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{CredentialStore, LedgerEntry, RefreshHandle, RefreshLedger, Session, SessionState};
use crate::backends::{IdentityClient, IdentityFailure};
use crate::error::AuthError;
use crate::retry::{BackoffPolicy, retry_transient, with_timeout};

/// 🔧 Knobs for the refresher.
#[derive(Debug, Clone)]
pub struct RefresherSettings {
    pub backoff: BackoffPolicy,
    /// Sessions closer than this to expiry count as EXPIRING and get refreshed early.
    pub safety_margin: chrono::Duration,
    /// Deadline for a single `refresh` call.
    pub call_timeout: Duration,
    /// Deadline for a single `login` call. Usually generous: a human may be involved.
    pub login_timeout: Duration,
}

impl Default for RefresherSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            safety_margin: chrono::Duration::minutes(5),
            call_timeout: Duration::from_secs(60),
            login_timeout: Duration::from_secs(300),
        }
    }
}

/// 🔄 The only thing in the crate allowed to talk to the identity provider.
#[derive(Debug)]
pub struct IdentityRefresher {
    client: Arc<dyn IdentityClient>,
    store: CredentialStore,
    settings: RefresherSettings,
    ledger: Option<RefreshLedger>,
    gate: tokio::sync::Mutex<()>,
    last_refresh: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

/// A provider call that did not produce a session, plus how many attempts it took.
struct CallFailure {
    failure: IdentityFailure,
    attempts: u32,
}

impl CallFailure {
    fn into_auth_error(self) -> AuthError {
        match self.failure {
            IdentityFailure::Transient(message) => AuthError::Exhausted {
                attempts: self.attempts,
                message,
            },
            IdentityFailure::HandleRejected(message) | IdentityFailure::CredentialsRejected(message) => {
                AuthError::Rejected { message }
            }
        }
    }
}

impl IdentityRefresher {
    pub fn new(client: Arc<dyn IdentityClient>, store: CredentialStore, settings: RefresherSettings) -> Self {
        Self {
            client,
            store,
            settings,
            ledger: None,
            gate: tokio::sync::Mutex::new(()),
            last_refresh: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_ledger(mut self, ledger: RefreshLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn settings(&self) -> &RefresherSettings {
        &self.settings
    }

    /// 🎯 A session that is VALID right now, acquiring or refreshing one if needed.
    pub async fn ensure_valid(&self) -> Result<Arc<Session>, AuthError> {
        if let Some(the_session) = self.valid_session() {
            return Ok(the_session);
        }

        let _the_gate = self.gate.lock().await;
        if let Some(the_session) = self.valid_session() {
            debug!("🔄 another caller already refreshed the session");
            return Ok(the_session);
        }

        let the_handle = match self.store.current() {
            Some(stale) => {
                debug!(
                    principal = stale.principal(),
                    state = ?stale.state(self.settings.safety_margin),
                    "🔄 session needs renewing"
                );
                stale.refresh_handle().cloned()
            }
            None => self.handle_from_ledger().await,
        };

        let the_session = self.acquire(the_handle).await?;
        let the_installed = self.store.replace(the_session);
        *self.last_refresh.lock() = Some(the_installed.issued_at());
        self.remember(&the_installed).await;
        Ok(the_installed)
    }

    /// 🗑️ Forget the current session; the next `ensure_valid` goes back to the provider.
    pub fn invalidate(&self) {
        self.store.invalidate();
    }

    /// ⏱️ When a session was last acquired: this process first, the ledger second.
    pub async fn last_refresh(&self) -> Option<DateTime<Utc>> {
        if let Some(at) = *self.last_refresh.lock() {
            return Some(at);
        }
        match &self.ledger {
            Some(ledger) => ledger.read().await.map(|entry| entry.last_refresh),
            None => None,
        }
    }

    fn valid_session(&self) -> Option<Arc<Session>> {
        self.store
            .current()
            .filter(|session| session.state(self.settings.safety_margin) == SessionState::Valid)
    }

    async fn handle_from_ledger(&self) -> Option<RefreshHandle> {
        let the_entry = self.ledger.as_ref()?.read().await?;
        debug!(
            principal = %the_entry.principal,
            last_refresh = %the_entry.last_refresh,
            "📒 found a previous session in the refresh ledger"
        );
        the_entry.refresh_handle
    }

    async fn acquire(&self, handle: Option<RefreshHandle>) -> Result<Session, AuthError> {
        if let Some(handle) = handle {
            match self.refresh_with_retries(&handle).await {
                Ok(session) => {
                    info!(principal = session.principal(), expires_at = %session.expires_at(), "🔄 session refreshed");
                    return Ok(session);
                }
                Err(CallFailure {
                    failure: IdentityFailure::HandleRejected(message),
                    ..
                }) => {
                    warn!("🔄 refresh handle rejected, falling back to a full login: {message}");
                }
                Err(other) => return Err(other.into_auth_error()),
            }
        }

        let the_session = self.login_with_retries().await.map_err(CallFailure::into_auth_error)?;
        info!(principal = the_session.principal(), expires_at = %the_session.expires_at(), "🔐 logged in");
        Ok(the_session)
    }

    async fn refresh_with_retries(&self, handle: &RefreshHandle) -> Result<Session, CallFailure> {
        let the_outcome = retry_transient(&self.settings.backoff, "identity refresh", move |_| async move {
            with_timeout(self.settings.call_timeout, self.client.refresh(handle))
                .await
                .unwrap_or_else(|timed_out| Err(IdentityFailure::Transient(format!("refresh {timed_out}"))))
        })
        .await;
        let the_attempts = the_outcome.attempts;
        the_outcome.result.map_err(|failure| CallFailure {
            failure,
            attempts: the_attempts,
        })
    }

    async fn login_with_retries(&self) -> Result<Session, CallFailure> {
        let the_outcome = retry_transient(&self.settings.backoff, "identity login", move |_| async move {
            with_timeout(self.settings.login_timeout, self.client.login())
                .await
                .unwrap_or_else(|timed_out| Err(IdentityFailure::Transient(format!("login {timed_out}"))))
        })
        .await;
        let the_attempts = the_outcome.attempts;
        the_outcome.result.map_err(|failure| CallFailure {
            failure,
            attempts: the_attempts,
        })
    }

    async fn remember(&self, session: &Session) {
        let Some(ledger) = &self.ledger else {
            return;
        };
        if let Err(err) = ledger.record(&LedgerEntry::from_session(session)).await {
            warn!(path = %ledger.path().display(), "📒 could not update the refresh ledger: {err}");
        }
    }
}
