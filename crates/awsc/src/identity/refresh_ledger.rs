//! 📒 RefreshLedger — a tiny JSON diary of the last successful SSO acquisition.
//!
//! Only the non-secret bits go in: principal, timestamps, refresh handle. Keys and
//! tokens stay in memory. A restarted process reads the ledger, sees a handle that
//! has not expired yet, and tries a quiet refresh before forcing a browser login.
//!
//! 🎬 *[the cron job restarts at 3am. the browser is closed. the developer is asleep.
//! the ledger remembers the profile, the refresh goes through, and nobody is paged.]*
//!
//! 🧠 Knowledge graph:
//! - Writes go to a sibling temp file first, then a rename, so a crash mid-write
//!   leaves the previous entry readable.
//! - A missing or mangled ledger is not an error. It just means "no hint, log in".
//! - The refresher writes after every successful acquisition and never fails a
//!   refresh because the ledger couldn't be written.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{RefreshHandle, Session};

/// 📄 One row of the diary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub principal: String,
    pub last_refresh: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub refresh_handle: Option<RefreshHandle>,
}

impl LedgerEntry {
    pub fn from_session(session: &Session) -> Self {
        Self {
            principal: session.principal().to_string(),
            last_refresh: session.issued_at(),
            expires_at: session.expires_at(),
            refresh_handle: session.refresh_handle().cloned(),
        }
    }
}

/// 📒 File-backed ledger. Missing file = empty ledger. Broken file = empty ledger plus a warning.
#[derive(Debug, Clone)]
pub struct RefreshLedger {
    path: PathBuf,
}

impl RefreshLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read(&self) -> Option<LedgerEntry> {
        let the_bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "📒 no refresh ledger yet");
                return None;
            }
            Err(err) => {
                warn!(path = %self.path.display(), "📒 could not read refresh ledger: {err}");
                return None;
            }
        };
        match serde_json::from_slice(&the_bytes) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(path = %self.path.display(), "📒 refresh ledger is not valid JSON, ignoring it: {err}");
                None
            }
        }
    }

    /// ✍️ Writes `entry`, creating parent directories as needed. Written to a temp file then renamed.
    pub async fn record(&self, entry: &LedgerEntry) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let the_json = serde_json::to_vec_pretty(entry).map_err(std::io::Error::other)?;
        let the_staging_path = self.path.with_extension("tmp");
        tokio::fs::write(&the_staging_path, the_json).await?;
        tokio::fs::rename(&the_staging_path, &self.path).await?;
        debug!(path = %self.path.display(), principal = %entry.principal, "📒 refresh ledger updated");
        Ok(())
    }
}
