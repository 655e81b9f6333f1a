// human
//! 🗄️ CredentialStore — one slot, one session, many readers.
//!
//! 🎬 *[forty workers reach for the credentials at once. one of them is the refresher,
//! holding a brand new session. nobody gets a key from Tuesday and a token from Wednesday.]*
//!
//! Replacement swaps an `Arc` under a write lock, so a reader either gets the old
//! session or the new one. Never half of each. The lock is held for a pointer copy,
//! not for I/O, so `current()` never waits on anything slow.
//!
//! 🧠 Knowledge graph:
//! - The store only holds. Deciding *when* a session needs replacing is the refresher's job.
//! - Readers keep their `Arc<Session>` for as long as one request takes. A swap mid-request
//!   doesn't pull the rug, the old session just stops being handed out.
//! - `invalidate()` empties the slot. The next `ensure_valid()` then goes through the
//!   whole refresh-or-login dance.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::Session;

/// 🗄️ Process-wide holder of the current `Session`. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    slot: Arc<RwLock<Option<Arc<Session>>>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of the current session, if any.
    pub fn current(&self) -> Option<Arc<Session>> {
        self.slot.read().clone()
    }

    /// Atomically installs `session` and returns the shared handle to it.
    pub fn replace(&self, session: Session) -> Arc<Session> {
        let the_session = Arc::new(session);
        let the_previous = self.slot.write().replace(Arc::clone(&the_session));
        debug!(
            principal = the_session.principal(),
            expires_at = %the_session.expires_at(),
            replaced = the_previous.is_some(),
            "🔐 session installed"
        );
        the_session
    }

    /// Drops the current session. The next `ensure_valid` will acquire a fresh one.
    pub fn invalidate(&self) {
        if self.slot.write().take().is_some() {
            debug!("🗑️ session invalidated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::test_support::session_for;
    use chrono::Duration;

    #[test]
    fn the_one_where_the_store_starts_empty_and_fills_up() {
        let the_store = CredentialStore::new();
        assert!(the_store.current().is_none());

        let the_installed = the_store.replace(session_for("alice", Duration::hours(1), None));
        let the_current = the_store.current().expect("💀 just installed it");
        assert!(Arc::ptr_eq(&the_installed, &the_current));

        the_store.invalidate();
        assert!(the_store.current().is_none());
    }

    #[test]
    fn the_one_where_clones_share_the_same_slot() {
        let the_store = CredentialStore::new();
        let the_twin = the_store.clone();
        the_store.replace(session_for("bob", Duration::hours(1), None));
        assert_eq!(the_twin.current().map(|s| s.principal().to_string()), Some("bob".to_string()));
    }

    #[test]
    fn the_one_where_readers_never_see_a_frankensession() {
        let the_store = CredentialStore::new();
        the_store.replace(session_for("p0", Duration::hours(1), Some("h0")));

        let the_writer = {
            let the_store = the_store.clone();
            std::thread::spawn(move || {
                for i in 1..500 {
                    let the_name = format!("p{i}");
                    let the_handle = format!("h{i}");
                    the_store.replace(session_for(&the_name, Duration::hours(1), Some(&the_handle)));
                }
            })
        };

        let the_readers: Vec<_> = (0..4)
            .map(|_| {
                let the_store = the_store.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let the_snapshot = the_store.current().expect("💀 never empty here");
                        let the_suffix = &the_snapshot.principal()[1..];
                        let the_handle = the_snapshot.refresh_handle().expect("💀 always set").as_str();
                        assert_eq!(&the_handle[1..], the_suffix, "principal and handle must match");
                    }
                })
            })
            .collect();

        the_writer.join().expect("💀 writer panicked");
        for reader in the_readers {
            reader.join().expect("💀 reader panicked");
        }
    }
}
