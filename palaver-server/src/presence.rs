//! In-memory presence registry.
//!
//! Maps connection IDs to authenticated sessions and enforces the
//! single-session-per-username invariant: the check-then-insert in
//! [`PresenceRegistry::admit`] happens under one lock acquisition, so
//! two racing logins for the same username can never both win.

use parking_lot::Mutex;
use std::collections::HashMap;

/// The authenticated identity behind one connection.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub username: String,
    pub is_admin: bool,
}

/// Username already has a live session on another connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("user is already online")]
pub struct AlreadyOnline;

#[derive(Default)]
pub struct PresenceRegistry {
    sessions: Mutex<HashMap<u64, SessionInfo>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a connection as `username`. Fails if any live session
    /// (including one on the same connection) already holds the name.
    pub fn admit(&self, conn_id: u64, username: &str, is_admin: bool) -> Result<(), AlreadyOnline> {
        let mut sessions = self.sessions.lock();
        if sessions.values().any(|s| s.username == username) {
            return Err(AlreadyOnline);
        }
        sessions.insert(
            conn_id,
            SessionInfo {
                username: username.to_string(),
                is_admin,
            },
        );
        Ok(())
    }

    /// Remove the session for a connection, returning the freed
    /// username so the caller can broadcast the departure.
    pub fn evict(&self, conn_id: u64) -> Option<String> {
        self.sessions.lock().remove(&conn_id).map(|s| s.username)
    }

    pub fn session(&self, conn_id: u64) -> Option<SessionInfo> {
        self.sessions.lock().get(&conn_id).cloned()
    }

    pub fn is_online(&self, username: &str) -> bool {
        self.sessions.lock().values().any(|s| s.username == username)
    }

    /// Snapshot of online usernames. Sorted so the order is stable
    /// within one snapshot.
    pub fn list_online(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sessions
            .lock()
            .values()
            .map(|s| s.username.clone())
            .collect();
        names.sort();
        names
    }
}
