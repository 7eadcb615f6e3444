// Session context: the explicitly constructed owner of a client's identity
// and open sessions, with an init/dispose lifecycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use cowrite_common::{ProfilePatch, UserProfile};
use tracing::debug;

use crate::config::ClientConfig;
use crate::manager::{CollabSession, SessionConfig, SessionManager};
use crate::transport::WsTransport;

pub struct SessionContext {
    manager: SessionManager,
    host: Option<String>,
    user: Mutex<UserProfile>,
    sessions: Mutex<HashMap<String, CollabSession>>,
    disposed: AtomicBool,
}

impl SessionContext {
    pub fn new(manager: SessionManager, host: Option<String>, user: UserProfile) -> Self {
        Self {
            manager,
            host,
            user: Mutex::new(user),
            sessions: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// WebSocket sessions configured from `config`.
    pub fn from_config(config: &ClientConfig) -> Self {
        let manager = SessionManager::new(WsTransport::with_policy(config.reconnect_policy()))
            .with_throttle(config.throttle());
        Self::new(manager, config.relay_host.clone(), config.profile())
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn user(&self) -> UserProfile {
        self.user.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Update the profile and push it to every open session.
    pub fn update_user(&self, patch: &ProfilePatch) {
        {
            let mut user = self.user.lock().unwrap_or_else(PoisonError::into_inner);
            *user = user.merged(patch);
        }
        for session in self.sessions().values() {
            session.update_local_user(patch);
        }
    }

    /// Start a session for `room`. An already-open session for the same room
    /// is stopped first. After [`SessionContext::dispose`] this returns a
    /// disabled session.
    pub fn open(&self, room: &str) -> CollabSession {
        let host = if self.is_disposed() { None } else { self.host.clone() };
        let previous = self.sessions().remove(room);
        if let Some(previous) = previous {
            debug!(room, "replacing open session");
            previous.stop();
        }

        let session =
            self.manager.start(SessionConfig::new(Some(room.to_string()), host, self.user()));
        if !self.is_disposed() {
            self.sessions().insert(room.to_string(), session.clone());
        }
        session
    }

    pub fn session(&self, room: &str) -> Option<CollabSession> {
        self.sessions().get(room).cloned()
    }

    pub fn open_rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.sessions().keys().cloned().collect();
        rooms.sort();
        rooms
    }

    /// Returns false if no session was open for `room`.
    pub fn close(&self, room: &str) -> bool {
        let session = self.sessions().remove(room);
        match session {
            Some(session) => {
                session.stop();
                true
            }
            None => false,
        }
    }

    /// Stop every session. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let sessions: Vec<CollabSession> = self.sessions().drain().map(|(_, s)| s).collect();
        debug!(count = sessions.len(), "disposing session context");
        for session in sessions {
            session.stop();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, CollabSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryRelay;

    fn context(relay: &MemoryRelay) -> SessionContext {
        SessionContext::new(
            SessionManager::new(relay.clone()),
            Some("relay.example".into()),
            UserProfile::new("Ava", "#60a5fa"),
        )
    }

    #[test]
    fn reopening_a_room_stops_the_old_session() {
        let relay = MemoryRelay::new();
        let ctx = context(&relay);

        let first = ctx.open("doc-1");
        let second = ctx.open("doc-1");

        assert!(first.is_stopped());
        assert!(!second.is_stopped());
        assert_eq!(relay.peer_count("doc-1"), 1);
        assert_eq!(ctx.open_rooms(), vec!["doc-1".to_string()]);
    }

    #[test]
    fn close_and_dispose_stop_sessions() {
        let relay = MemoryRelay::new();
        let ctx = context(&relay);
        let a = ctx.open("a");
        let b = ctx.open("b");

        assert!(ctx.close("a"));
        assert!(!ctx.close("a"));
        assert!(a.is_stopped());

        ctx.dispose();
        ctx.dispose();
        assert!(b.is_stopped());
        assert!(ctx.open_rooms().is_empty());
        assert!(!ctx.open("c").enabled());
    }

    #[test]
    fn profile_updates_reach_open_sessions() {
        let relay = MemoryRelay::new();
        let ctx = context(&relay);
        let session = ctx.open("doc-1");

        ctx.update_user(&ProfilePatch::name("Ava R."));
        assert_eq!(ctx.user().name, "Ava R.");
        let awareness = session.awareness().unwrap();
        let published: UserProfile = awareness.local_field("user").unwrap();
        assert_eq!(published.name, "Ava R.");
    }
}
