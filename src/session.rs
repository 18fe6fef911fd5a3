//! Session map (C3/C5/C6 shared).
//!
//! Sessions are kept in a process-wide map keyed by id; eviction is by
//! explicit close or TTL. This is the second of the two permitted
//! process-wide globals (§9), mirroring the scheduler's `started` guard.

use crate::dd::DdState;
use crate::message_bus::MessageBus;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// What kind of orchestration owns this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Dd,
    Roundtable,
}

/// A live session: creation time, frozen config snapshot reference, bus,
/// and (for DD sessions) the state machine's current state.
pub struct Session {
    pub id: String,
    pub kind: SessionKind,
    pub created_at: DateTime<Utc>,
    pub bus: Arc<MessageBus>,
    pub dd_state: Option<DdState>,
}

impl Session {
    pub fn new(id: impl Into<String>, kind: SessionKind, max_message_history: usize) -> Self {
        Self {
            id: id.into(),
            kind,
            created_at: Utc::now(),
            bus: Arc::new(MessageBus::new(max_message_history)),
            dd_state: None,
        }
    }

    pub fn is_expired(&self, ttl: chrono::Duration) -> bool {
        Utc::now() - self.created_at > ttl
    }
}

lazy_static! {
    static ref SESSIONS: Mutex<HashMap<String, Arc<Mutex<Session>>>> = Mutex::new(HashMap::new());
}

/// Process-wide session registry. A thin typed wrapper over the shared map so
/// call sites don't reach into the `lazy_static!` directly.
pub struct SessionRegistry;

impl SessionRegistry {
    pub async fn insert(session: Session) -> Arc<Mutex<Session>> {
        let id = session.id.clone();
        let handle = Arc::new(Mutex::new(session));
        SESSIONS.lock().await.insert(id, handle.clone());
        handle
    }

    pub async fn get(id: &str) -> Option<Arc<Mutex<Session>>> {
        SESSIONS.lock().await.get(id).cloned()
    }

    pub async fn close(id: &str) -> bool {
        SESSIONS.lock().await.remove(id).is_some()
    }

    pub async fn len() -> usize {
        SESSIONS.lock().await.len()
    }

    /// Evict sessions older than `ttl`. Call periodically from a maintenance
    /// task; not invoked automatically by this registry.
    pub async fn evict_expired(ttl: chrono::Duration) -> usize {
        let mut sessions = SESSIONS.lock().await;
        let mut expired = Vec::new();
        for (id, handle) in sessions.iter() {
            if handle.lock().await.is_expired(ttl) {
                expired.push(id.clone());
            }
        }
        let count = expired.len();
        for id in expired {
            sessions.remove(&id);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_and_get_roundtrip() {
        let id = format!("session-test-{}", uuid::Uuid::new_v4());
        let session = Session::new(id.clone(), SessionKind::Roundtable, 1000);
        SessionRegistry::insert(session).await;
        assert!(SessionRegistry::get(&id).await.is_some());
        assert!(SessionRegistry::close(&id).await);
        assert!(SessionRegistry::get(&id).await.is_none());
    }

    #[tokio::test]
    async fn evict_expired_removes_old_sessions() {
        let id = format!("session-test-{}", uuid::Uuid::new_v4());
        let session = Session::new(id.clone(), SessionKind::Dd, 1000);
        SessionRegistry::insert(session).await;
        let evicted = SessionRegistry::evict_expired(chrono::Duration::zero()).await;
        assert!(evicted >= 1);
        assert!(SessionRegistry::get(&id).await.is_none());
    }
}
