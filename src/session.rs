use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::auth::generate_token;

/// Session
///
/// Server-side half of a browser sign-in. The cookie only carries a signed reference
/// to `id`; everything else lives here.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub user_id: i64,
    pub csrf_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// SessionStore
///
/// The session collaborator. Implementations must be safe for concurrent use and must
/// not hold a lock across an await point.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, user_id: i64, ttl: Duration) -> Session;
    /// Returns the live session with this id. Expired sessions are dropped and reported
    /// as absent.
    async fn get(&self, id: Uuid) -> Option<Session>;
    async fn destroy(&self, id: Uuid);
    /// Removes every expired session, returning how many were dropped.
    async fn purge_expired(&self) -> usize;
}

pub type SessionState = Arc<dyn SessionStore>;

/// MemorySessionStore
///
/// Process-local session table. Sessions do not survive a restart.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<Uuid, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, user_id: i64, ttl: Duration) -> Session {
        let session = Session {
            id: Uuid::new_v4(),
            user_id,
            csrf_token: generate_token(),
            expires_at: Utc::now() + ttl,
        };
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.insert(session.id, session.clone());
        session
    }

    async fn get(&self, id: Uuid) -> Option<Session> {
        let now = Utc::now();
        let found = {
            let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            sessions.get(&id).cloned()
        }?;
        if found.is_expired(now) {
            self.destroy(id).await;
            return None;
        }
        Some(found)
    }

    async fn destroy(&self, id: Uuid) {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.remove(&id);
    }

    async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired(now));
        before - sessions.len()
    }
}
