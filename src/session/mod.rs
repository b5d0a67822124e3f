use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Duration;
use tracing::debug;

use crate::clock::Clock;
use crate::error::{Result, WorkbenchError};
use crate::models::{Session, SessionLifetime};

pub mod cookie;

/// Session lifecycle. Every implementation keeps single-operation contracts
/// atomic with respect to concurrent callers.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Inserts, or replaces a session with the same id.
    async fn create(&self, session: Session) -> Result<()>;
    /// Returns the record whatever its expiry.
    async fn get(&self, id: &str) -> Result<Session>;
    /// Replaces an existing record, carrying creation data forward.
    async fn update(&self, session: Session) -> Result<Session>;
    /// Idempotent.
    async fn delete(&self, id: &str) -> Result<()>;
    async fn validate(&self, id: &str) -> Result<Session>;
    /// Most recently created live session for `username`.
    async fn get_by_username(&self, username: &str) -> Result<Session>;
    async fn exists(&self, id: &str) -> Result<bool>;
    async fn invalidate_user(&self, username: &str) -> Result<usize>;
    async fn sweep_expired(&self) -> Result<usize>;
    async fn clear(&self) -> Result<()>;
}

/// Lifetimes handed to new sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    pub short_ttl: u64,
    pub long_ttl: u64,
}

impl SessionPolicy {
    pub fn ttl(&self, lifetime: SessionLifetime) -> u64 {
        match lifetime {
            SessionLifetime::Short => self.short_ttl,
            SessionLifetime::Long => self.long_ttl,
        }
    }

    pub fn new_session(
        &self,
        clock: &dyn Clock,
        id: String,
        username: &str,
        encrypted_password: Vec<u8>,
        lifetime: SessionLifetime,
    ) -> Session {
        let created_at = clock.now();
        let ttl = i64::try_from(self.ttl(lifetime)).unwrap_or(i64::MAX / 1_000);
        Session {
            id,
            username: username.to_string(),
            encrypted_password,
            created_at,
            expires_at: created_at + Duration::seconds(ttl),
            lifetime,
            metadata_role: username.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Stored {
    session: Session,
    seq: u64,
}

#[derive(Debug, Default)]
struct Sessions {
    by_id: HashMap<String, Stored>,
    /// username -> (creation seq, id), oldest first
    by_user: HashMap<String, Vec<(u64, String)>>,
    next_seq: u64,
}

impl Sessions {
    fn unindex(&mut self, username: &str, id: &str) {
        if let Some(ids) = self.by_user.get_mut(username) {
            ids.retain(|(_, existing)| existing != id);
            if ids.is_empty() {
                self.by_user.remove(username);
            }
        }
    }

    fn remove(&mut self, id: &str) -> Option<Stored> {
        let stored = self.by_id.remove(id)?;
        self.unindex(&stored.session.username, id);
        Some(stored)
    }
}

pub struct MemorySessionStore {
    clock: Arc<dyn Clock>,
    sessions: RwLock<Sessions>,
}

impl MemorySessionStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            sessions: RwLock::new(Sessions::default()),
        }
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.sessions.read().map_err(WorkbenchError::poisoned)?.by_id.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: Session) -> Result<()> {
        let mut sessions = self.sessions.write().map_err(WorkbenchError::poisoned)?;
        sessions.remove(&session.id);
        let seq = sessions.next_seq;
        sessions.next_seq += 1;
        sessions
            .by_user
            .entry(session.username.clone())
            .or_default()
            .push((seq, session.id.clone()));
        debug!(username = %session.username, lifetime = ?session.lifetime, "session created");
        sessions.by_id.insert(session.id.clone(), Stored { session, seq });
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Session> {
        let sessions = self.sessions.read().map_err(WorkbenchError::poisoned)?;
        sessions
            .by_id
            .get(id)
            .map(|stored| stored.session.clone())
            .ok_or(WorkbenchError::SessionNotFound)
    }

    async fn update(&self, mut session: Session) -> Result<Session> {
        let mut sessions = self.sessions.write().map_err(WorkbenchError::poisoned)?;
        let previous = sessions.by_id.get(&session.id).cloned().ok_or(WorkbenchError::SessionNotFound)?;

        session.created_at = previous.session.created_at;
        if session.encrypted_password.is_empty() {
            session.encrypted_password = previous.session.encrypted_password.clone();
        }
        if session.metadata_role.is_empty() {
            session.metadata_role = previous.session.metadata_role.clone();
        }
        if session.username != previous.session.username {
            sessions.unindex(&previous.session.username, &session.id);
            let mut ids = sessions.by_user.remove(&session.username).unwrap_or_default();
            ids.push((previous.seq, session.id.clone()));
            ids.sort_unstable();
            sessions.by_user.insert(session.username.clone(), ids);
        }
        sessions.by_id.insert(
            session.id.clone(),
            Stored {
                session: session.clone(),
                seq: previous.seq,
            },
        );
        Ok(session)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.sessions.write().map_err(WorkbenchError::poisoned)?.remove(id);
        Ok(())
    }

    async fn validate(&self, id: &str) -> Result<Session> {
        let now = self.clock.now();
        let session = self.get(id).await?;
        if session.expires_at <= now {
            return Err(WorkbenchError::SessionExpired);
        }
        Ok(session)
    }

    async fn get_by_username(&self, username: &str) -> Result<Session> {
        let now = self.clock.now();
        let sessions = self.sessions.read().map_err(WorkbenchError::poisoned)?;
        let ids = sessions.by_user.get(username).ok_or(WorkbenchError::SessionNotFound)?;
        ids.iter()
            .rev()
            .filter_map(|(_, id)| sessions.by_id.get(id))
            .map(|stored| &stored.session)
            .find(|session| session.expires_at > now)
            .cloned()
            .ok_or(WorkbenchError::SessionExpired)
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let now = self.clock.now();
        let sessions = self.sessions.read().map_err(WorkbenchError::poisoned)?;
        Ok(sessions.by_id.get(id).is_some_and(|stored| stored.session.expires_at > now))
    }

    async fn invalidate_user(&self, username: &str) -> Result<usize> {
        let mut sessions = self.sessions.write().map_err(WorkbenchError::poisoned)?;
        let ids = sessions.by_user.remove(username).unwrap_or_default();
        for (_, id) in &ids {
            sessions.by_id.remove(id);
        }
        debug!(username, removed = ids.len(), "user sessions invalidated");
        Ok(ids.len())
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let candidates: Vec<String> = {
            let sessions = self.sessions.read().map_err(WorkbenchError::poisoned)?;
            sessions
                .by_id
                .values()
                .filter(|stored| stored.session.expires_at <= now)
                .map(|stored| stored.session.id.clone())
                .collect()
        };

        let mut removed = 0;
        for id in candidates {
            let mut sessions = self.sessions.write().map_err(WorkbenchError::poisoned)?;
            // re-check: the id may have been recreated since the snapshot
            let still_expired = sessions
                .by_id
                .get(&id)
                .is_some_and(|stored| stored.session.expires_at <= now);
            if still_expired {
                sessions.remove(&id);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "expired sessions swept");
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<()> {
        let mut sessions = self.sessions.write().map_err(WorkbenchError::poisoned)?;
        sessions.by_id.clear();
        sessions.by_user.clear();
        Ok(())
    }
}
