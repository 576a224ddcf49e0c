//! In-memory coordination service
//!
//! Sessions and key tags live in a process-local table. Expiry is measured
//! on tokio's clock, so tests running with paused time observe TTL lapses
//! deterministically. Keys held by an expired or destroyed session are
//! deleted along with it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::{CoordinationClient, LeaseError, SessionId};

#[derive(Debug)]
struct SessionEntry {
    ttl: Duration,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    sessions: HashMap<SessionId, SessionEntry>,
    keys: HashMap<String, SessionId>,
    sessions_created: u64,
    unavailable: bool,
    failing_renewals: u32,
    failing_releases: u32,
}

impl CoordinatorState {
    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, entry)| now > entry.expires_at)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            debug!(session = %id, "Session expired");
            self.drop_session(&id);
        }
    }

    fn drop_session(&mut self, id: &SessionId) {
        self.sessions.remove(id);
        self.keys.retain(|_, holder| holder != id);
    }

    fn check_available(&self) -> Result<(), LeaseError> {
        if self.unavailable {
            Err(LeaseError::Transport("coordination service unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Process-local coordination service with session TTLs
#[derive(Debug, Default)]
pub struct InMemoryCoordinator {
    state: Mutex<CoordinatorState>,
}

impl InMemoryCoordinator {
    /// Create an empty coordinator
    pub fn new() -> Self {
        Self::default()
    }

    /// Session currently holding `key`, if any
    pub fn holder(&self, key: &str) -> Option<SessionId> {
        let mut state = self.state.lock();
        state.purge_expired(Instant::now());
        state.keys.get(key).cloned()
    }

    /// Number of sessions that are still alive
    pub fn live_sessions(&self) -> usize {
        let mut state = self.state.lock();
        state.purge_expired(Instant::now());
        state.sessions.len()
    }

    /// Total sessions ever created
    pub fn sessions_created(&self) -> u64 {
        self.state.lock().sessions_created
    }

    /// Make every call fail with a transport error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Fail the next `count` renewals with a transport error
    pub fn fail_next_renewals(&self, count: u32) {
        self.state.lock().failing_renewals = count;
    }

    /// Fail the next `count` key releases with a transport error
    pub fn fail_next_releases(&self, count: u32) {
        self.state.lock().failing_releases = count;
    }

    /// Expire a session immediately, as if its TTL lapsed
    pub fn expire_session(&self, session: &SessionId) {
        self.state.lock().drop_session(session);
    }
}

#[async_trait]
impl CoordinationClient for InMemoryCoordinator {
    async fn create_session(&self, ttl: Duration) -> Result<SessionId, LeaseError> {
        let mut state = self.state.lock();
        state.check_available()?;

        let id = SessionId::new(Uuid::new_v4().to_string());
        state.sessions.insert(
            id.clone(),
            SessionEntry {
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        state.sessions_created += 1;
        Ok(id)
    }

    async fn renew_session(&self, session: &SessionId) -> Result<(), LeaseError> {
        let mut state = self.state.lock();
        state.check_available()?;
        if state.failing_renewals > 0 {
            state.failing_renewals -= 1;
            return Err(LeaseError::Transport("renewal rejected".to_string()));
        }

        let now = Instant::now();
        state.purge_expired(now);
        match state.sessions.get_mut(session) {
            Some(entry) => {
                entry.expires_at = now + entry.ttl;
                Ok(())
            }
            None => Err(LeaseError::SessionExpired {
                session: session.to_string(),
            }),
        }
    }

    async fn destroy_session(&self, session: &SessionId) -> Result<(), LeaseError> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.drop_session(session);
        Ok(())
    }

    async fn acquire_key(&self, key: &str, session: &SessionId) -> Result<bool, LeaseError> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.purge_expired(Instant::now());

        if !state.sessions.contains_key(session) {
            return Err(LeaseError::SessionExpired {
                session: session.to_string(),
            });
        }

        match state.keys.get(key) {
            Some(holder) if holder != session => Ok(false),
            Some(_) => Ok(true),
            None => {
                state.keys.insert(key.to_string(), session.clone());
                Ok(true)
            }
        }
    }

    async fn release_key(&self, key: &str, session: &SessionId) -> Result<bool, LeaseError> {
        let mut state = self.state.lock();
        state.check_available()?;
        if state.failing_releases > 0 {
            state.failing_releases -= 1;
            return Err(LeaseError::Transport("release rejected".to_string()));
        }
        state.purge_expired(Instant::now());

        match state.keys.get(key) {
            Some(holder) if holder == session => {
                state.keys.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_key_is_exclusive_between_sessions() {
        let coordinator = InMemoryCoordinator::new();
        let a = coordinator.create_session(Duration::from_secs(30)).await.unwrap();
        let b = coordinator.create_session(Duration::from_secs(30)).await.unwrap();

        assert!(coordinator.acquire_key("k", &a).await.unwrap());
        assert!(coordinator.acquire_key("k", &a).await.unwrap());
        assert!(!coordinator.acquire_key("k", &b).await.unwrap());
        assert!(!coordinator.release_key("k", &b).await.unwrap());
        assert!(coordinator.release_key("k", &a).await.unwrap());
        assert!(coordinator.acquire_key("k", &b).await.unwrap());
    }

    #[tokio::test]
    async fn test_destroying_session_frees_its_keys() {
        let coordinator = InMemoryCoordinator::new();
        let a = coordinator.create_session(Duration::from_secs(30)).await.unwrap();
        coordinator.acquire_key("k", &a).await.unwrap();

        coordinator.destroy_session(&a).await.unwrap();
        coordinator.destroy_session(&a).await.unwrap();

        assert_eq!(coordinator.holder("k"), None);
        assert_eq!(coordinator.live_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_expires_without_renewal() {
        let coordinator = InMemoryCoordinator::new();
        let a = coordinator.create_session(Duration::from_secs(10)).await.unwrap();
        coordinator.acquire_key("k", &a).await.unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(coordinator.holder("k"), None);
        let err = coordinator.renew_session(&a).await.unwrap_err();
        assert!(matches!(err, LeaseError::SessionExpired { .. }));
    }
}
