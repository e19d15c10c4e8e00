//! Session registry: every open session, keyed by id.
//!
//! Written by the acceptor (insert) and by session teardown (remove); read by
//! the shutdown coordinator. Sealing happens in the same critical section as
//! the shutdown snapshot, so no session can register after it was enumerated.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

use super::session::{SessionHandle, SessionId};

/// Registry refusal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Shutdown has already enumerated the registry.
    #[error("session registry is sealed for shutdown")]
    Sealed,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Arc<SessionHandle>>,
    sealed: bool,
}

/// Process-wide set of open sessions.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<Inner>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session.
    pub async fn insert(&self, session: Arc<SessionHandle>) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        if inner.sealed {
            return Err(RegistryError::Sealed);
        }
        let _ = inner.sessions.insert(*session.id(), session);
        Ok(())
    }

    /// Unregister a session.
    pub async fn remove(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.inner.write().await.sessions.remove(id)
    }

    /// Look up a session.
    pub async fn get(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.inner.read().await.sessions.get(id).cloned()
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Whether no session is registered.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.sessions.is_empty()
    }

    /// All registered sessions.
    pub async fn snapshot(&self) -> Vec<Arc<SessionHandle>> {
        self.inner.read().await.sessions.values().cloned().collect()
    }

    /// Refuse further inserts and return every session registered so far.
    pub async fn seal_and_snapshot(&self) -> Vec<Arc<SessionHandle>> {
        let mut inner = self.inner.write().await;
        inner.sealed = true;
        inner.sessions.values().cloned().collect()
    }

    /// Whether shutdown has sealed the registry.
    pub async fn is_sealed(&self) -> bool {
        self.inner.read().await.sealed
    }
}
