//! Bounded session pool with rotation
//!
//! The pool owns the sessions; everyone else refers to them by id. While the
//! pool is under capacity, new sessions are minted lazily; at capacity a
//! random usable session is handed out. Retired and unusable sessions are
//! evicted on access and replaced on the next request for a session.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;
use rand::prelude::IndexedRandom;
use serde::{Deserialize, Serialize};

use crate::events::{Event, EventManager};
use crate::storage::{KeyValueStore, StorageError};

use super::session::{Session, SessionModel, SessionOptions};

/// Default key under which the pool persists itself.
pub const DEFAULT_PERSIST_STATE_KEY: &str = "SESSION_POOL_STATE";

/// Tuning knobs for the session pool.
#[derive(Debug, Clone)]
pub struct SessionPoolOptions {
    pub max_pool_size: usize,
    pub session_options: SessionOptions,
    pub persistence_enabled: bool,
    pub persist_state_key: String,
}

impl Default for SessionPoolOptions {
    fn default() -> Self {
        Self {
            max_pool_size: 1000,
            session_options: SessionOptions::default(),
            persistence_enabled: false,
            persist_state_key: DEFAULT_PERSIST_STATE_KEY.to_string(),
        }
    }
}

/// Bounded pool of sessions indexed by id.
pub struct SessionPool {
    options: SessionPoolOptions,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    events: Option<Arc<EventManager>>,
}

impl SessionPool {
    #[must_use]
    pub fn new(options: SessionPoolOptions) -> Self {
        Self {
            options,
            sessions: Mutex::new(HashMap::new()),
            events: None,
        }
    }

    /// Attach an event manager; retirements are announced on it.
    #[must_use]
    pub fn with_events(mut self, events: Arc<EventManager>) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub fn options(&self) -> &SessionPoolOptions {
        &self.options
    }

    /// Get a usable session, minting one while the pool is under capacity.
    #[must_use]
    pub fn get_session(&self) -> Arc<Session> {
        let mut sessions = self.sessions.lock();
        Self::evict_unusable(&mut sessions);

        if sessions.len() < self.options.max_pool_size {
            let session = Arc::new(Session::new(&self.options.session_options));
            debug!("Minted session {}", session.id());
            sessions.insert(session.id().to_string(), Arc::clone(&session));
            return session;
        }

        let usable_ids: Vec<&String> = sessions
            .iter()
            .filter(|(_, session)| session.is_usable())
            .map(|(id, _)| id)
            .collect();

        if let Some(id) = usable_ids.choose(&mut rand::rng()) {
            return Arc::clone(&sessions[id.as_str()]);
        }

        // Everything at capacity is unusable; evict one arbitrarily and mint.
        if let Some(id) = sessions.keys().next().cloned() {
            sessions.remove(&id);
        }
        let session = Arc::new(Session::new(&self.options.session_options));
        sessions.insert(session.id().to_string(), Arc::clone(&session));
        session
    }

    /// Get the exact session a request is bound to. Returns `None` when the
    /// session has been retired and purged (a request collision).
    #[must_use]
    pub fn get_session_by_id(&self, id: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get(id).cloned();
        match session {
            Some(session) if session.is_usable() => Some(session),
            Some(_) => {
                sessions.remove(id);
                None
            }
            None => None,
        }
    }

    /// Retire a session and evict it from the pool.
    pub fn retire_session(&self, session: &Arc<Session>) {
        session.retire();
        self.sessions.lock().remove(session.id());
        info!("Retired session {}", session.id());
        if let Some(events) = &self.events {
            events.emit(Event::SessionRetired {
                session_id: session.id().to_string(),
            });
        }
    }

    fn evict_unusable(sessions: &mut HashMap<String, Arc<Session>>) {
        sessions.retain(|_, session| session.is_usable());
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    #[must_use]
    pub fn usable_session_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|session| session.is_usable())
            .count()
    }

    #[must_use]
    pub fn retired_session_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|session| !session.is_usable())
            .count()
    }

    /// Snapshot for persistence.
    #[must_use]
    pub fn to_model(&self) -> SessionPoolModel {
        let sessions = self.sessions.lock();
        SessionPoolModel {
            persistence_enabled: self.options.persistence_enabled,
            persist_state_key: self.options.persist_state_key.clone(),
            max_pool_size: self.options.max_pool_size,
            session_count: sessions.len(),
            usable_session_count: sessions.values().filter(|s| s.is_usable()).count(),
            retired_session_count: sessions.values().filter(|s| !s.is_usable()).count(),
            sessions: sessions.values().map(|s| s.to_model()).collect(),
        }
    }

    /// Replace pool contents from a persisted snapshot, dropping sessions
    /// that are no longer usable.
    pub fn restore_from_model(&self, model: SessionPoolModel) {
        let mut sessions = self.sessions.lock();
        sessions.clear();
        for session_model in model.sessions {
            let session = Arc::new(Session::from_model(session_model));
            if session.is_usable() {
                sessions.insert(session.id().to_string(), session);
            }
        }
        info!("Restored {} usable sessions from persisted state", sessions.len());
    }

    /// Persist the pool under its configured key.
    pub async fn persist(&self, store: &dyn KeyValueStore) -> Result<(), StorageError> {
        let model = self.to_model();
        let value = serde_json::to_value(&model)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        store.set(&self.options.persist_state_key, value).await
    }

    /// Restore the pool from its configured key, if a snapshot exists.
    pub async fn restore(&self, store: &dyn KeyValueStore) -> Result<(), StorageError> {
        if let Some(value) = store.get(&self.options.persist_state_key).await? {
            let model: SessionPoolModel = serde_json::from_value(value)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            self.restore_from_model(model);
        }
        Ok(())
    }
}

/// Persisted form of the whole pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPoolModel {
    pub persistence_enabled: bool,
    pub persist_state_key: String,
    pub max_pool_size: usize,
    pub session_count: usize,
    pub usable_session_count: usize,
    pub retired_session_count: usize,
    #[serde(default)]
    pub sessions: Vec<SessionModel>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(max_pool_size: usize) -> SessionPool {
        SessionPool::new(SessionPoolOptions {
            max_pool_size,
            ..SessionPoolOptions::default()
        })
    }

    #[test]
    fn pool_mints_lazily_up_to_capacity() {
        let pool = small_pool(3);
        let a = pool.get_session();
        let b = pool.get_session();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.session_count(), 2);
    }

    #[test]
    fn at_capacity_pool_reuses_sessions() {
        let pool = small_pool(2);
        let _a = pool.get_session();
        let _b = pool.get_session();
        let c = pool.get_session();
        assert_eq!(pool.session_count(), 2);
        assert!(pool
            .get_session_by_id(c.id())
            .is_some_and(|s| s.id() == c.id()));
    }

    #[test]
    fn retired_sessions_are_evicted_and_replaced() {
        let pool = small_pool(1);
        let session = pool.get_session();
        pool.retire_session(&session);
        assert_eq!(pool.session_count(), 0);
        let replacement = pool.get_session();
        assert_ne!(replacement.id(), session.id());
    }

    #[test]
    fn get_session_by_id_returns_none_for_purged_session() {
        let pool = small_pool(2);
        let session = pool.get_session();
        let id = session.id().to_string();
        pool.retire_session(&session);
        assert!(pool.get_session_by_id(&id).is_none());
    }

    #[test]
    fn blocked_session_is_purged_on_lookup() {
        let pool = small_pool(2);
        let session = pool.get_session();
        session.retire();
        assert!(pool.get_session_by_id(session.id()).is_none());
        assert_eq!(pool.session_count(), 0);
    }

    #[test]
    fn model_round_trip() {
        let pool = small_pool(4);
        let session = pool.get_session();
        session.mark_bad();

        let model = pool.to_model();
        assert_eq!(model.session_count, 1);

        let restored = small_pool(4);
        restored.restore_from_model(model);
        assert_eq!(restored.session_count(), 1);
        let back = restored
            .get_session_by_id(session.id())
            .expect("usable session restored");
        assert_eq!(back.error_score(), 1.0);
    }
}
