//! Session registry.
//!
//! Three logical indexes over the session set, maintained atomically under
//! one lock:
//! - primary: UUID → session
//! - (application name, resolved commit) → alive session, used for build
//!   deduplication
//! - application name → alive count, used for concurrency admission
//!
//! The secondary indexes are recomputed from the primary on every mutation;
//! the session population is bounded by the concurrency caps, so the
//! recomputation stays cheap and can never drift out of sync.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::models::{Application, KillReason, Session, SessionRecord};
use crate::types::{SessionUuid, Sha};

use super::persistence::SessionPersistence;

#[derive(Default)]
struct Indexes {
    by_uuid: HashMap<SessionUuid, Arc<Session>>,
    alive_by_checkout: HashMap<(String, Sha), Arc<Session>>,
    alive_count_by_application: HashMap<String, usize>,
}

impl Indexes {
    fn rebuild_secondary(&mut self) {
        self.alive_by_checkout.clear();
        self.alive_count_by_application.clear();
        for session in self.by_uuid.values() {
            if !session.status().is_alive() {
                continue;
            }
            *self
                .alive_count_by_application
                .entry(session.application_name.clone())
                .or_insert(0) += 1;

            // A session being replaced must not satisfy the dedup lookup:
            // its replacement is allowed to build on the same commit.
            if session.kill_reason() == KillReason::Replaced {
                continue;
            }
            if let Some(commit_id) = session.commit_id() {
                self.alive_by_checkout
                    .insert((session.application_name.clone(), commit_id), Arc::clone(session));
            }
        }
    }
}

/// In-memory registry of sessions with a best-effort persistence hook.
pub struct SessionStore {
    inner: Mutex<Indexes>,
    persistence: Box<dyn SessionPersistence>,
}

impl SessionStore {
    pub fn new(persistence: Box<dyn SessionPersistence>) -> Self {
        SessionStore {
            inner: Mutex::new(Indexes::default()),
            persistence,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Indexes> {
        self.inner.lock().expect("session store lock poisoned")
    }

    fn persist_alive(&self, indexes: &Indexes) {
        let records: Vec<SessionRecord> = indexes
            .by_uuid
            .values()
            .filter(|session| session.status().is_alive())
            .map(|session| session.to_record())
            .collect();
        self.persistence.persist(&records);
    }

    /// Inserts a new session and indexes it.
    pub fn add(&self, session: Arc<Session>) {
        let mut indexes = self.lock();
        indexes.by_uuid.insert(session.uuid, session);
        indexes.rebuild_secondary();
        self.persist_alive(&indexes);
    }

    /// Re-indexes a session after a visible state change (status, commit,
    /// kill reason) and invokes the persistence hook.
    pub fn update(&self, session: &Arc<Session>) {
        let mut indexes = self.lock();
        // Sessions mutate in place; the primary index entry is already
        // current. Only the derived indexes need refreshing.
        if !indexes.by_uuid.contains_key(&session.uuid) {
            indexes.by_uuid.insert(session.uuid, Arc::clone(session));
        }
        indexes.rebuild_secondary();
        self.persist_alive(&indexes);
    }

    /// Removes a session once it reached a terminal status and cleanup is
    /// done.
    pub fn delete(&self, uuid: SessionUuid) {
        let mut indexes = self.lock();
        indexes.by_uuid.remove(&uuid);
        indexes.rebuild_secondary();
        self.persist_alive(&indexes);
    }

    pub fn get_by_uuid(&self, uuid: SessionUuid) -> Option<Arc<Session>> {
        self.lock().by_uuid.get(&uuid).cloned()
    }

    pub fn get_all_alive_sessions(&self) -> Vec<Arc<Session>> {
        self.lock()
            .by_uuid
            .values()
            .filter(|session| session.status().is_alive())
            .cloned()
            .collect()
    }

    /// Total alive sessions across all applications.
    pub fn alive_count(&self) -> usize {
        self.lock()
            .alive_count_by_application
            .values()
            .sum()
    }

    /// Alive sessions for one application.
    pub fn alive_by_application_count(&self, application: &Application) -> usize {
        self.lock()
            .alive_count_by_application
            .get(&application.name)
            .copied()
            .unwrap_or(0)
    }

    /// The live session matching (application, resolved commit), excluding
    /// sessions killed with reason `Replaced`.
    pub fn get_alive_application_session_by_checkout(
        &self,
        commit_id: &Sha,
        application: &Application,
    ) -> Option<Arc<Session>> {
        self.lock()
            .alive_by_checkout
            .get(&(application.name.clone(), commit_id.clone()))
            .cloned()
    }

    pub fn get_by_application_name(&self, name: &str) -> Vec<Arc<Session>> {
        self.lock()
            .by_uuid
            .values()
            .filter(|session| session.application_name == name)
            .cloned()
            .collect()
    }

    /// Loads persisted records from the previous run.
    pub fn load_records(&self) -> Vec<SessionRecord> {
        self.persistence.load()
    }
}
